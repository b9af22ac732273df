//! Hub: the listen / dial surface
//!
//! A hub owns the local identity, the shared buffer pool and a cancellation
//! token that every listener and channel it creates runs under.

use crate::channel::Channel;
use crate::connection::{Connection, ConnectionOptions};
use crate::endpoint::Endpoint;
use crate::{Result, TransportError};
use hublink_codec::{BufferPool, HubId, Serializer};
use hublink_config::HubConfig;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed `accept` so a persistent error does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct Hub {
    id: HubId,
    config: HubConfig,
    options: ConnectionOptions,
    pool: BufferPool,
    cancel: CancellationToken,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

struct AcceptContext<S, B, A> {
    options: ConnectionOptions,
    pool: BufferPool,
    serializer: Arc<S>,
    on_before_accept: B,
    on_after_accept: A,
    secure: bool,
    cancel: CancellationToken,
}

impl Hub {
    /// Build a hub; the id is taken from `[hub] id` or generated
    pub fn new(config: HubConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| TransportError::configuration(e.to_string(), None))?;

        let id = match &config.hub.id {
            Some(id) => HubId::new(id.clone())?,
            None => HubId::random(),
        };
        let options = ConnectionOptions::from_config(id.clone(), &config)?;
        let pool = BufferPool::new(config.pool.segment_size, config.pool.max_retained);

        info!(hub = %id, "Hub created");
        Ok(Self {
            id,
            config,
            options,
            pool,
            cancel: CancellationToken::new(),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &HubId {
        &self.id
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Bind `endpoint` and accept peers until the hub shuts down
    ///
    /// For every successful handshake `on_before_accept` may veto the peer;
    /// otherwise a server channel is created, handed to `on_after_accept`
    /// (typically to install a callback), and only then started.
    pub async fn listen<S, B, A>(
        &self,
        endpoint: &Endpoint,
        serializer: Arc<S>,
        on_before_accept: B,
        on_after_accept: A,
    ) -> Result<SocketAddr>
    where
        S: Serializer,
        B: Fn(&HubId) -> bool + Send + Sync + 'static,
        A: Fn(&Channel<S>) + Send + Sync + 'static,
    {
        let secure = endpoint.scheme().is_secure();
        if secure && self.options.tls.is_none() {
            return Err(TransportError::configuration(
                format!("{} requires a [tls] section", endpoint),
                Some("tls"),
            ));
        }

        let bind = endpoint.bind_address();
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| TransportError::network_with_source(format!("Failed to bind {}", bind), e))?;
        let local_addr = listener.local_addr()?;
        info!(hub = %self.id, %endpoint, %local_addr, "Listening");

        let context = Arc::new(AcceptContext {
            options: self.options.clone(),
            pool: self.pool.clone(),
            serializer,
            on_before_accept,
            on_after_accept,
            secure,
            cancel: self.cancel.clone(),
        });
        let handle = tokio::spawn(accept_loop(listener, context));
        self.listeners.lock().push(handle);

        Ok(local_addr)
    }

    /// Client channel to `endpoint`; dials in the background and keeps redialing
    pub fn open_channel_to<S: Serializer>(&self, endpoint: Endpoint, serializer: Arc<S>) -> Result<Channel<S>> {
        endpoint.connect_address()?;
        if endpoint.scheme().is_secure() && self.options.tls.is_none() {
            return Err(TransportError::configuration(
                format!("{} requires a [tls] section", endpoint),
                Some("tls"),
            ));
        }

        debug!(hub = %self.id, %endpoint, "Opening channel");
        Ok(Channel::dial(
            endpoint,
            serializer,
            self.pool.clone(),
            self.options.clone(),
            &self.cancel,
        ))
    }

    /// Stop listeners and close every channel this hub created
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let listeners: Vec<_> = self.listeners.lock().drain(..).collect();
        for listener in listeners {
            let _ = listener.await;
        }
        info!(hub = %self.id, "Hub shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop<S, B, A>(listener: TcpListener, context: Arc<AcceptContext<S, B, A>>)
where
    S: Serializer,
    B: Fn(&HubId) -> bool + Send + Sync + 'static,
    A: Fn(&Channel<S>) + Send + Sync + 'static,
{
    loop {
        let accepted = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(accept_one(context.clone(), stream, peer));
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    debug!("Accept loop stopped");
}

async fn accept_one<S, B, A>(context: Arc<AcceptContext<S, B, A>>, stream: TcpStream, peer: SocketAddr)
where
    S: Serializer,
    B: Fn(&HubId) -> bool + Send + Sync + 'static,
    A: Fn(&Channel<S>) + Send + Sync + 'static,
{
    let accepted = tokio::select! {
        biased;
        _ = context.cancel.cancelled() => return,
        accepted = Connection::accept(stream, &context.options, context.secure) => accepted,
    };
    let connection = match accepted {
        Ok(connection) => connection,
        Err(e) => {
            debug!(%peer, error = %e, "Incoming connection failed before handshake completed");
            return;
        }
    };

    let remote_hub = connection.remote_hub().clone();
    if !(context.on_before_accept)(&remote_hub) {
        info!(%peer, remote = %remote_hub, "Connection rejected by accept filter");
        return;
    }

    let channel = Channel::detached(
        remote_hub,
        context.serializer.clone(),
        context.pool.clone(),
        context.options.clone(),
        &context.cancel,
    );
    (context.on_after_accept)(&channel);

    if let Err(e) = channel.attach(connection) {
        debug!(%peer, error = %e, "Channel closed before its connection was attached");
        return;
    }

    // Server channels live as long as their connection
    channel.closed().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use hublink_codec::TextSerializer;

    #[test]
    fn test_configured_id_is_used() {
        let mut config = HubConfig::default();
        config.hub.id = Some("alpha".to_string());
        let hub = Hub::new(config).unwrap();
        assert_eq!(hub.id().as_str(), "alpha");
        assert_eq!(hub.pool().segment_size(), 4096);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = HubConfig::default();
        config.connection.handshake_timeout_ms = 0;
        assert!(matches!(Hub::new(config), Err(TransportError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_open_channel_rejects_wildcard_and_tls_without_config() {
        let hub = Hub::new(HubConfig::default()).unwrap();
        let serializer = Arc::new(TextSerializer);
        assert!(hub.open_channel_to(Endpoint::tcp("*", 9000), serializer.clone()).is_err());
        assert!(hub.open_channel_to(Endpoint::tls("localhost", 9000), serializer.clone()).is_err());

        let err = hub
            .listen(&Endpoint::tls("127.0.0.1", 0), serializer, |_| true, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[tokio::test]
    async fn test_listen_reports_bound_address() {
        let hub = Hub::new(HubConfig::default()).unwrap();
        let addr = hub
            .listen(&"tcp://*:0".parse().unwrap(), Arc::new(TextSerializer), |_| true, |_| {})
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);
        hub.shutdown().await;
        assert!(hub.is_shut_down());
    }
}
