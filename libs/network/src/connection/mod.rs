//! Connection Establishment
//!
//! A [`Connection`] owns one stream (plain TCP or TLS) from the moment its
//! handshake succeeds. It moves through
//! `Connecting -> Handshaking -> Established -> Closed`; only established
//! connections are handed out.
//!
//! - [`Connection::connect`] makes a single dial attempt
//! - [`Connection::connect_to`] keeps dialing with a fixed delay until it
//!   succeeds or is canceled
//! - [`Connection::accept`] upgrades and handshakes an accepted socket
//!
//! [`Connection::into_split`] separates the stream into independently
//! buffered halves so one reader and one writer can run concurrently.

mod framed;
mod handshake;

pub use framed::{ConnectionReader, ConnectionWriter, IO_BUFFER_SIZE};
pub use handshake::{handshake, Role};

use crate::endpoint::Endpoint;
use crate::tls::{BoxedStream, TlsContext};
use crate::{Result, TransportError};
use hublink_codec::HubId;
use hublink_config::{defaults, HubConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Options applied to every connection a hub makes or accepts
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub local_hub: HubId,
    pub no_delay: bool,
    pub send_timeout: Option<Duration>,
    pub receive_timeout: Option<Duration>,
    pub handshake_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_message_size: usize,
    pub tls: Option<TlsContext>,
}

impl ConnectionOptions {
    pub fn new(local_hub: HubId) -> Self {
        Self {
            local_hub,
            no_delay: true,
            send_timeout: None,
            receive_timeout: None,
            handshake_timeout: Duration::from_millis(defaults::connection::HANDSHAKE_TIMEOUT_MS),
            reconnect_delay: Duration::from_millis(defaults::connection::RECONNECT_DELAY_MS),
            max_message_size: defaults::connection::MAX_MESSAGE_SIZE,
            tls: None,
        }
    }

    /// Build options from configuration, loading TLS material if configured
    pub fn from_config(local_hub: HubId, config: &HubConfig) -> Result<Self> {
        Ok(Self {
            local_hub,
            no_delay: config.socket.no_delay,
            send_timeout: config.send_timeout(),
            receive_timeout: config.receive_timeout(),
            handshake_timeout: config.handshake_timeout(),
            reconnect_delay: config.reconnect_delay(),
            max_message_size: config.connection.max_message_size,
            tls: TlsContext::from_config(config.tls.as_ref())?,
        })
    }

    fn tls_context(&self) -> Result<&TlsContext> {
        self.tls
            .as_ref()
            .ok_or_else(|| TransportError::configuration("tls:// endpoint without a [tls] section", Some("tls")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established,
    Closed,
}

/// An established, handshaken stream to a remote hub
pub struct Connection {
    stream: BoxedStream,
    state: ConnectionState,
    local_hub: HubId,
    remote_hub: HubId,
    remote_addr: Option<SocketAddr>,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
    max_message_size: usize,
}

impl Connection {
    /// One dial attempt: connect, upgrade, handshake as dialer
    pub async fn connect(endpoint: &Endpoint, options: &ConnectionOptions) -> Result<Self> {
        let address = endpoint.connect_address()?;
        debug!(%endpoint, state = ?ConnectionState::Connecting, "Dialing");

        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| TransportError::network_with_source(format!("Failed to connect to {}", endpoint), e))?;
        configure_socket(&stream, options);
        let remote_addr = stream.peer_addr().ok();

        let stream: BoxedStream = if endpoint.scheme().is_secure() {
            let tls = options.tls_context()?;
            within(Some(options.handshake_timeout), "tls handshake", tls.connect(endpoint.host(), stream)).await?
        } else {
            Box::new(stream)
        };

        debug!(%endpoint, state = ?ConnectionState::Handshaking, "Connected, exchanging hub ids");
        let (stream, remote_hub) =
            handshake(stream, &options.local_hub, Role::Dialer, options.handshake_timeout).await?;

        info!(%endpoint, remote = %remote_hub, "Connection established");
        Ok(Self::established(stream, remote_hub, remote_addr, options))
    }

    /// Dial until connected, waiting `reconnect_delay` between attempts
    ///
    /// Returns only on success or when `cancel` fires.
    pub async fn connect_to(endpoint: &Endpoint, options: &ConnectionOptions, cancel: &CancellationToken) -> Result<Self> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Canceled),
                result = Self::connect(endpoint, options) => result,
            };

            match result {
                Ok(connection) => return Ok(connection),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(
                        %endpoint,
                        attempt,
                        error = %e,
                        retry_in_ms = options.reconnect_delay.as_millis() as u64,
                        "Connect attempt failed"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Canceled),
                _ = tokio::time::sleep(options.reconnect_delay) => {}
            }
        }
    }

    /// Upgrade and handshake an accepted socket as acceptor
    ///
    /// The TLS upgrade and the id exchange are each bounded by
    /// `handshake_timeout`. On failure the stream is dropped, closing the socket.
    pub async fn accept(stream: TcpStream, options: &ConnectionOptions, secure: bool) -> Result<Self> {
        configure_socket(&stream, options);
        let remote_addr = stream.peer_addr().ok();

        let stream: BoxedStream = if secure {
            let tls = options.tls_context()?;
            within(Some(options.handshake_timeout), "tls handshake", tls.accept(stream)).await?
        } else {
            Box::new(stream)
        };

        let (stream, remote_hub) =
            handshake(stream, &options.local_hub, Role::Acceptor, options.handshake_timeout).await?;

        debug!(remote = %remote_hub, ?remote_addr, "Accepted connection");
        Ok(Self::established(stream, remote_hub, remote_addr, options))
    }

    fn established(
        stream: BoxedStream,
        remote_hub: HubId,
        remote_addr: Option<SocketAddr>,
        options: &ConnectionOptions,
    ) -> Self {
        Self {
            stream,
            state: ConnectionState::Established,
            local_hub: options.local_hub.clone(),
            remote_hub,
            remote_addr,
            send_timeout: options.send_timeout,
            receive_timeout: options.receive_timeout,
            max_message_size: options.max_message_size,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_hub(&self) -> &HubId {
        &self.local_hub
    }

    pub fn remote_hub(&self) -> &HubId {
        &self.remote_hub
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Split into independently buffered reader and writer halves
    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        let (read, write) = tokio::io::split(self.stream);
        let reader = ConnectionReader::new(
            read,
            self.remote_hub.clone(),
            self.remote_addr,
            self.receive_timeout,
            self.max_message_size,
        );
        let writer = ConnectionWriter::new(write, self.remote_hub, self.remote_addr, self.send_timeout);
        (reader, writer)
    }

    /// Close without splitting
    pub async fn shutdown(mut self) -> Result<()> {
        self.state = ConnectionState::Closed;
        self.stream
            .shutdown()
            .await
            .map_err(|e| TransportError::connection_with_source("Failed to shut down", self.remote_addr, e))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("local_hub", &self.local_hub)
            .field("remote_hub", &self.remote_hub)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

fn configure_socket(stream: &TcpStream, options: &ConnectionOptions) {
    if let Err(e) = stream.set_nodelay(options.no_delay) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
}

/// Bound `operation` by `limit` when one is configured
pub(crate) async fn within<T, F>(limit: Option<Duration>, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::timeout(operation, limit.as_millis() as u64))?,
        None => fut.await,
    }
}
