//! Channel: a duplex message pump over a replaceable connection
//!
//! Each channel owns one [`Session`] and at most one live connection. A
//! supervisor task owns the reader/writer loop pair for the current
//! connection:
//!
//! - a new connection (from [`Channel::replace_connection`] or the client's
//!   dialer) stops the current loops and starts fresh ones on it
//! - when a loop fails, both loops of that connection stop; a client channel
//!   dials again, a server channel closes
//!
//! Messages still queued in the session survive a reconnect. A message the
//! writer had already taken off the queue when its connection failed is
//! dropped.

use crate::connection::{Connection, ConnectionOptions, ConnectionReader, ConnectionWriter};
use crate::endpoint::Endpoint;
use crate::metrics::{ChannelMetrics, MetricsSnapshot};
use crate::session::Session;
use crate::{Result, TransportError};
use hublink_codec::{BufferPool, HubId, MessageHeader, MessageId, Serializer, WIRE_HEADER_SIZE};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Writes between forced flushes when the outgoing queue never drains
pub const FLUSH_BATCH: usize = 64;

/// Bound on the final flush when a writer loop stops
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    Closed,
}

/// Client channels redial on failure; server channels close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Client,
    Server,
}

struct Shared<S: Serializer> {
    label: String,
    role: ChannelRole,
    local_hub: HubId,
    remote_hub: RwLock<Option<HubId>>,
    endpoint: Option<Endpoint>,
    options: ConnectionOptions,
    pool: BufferPool,
    session: Arc<Session<S>>,
    state: watch::Sender<ChannelState>,
    cancel: CancellationToken,
    connections: mpsc::UnboundedSender<Connection>,
    metrics: Arc<ChannelMetrics>,
}

/// Handle to a channel; clones share it
///
/// Dropping the last handle closes the channel. A callback that needs to
/// post on its own channel should capture a [`WeakChannel`]: a strong clone
/// inside the callback keeps the channel open until [`Channel::close`] or
/// the owning hub shuts down.
pub struct Channel<S: Serializer> {
    shared: Arc<Shared<S>>,
    _guard: Arc<DropGuard>,
}

impl<S: Serializer> Clone for Channel<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _guard: self._guard.clone(),
        }
    }
}

/// Non-owning handle from [`Channel::downgrade`]
pub struct WeakChannel<S: Serializer> {
    shared: Weak<Shared<S>>,
    guard: Weak<DropGuard>,
}

impl<S: Serializer> Clone for WeakChannel<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<S: Serializer> WeakChannel<S> {
    /// The channel, unless every strong handle is gone
    pub fn upgrade(&self) -> Option<Channel<S>> {
        Some(Channel {
            _guard: self.guard.upgrade()?,
            shared: self.shared.upgrade()?,
        })
    }
}

impl<S: Serializer> Channel<S> {
    /// Client channel that dials `endpoint` in the background and redials on failure
    pub fn dial(
        endpoint: Endpoint,
        serializer: Arc<S>,
        pool: BufferPool,
        options: ConnectionOptions,
        parent: &CancellationToken,
    ) -> Self {
        let label = format!("{}->{}", options.local_hub, endpoint);
        Self::spawn(label, ChannelRole::Client, Some(endpoint), None, serializer, pool, options, parent)
    }

    /// Server channel with no connection yet; start it with [`Channel::attach`]
    pub fn detached(
        remote_hub: HubId,
        serializer: Arc<S>,
        pool: BufferPool,
        options: ConnectionOptions,
        parent: &CancellationToken,
    ) -> Self {
        let label = format!("{}<-{}", options.local_hub, remote_hub);
        Self::spawn(label, ChannelRole::Server, None, Some(remote_hub), serializer, pool, options, parent)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        label: String,
        role: ChannelRole,
        endpoint: Option<Endpoint>,
        remote_hub: Option<HubId>,
        serializer: Arc<S>,
        pool: BufferPool,
        options: ConnectionOptions,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let metrics = Arc::new(ChannelMetrics::new());
        let session = Session::start(label.clone(), serializer, pool.clone(), metrics.clone(), cancel.child_token());
        let (connections, incoming) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Connecting);

        let shared = Arc::new(Shared {
            label,
            role,
            local_hub: options.local_hub.clone(),
            remote_hub: RwLock::new(remote_hub),
            endpoint,
            options,
            pool,
            session,
            state,
            cancel: cancel.clone(),
            connections,
            metrics,
        });

        tokio::spawn(supervise(shared.clone(), incoming));

        Self {
            shared,
            _guard: Arc::new(cancel.drop_guard()),
        }
    }

    pub fn downgrade(&self) -> WeakChannel<S> {
        WeakChannel {
            shared: Arc::downgrade(&self.shared),
            guard: Arc::downgrade(&self._guard),
        }
    }

    /// Queue `data` for sending; returns its id immediately
    ///
    /// Pass [`MessageId::EMPTY`] as `reply_to` for a message that is not a reply.
    pub fn post(&self, data: S::Item, reply_to: MessageId) -> MessageId {
        self.shared.session.enqueue_outgoing(data, reply_to)
    }

    /// Post with a hook that sees the id before the message can be sent
    pub(crate) fn post_tracked<F>(&self, data: S::Item, reply_to: MessageId, on_assigned: F) -> MessageId
    where
        F: FnOnce(MessageId),
    {
        self.shared.session.enqueue_outgoing_with(data, reply_to, on_assigned)
    }

    /// Install or replace the per-message callback
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(MessageHeader, S::Item) + Send + Sync + 'static,
    {
        self.shared.session.set_callback(Arc::new(callback));
    }

    /// Start a detached channel on its first connection
    pub fn attach(&self, connection: Connection) -> Result<()> {
        self.replace_connection(connection)
    }

    /// Swap in a new connection, stopping the loops of the current one
    pub fn replace_connection(&self, connection: Connection) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(TransportError::connection("Channel is closed", connection.remote_addr()));
        }
        self.shared
            .connections
            .send(connection)
            .map_err(|_| TransportError::connection("Channel supervisor has stopped", None))
    }

    /// Close the channel and wait until its loops and workers stopped
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        self.closed().await;
    }

    /// Resolves once the channel is closed
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ChannelState::Closed).await;
    }

    /// Wait until a connection is established
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut state = self.shared.state.subscribe();
        let wait = async {
            let reached = state
                .wait_for(|s| *s != ChannelState::Connecting)
                .await
                .map(|s| *s)
                .unwrap_or(ChannelState::Closed);
            match reached {
                ChannelState::Connected => Ok(()),
                _ => Err(TransportError::connection("Channel closed before connecting", None)),
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TransportError::timeout("wait for connection", timeout.as_millis() as u64))?
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    pub fn role(&self) -> ChannelRole {
        self.shared.role
    }

    pub fn local_hub(&self) -> &HubId {
        &self.shared.local_hub
    }

    /// Hub id of the peer, once a handshake has completed
    pub fn remote_hub(&self) -> Option<HubId> {
        self.shared.remote_hub.read().clone()
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.shared.endpoint.as_ref()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Messages posted but not yet handed to the socket
    pub fn queued_outgoing(&self) -> usize {
        self.shared.session.queued_outgoing()
    }
}

impl<S: Serializer> std::fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.shared.label)
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish()
    }
}

/// Reader and writer tasks for one connection
struct LoopSet {
    stop: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LoopSet {
    fn start<S: Serializer>(shared: &Arc<Shared<S>>, connection: Connection) -> Self {
        let stop = shared.cancel.child_token();
        let (reader, writer) = connection.into_split();
        Self {
            reader: tokio::spawn(read_loop(shared.clone(), reader, stop.clone())),
            writer: tokio::spawn(write_loop(shared.clone(), writer, stop.clone())),
            stop,
        }
    }

    async fn stopped(current: &Option<LoopSet>) {
        match current {
            Some(loops) => loops.stop.cancelled().await,
            None => std::future::pending().await,
        }
    }

    async fn stop(self) {
        self.stop.cancel();
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

async fn supervise<S: Serializer>(shared: Arc<Shared<S>>, mut connections: mpsc::UnboundedReceiver<Connection>) {
    let mut current: Option<LoopSet> = None;
    let mut dialer: Option<JoinHandle<()>> = None;

    if shared.role == ChannelRole::Client {
        dialer = spawn_dialer(&shared);
    }

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            Some(connection) = connections.recv() => {
                if let Some(dialer) = dialer.take() {
                    dialer.abort();
                }
                if let Some(previous) = current.take() {
                    debug!(channel = %shared.label, "Replacing connection");
                    previous.stop().await;
                }
                if shared.cancel.is_cancelled() {
                    break;
                }

                info!(channel = %shared.label, remote = %connection.remote_hub(), "Channel connected");
                *shared.remote_hub.write() = Some(connection.remote_hub().clone());
                shared.metrics.record_connection();
                current = Some(LoopSet::start(&shared, connection));
                shared.state.send_replace(ChannelState::Connected);
            }
            _ = LoopSet::stopped(&current) => {
                if let Some(loops) = current.take() {
                    loops.stop().await;
                }
                if shared.cancel.is_cancelled() {
                    break;
                }
                match shared.role {
                    ChannelRole::Client => {
                        info!(channel = %shared.label, "Connection lost, redialing");
                        shared.state.send_replace(ChannelState::Connecting);
                        dialer = spawn_dialer(&shared);
                    }
                    ChannelRole::Server => {
                        info!(channel = %shared.label, "Connection lost, closing server channel");
                        break;
                    }
                }
            }
        }
    }

    shared.cancel.cancel();
    if let Some(dialer) = dialer.take() {
        dialer.abort();
    }
    if let Some(loops) = current.take() {
        loops.stop().await;
    }
    shared.session.shutdown();
    shared.session.join().await;
    shared.state.send_replace(ChannelState::Closed);
    info!(channel = %shared.label, "Channel closed");
}

fn spawn_dialer<S: Serializer>(shared: &Arc<Shared<S>>) -> Option<JoinHandle<()>> {
    let endpoint = shared.endpoint.clone()?;
    let options = shared.options.clone();
    let cancel = shared.cancel.clone();
    let connections = shared.connections.clone();
    let label = shared.label.clone();

    Some(tokio::spawn(async move {
        match Connection::connect_to(&endpoint, &options, &cancel).await {
            Ok(connection) => {
                let _ = connections.send(connection);
            }
            Err(e) => debug!(channel = %label, error = %e, "Dialer stopped"),
        }
    }))
}

async fn read_loop<S: Serializer>(shared: Arc<Shared<S>>, mut reader: ConnectionReader, stop: CancellationToken) {
    loop {
        match reader.read_message(&shared.pool, &stop).await {
            Ok(message) => {
                shared
                    .metrics
                    .record_receive(WIRE_HEADER_SIZE + message.payload().len());
                if !shared.session.enqueue_incoming(message) {
                    break;
                }
            }
            Err(e) if e.is_cancellation() => break,
            Err(e) => {
                shared.metrics.record_connection_error();
                match e {
                    TransportError::Protocol { .. } => {
                        warn!(channel = %shared.label, error = %e, "Framing error, dropping connection")
                    }
                    _ => info!(channel = %shared.label, error = %e, "Read loop stopped"),
                }
                break;
            }
        }
    }
    stop.cancel();
}

async fn write_loop<S: Serializer>(shared: Arc<Shared<S>>, mut writer: ConnectionWriter, stop: CancellationToken) {
    let session = &shared.session;
    let mut unflushed = 0usize;

    loop {
        let message = match session.try_next_outgoing() {
            Some(message) => message,
            None => {
                if unflushed > 0 {
                    if let Err(e) = until_stopped(&stop, writer.flush()).await {
                        fail(&shared, &e);
                        break;
                    }
                    unflushed = 0;
                }
                match session.next_outgoing(&stop).await {
                    Ok(message) => message,
                    Err(_) => break,
                }
            }
        };

        // Dropped on failure: at most once per physical send
        match until_stopped(&stop, writer.write_message(&message)).await {
            Ok(bytes) => {
                shared.metrics.record_send(bytes);
                unflushed += 1;
            }
            Err(e) => {
                fail(&shared, &e);
                break;
            }
        }
        drop(message);

        if unflushed >= FLUSH_BATCH {
            if let Err(e) = until_stopped(&stop, writer.flush()).await {
                fail(&shared, &e);
                break;
            }
            unflushed = 0;
        }
    }

    if stop.is_cancelled() || session.is_shut_down() {
        // Best effort for bytes already buffered on an otherwise healthy socket
        let _ = tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, writer.shutdown()).await;
    }
    stop.cancel();
}

/// Abandon a socket write once `stop` fires
async fn until_stopped<T, F>(stop: &CancellationToken, write: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = stop.cancelled() => Err(TransportError::Canceled),
        result = write => result,
    }
}

fn fail<S: Serializer>(shared: &Shared<S>, error: &TransportError) {
    if error.is_cancellation() {
        debug!(channel = %shared.label, "Write loop stopped mid-write");
        return;
    }
    shared.metrics.record_connection_error();
    info!(channel = %shared.label, error = %error, "Write loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use hublink_codec::TextSerializer;
    use tokio::net::TcpListener;

    fn options(name: &str) -> ConnectionOptions {
        let mut options = ConnectionOptions::new(HubId::new(name).unwrap());
        options.reconnect_delay = Duration::from_millis(50);
        options
    }

    #[tokio::test]
    async fn test_post_before_connect_survives_until_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::tcp("127.0.0.1", listener.local_addr().unwrap().port());
        let root = CancellationToken::new();

        let client = Channel::dial(
            endpoint,
            Arc::new(TextSerializer),
            BufferPool::default(),
            options("client"),
            &root,
        );
        let first = client.post("queued".to_string(), MessageId::EMPTY);
        assert_eq!(first, MessageId::new(1));

        let (stream, _) = listener.accept().await.unwrap();
        let server_options = options("server");
        let connection = Connection::accept(stream, &server_options, false).await.unwrap();
        let server = Channel::detached(
            connection.remote_hub().clone(),
            Arc::new(TextSerializer),
            BufferPool::default(),
            server_options,
            &root,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.set_callback(move |header, text: String| {
            let _ = tx.send((header.message_id, text));
        });
        server.attach(connection).unwrap();

        let (id, text) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(id, first);
        assert_eq!(text, "queued");
        assert_eq!(client.remote_hub().unwrap().as_str(), "server");
        assert_eq!(server.remote_hub().unwrap().as_str(), "client");

        client.close().await;
        assert_eq!(client.state(), ChannelState::Closed);
        // The server side closes once its only connection drops
        tokio::time::timeout(Duration::from_secs(5), server.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_does_not_hang_on_peer_that_stopped_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::tcp("127.0.0.1", listener.local_addr().unwrap().port());
        let root = CancellationToken::new();
        let pool = BufferPool::default();

        let client = Channel::dial(endpoint, Arc::new(TextSerializer), pool.clone(), options("client"), &root);
        let (stream, _) = listener.accept().await.unwrap();
        // Handshakes, then never reads
        let _stalled_peer = Connection::accept(stream, &options("stalled"), false).await.unwrap();
        client.wait_connected(Duration::from_secs(5)).await.unwrap();

        let payload = "x".repeat(1024 * 1024);
        for _ in 0..64 {
            client.post(payload.clone(), MessageId::EMPTY);
        }
        // Let the writer fill the socket buffers and block
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(client.state(), ChannelState::Connected);

        tokio::time::timeout(Duration::from_secs(5), client.close())
            .await
            .expect("close must not wait on a stalled socket write");
        assert_eq!(client.state(), ChannelState::Closed);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes() {
        let root = CancellationToken::new();
        let channel = Channel::detached(
            HubId::new("peer").unwrap(),
            Arc::new(TextSerializer),
            BufferPool::default(),
            options("local"),
            &root,
        );
        let observer = channel.shared.clone();
        drop(channel);

        let mut state = observer.state.subscribe();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == ChannelState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert!(observer.session.is_shut_down());
    }

    #[tokio::test]
    async fn test_weak_replier_does_not_keep_channel_open() {
        let root = CancellationToken::new();
        let channel = Channel::detached(
            HubId::new("peer").unwrap(),
            Arc::new(TextSerializer),
            BufferPool::default(),
            options("local"),
            &root,
        );
        let replier = channel.downgrade();
        channel.set_callback(move |header, text: String| {
            if let Some(channel) = replier.upgrade() {
                channel.post(text, header.message_id);
            }
        });
        let observer = channel.shared.clone();
        let weak = channel.downgrade();
        assert!(weak.upgrade().is_some());
        drop(channel);

        let mut state = observer.state.subscribe();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == ChannelState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_parent_cancel_closes_channel() {
        let root = CancellationToken::new();
        let channel = Channel::detached(
            HubId::new("peer").unwrap(),
            Arc::new(TextSerializer),
            BufferPool::default(),
            options("local"),
            &root,
        );
        root.cancel();
        tokio::time::timeout(Duration::from_secs(2), channel.closed()).await.unwrap();
        assert!(channel.wait_connected(Duration::from_millis(10)).await.is_err());
    }
}
