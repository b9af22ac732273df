//! Hublink Network
//!
//! Point-to-point duplex messaging between hubs. Two hubs exchange typed,
//! length-prefixed binary messages over one persistent TCP (or TLS)
//! connection, with an application-level handshake and automatic reconnect.
//!
//! ```text
//! Hub ──listen / open_channel_to──► Channel ──► Session ──► Serializer
//!                                      │
//!                                 Connection (handshake, framed halves)
//! ```
//!
//! Socket I/O, (de)serialization and user callbacks run on separate tasks
//! joined by [`queue::AwaitableQueue`]s, so a slow callback never stalls the
//! socket.

pub mod channel;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod queue;
pub mod request;
pub mod session;
pub mod tls;

pub use channel::{Channel, ChannelRole, ChannelState, WeakChannel, FLUSH_BATCH};
pub use connection::{Connection, ConnectionOptions, ConnectionReader, ConnectionState, ConnectionWriter};
pub use endpoint::{Endpoint, Scheme};
pub use error::{Result, TransportError};
pub use hub::Hub;
pub use metrics::{ChannelMetrics, MetricsSnapshot};
pub use queue::{AwaitableQueue, CompletionSource, QueueError};
pub use request::RequestClient;
pub use session::Session;
pub use tls::TlsContext;

pub use tokio_util::sync::CancellationToken;
