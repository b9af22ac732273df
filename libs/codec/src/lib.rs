//! # Hublink Codec
//!
//! ## Purpose
//!
//! The "rules" layer of hublink: everything about how a message looks as bytes,
//! with no sockets involved.
//!
//! - Message identity types ([`HubId`], [`MessageTypeId`], [`MessageId`], [`MessageHeader`])
//! - The fixed 64-byte [`WireHeader`] and the [`HandshakeMessage`]
//! - Pooled, segmented payload storage ([`BufferPool`], [`PooledBuffer`])
//! - The pluggable [`Serializer`] capability plus text and bincode codecs
//! - [`PreemptiveHashSet`], a bounded set used to remember recent ids
//!
//! ## Architecture Role
//!
//! ```text
//! hublink-codec → hublink-network
//!      ↓                ↓
//!  Frame Rules     Connections, Sessions,
//!  Pooled Bytes    Channels, Hubs
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Socket management or connection handling (belongs in hublink-network)
//! - Configuration loading (belongs in hublink-config)

pub mod buffer;
pub mod error;
pub mod message;
pub mod preemptive;
pub mod serializer;
pub mod wire;

pub use buffer::{BufferPool, PoolStats, PooledBuffer, DEFAULT_MAX_RETAINED, DEFAULT_SEGMENT_SIZE};
pub use error::CodecError;
pub use message::{HubId, Message, MessageHeader, MessageId, MessageTypeId};
pub use preemptive::PreemptiveHashSet;
pub use serializer::{BincodeSerializer, Serializer, TextSerializer};
pub use wire::{HandshakeMessage, WireHeader, MAX_HANDSHAKE_PAYLOAD, PROTOCOL_VERSION, WIRE_HEADER_SIZE};
