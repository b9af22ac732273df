//! Codec-level errors for framing, handshake and payload (de)serialization
//!
//! Each variant carries enough context to tell a corrupted stream apart from a
//! misbehaving user codec when it shows up in the logs.

use crate::message::MessageTypeId;
use std::io;
use thiserror::Error;

/// Errors raised while encoding or decoding hublink frames and payloads
#[derive(Debug, Error)]
pub enum CodecError {
    /// Buffer is too small to contain the expected structure
    #[error("Buffer too short: need {need} bytes, got {got} (context: {context})")]
    BufferTooShort {
        need: usize,
        got: usize,
        context: &'static str,
    },

    /// Wire header carries a version this build does not speak
    #[error("Unsupported wire version {found}: expected {expected}")]
    UnsupportedVersion { found: u16, expected: u16 },

    /// Wire header announced a negative payload
    #[error("Negative payload size {size} in wire header")]
    NegativePayloadSize { size: i32 },

    /// Payload length does not fit the wire header's size field
    #[error("Payload too large: {size} bytes exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A message was built around the empty header
    #[error("Message header is empty: type id and message id must be assigned")]
    EmptyHeader,

    /// The handshake type id was used for an application message, or vice versa
    #[error("Unexpected message type {found} (expected {expected})")]
    UnexpectedType {
        found: MessageTypeId,
        expected: MessageTypeId,
    },

    /// User serializers may not claim the handshake type id
    #[error("Message type id {0} is reserved for the handshake")]
    ReservedTypeId(MessageTypeId),

    /// Hub identity failed validation
    #[error("Invalid hub id: {reason}")]
    InvalidHubId { reason: String },

    /// User serializer failed
    #[error("Serialization failed: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// User deserializer failed
    #[error("Deserialization failed: {message}")]
    Deserialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Reading from or writing to a pooled buffer failed
    #[error("Buffer I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            source: None,
        }
    }

    /// Create a serialization error with source
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a deserialization error
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
            source: None,
        }
    }

    /// Create a deserialization error with source
    pub fn deserialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Deserialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Framing errors leave the byte stream in an unknown position
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            CodecError::BufferTooShort { .. }
                | CodecError::UnsupportedVersion { .. }
                | CodecError::NegativePayloadSize { .. }
                | CodecError::PayloadTooLarge { .. }
                | CodecError::UnexpectedType { .. }
        )
    }
}
