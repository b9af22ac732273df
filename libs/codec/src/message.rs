//! Message identity types
//!
//! The header is identical for all messages and identifies a logical message
//! independently of its payload.

use crate::buffer::PooledBuffer;
use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Identity of a hub, exchanged during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HubId(String);

impl HubId {
    /// Create a hub id; empty ids are rejected
    pub fn new(id: impl Into<String>) -> Result<Self, CodecError> {
        let id = id.into();
        if id.is_empty() {
            return Err(CodecError::InvalidHubId {
                reason: "hub id must not be empty".to_string(),
            });
        }
        Ok(Self(id))
    }

    /// Random identity for hubs that were not given one
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for HubId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for HubId {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<HubId> for String {
    fn from(id: HubId) -> Self {
        id.0
    }
}

/// Discriminator of the logical payload type, chosen by the serializer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageTypeId(pub i64);

impl MessageTypeId {
    /// Reserved for the connection handshake
    pub const HANDSHAKE: MessageTypeId = MessageTypeId(0);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i64 {
        self.0
    }

    pub const fn is_handshake(self) -> bool {
        self.0 == Self::HANDSHAKE.0
    }
}

impl fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-direction message sequence number; `EMPTY` means "none"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    pub const EMPTY: MessageId = MessageId(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The id following this one
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a logical message
///
/// Equality and hashing cover `type_id` and `message_id` only; `reply_to` is
/// routing metadata and does not change which message this is.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MessageHeader {
    pub type_id: MessageTypeId,
    pub message_id: MessageId,
    pub reply_to: MessageId,
}

impl MessageHeader {
    pub const fn new(type_id: MessageTypeId, message_id: MessageId, reply_to: MessageId) -> Self {
        Self {
            type_id,
            message_id,
            reply_to,
        }
    }

    /// True for the default, unassigned header
    pub fn is_empty(&self) -> bool {
        self.type_id == MessageTypeId::default()
            && self.message_id.is_empty()
            && self.reply_to.is_empty()
    }

    pub fn is_reply(&self) -> bool {
        !self.reply_to.is_empty()
    }
}

impl PartialEq for MessageHeader {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.message_id == other.message_id
    }
}

impl Eq for MessageHeader {}

impl Hash for MessageHeader {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.message_id.hash(state);
    }
}

/// A header plus its serialized payload
///
/// The payload buffer travels with the message and returns to its pool when
/// the message is dropped.
#[derive(Debug)]
pub struct Message {
    header: MessageHeader,
    payload: PooledBuffer,
}

impl Message {
    /// Build a message; the empty header is rejected
    pub fn new(header: MessageHeader, payload: PooledBuffer) -> Result<Self, CodecError> {
        if header.is_empty() {
            return Err(CodecError::EmptyHeader);
        }
        Ok(Self { header, payload })
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn payload(&self) -> &PooledBuffer {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut PooledBuffer {
        &mut self.payload
    }

    pub fn into_parts(self) -> (MessageHeader, PooledBuffer) {
        (self.header, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_header_equality_ignores_reply_to() {
        let a = MessageHeader::new(MessageTypeId(7), MessageId::new(3), MessageId::EMPTY);
        let b = MessageHeader::new(MessageTypeId(7), MessageId::new(3), MessageId::new(99));
        let c = MessageHeader::new(MessageTypeId(8), MessageId::new(3), MessageId::EMPTY);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_message_rejects_empty_header() {
        let payload = PooledBuffer::unpooled(16);
        let err = Message::new(MessageHeader::default(), payload).unwrap_err();
        assert!(matches!(err, CodecError::EmptyHeader));

        let header = MessageHeader::new(MessageTypeId(1), MessageId::new(1), MessageId::EMPTY);
        let message = Message::new(header, PooledBuffer::unpooled(16)).unwrap();
        assert_eq!(message.header().message_id, MessageId::new(1));
    }

    #[test]
    fn test_hub_id_validation() {
        assert!(HubId::new("").is_err());
        assert_eq!(HubId::new("alpha").unwrap().as_str(), "alpha");

        let a = HubId::random();
        let b = HubId::random();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_message_id_sequence() {
        assert!(MessageId::EMPTY.is_empty());
        assert_eq!(MessageId::EMPTY.next(), MessageId::new(1));
        assert!(MessageId::new(1) < MessageId::new(2));
    }
}
