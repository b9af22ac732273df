//! Pluggable payload serializers
//!
//! A [`Serializer`] turns application values into pooled payload bytes and
//! back. It also picks the [`MessageTypeId`] carried in the wire header, so a
//! single serializer can multiplex several logical message types.

use crate::buffer::PooledBuffer;
use crate::error::CodecError;
use crate::message::{MessageHeader, MessageTypeId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Read;
use std::marker::PhantomData;

/// Converts application values to and from message payloads
///
/// Implementations run on the session's worker tasks, never on socket tasks,
/// so a slow codec delays only its own channel's pipeline.
pub trait Serializer: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Write `item` into `sink` and report its message type
    fn serialize(&self, item: &Self::Item, sink: &mut PooledBuffer) -> Result<MessageTypeId, CodecError>;

    /// Rebuild a value from the payload of the message described by `header`
    fn deserialize(&self, header: &MessageHeader, source: &mut PooledBuffer) -> Result<Self::Item, CodecError>;
}

fn expect_type(header: &MessageHeader, expected: MessageTypeId) -> Result<(), CodecError> {
    if header.type_id != expected {
        return Err(CodecError::UnexpectedType {
            found: header.type_id,
            expected,
        });
    }
    Ok(())
}

/// UTF-8 text payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct TextSerializer;

impl TextSerializer {
    pub const TYPE_ID: MessageTypeId = MessageTypeId(1);
}

impl Serializer for TextSerializer {
    type Item = String;

    fn serialize(&self, item: &String, sink: &mut PooledBuffer) -> Result<MessageTypeId, CodecError> {
        sink.write_slice(item.as_bytes());
        Ok(Self::TYPE_ID)
    }

    fn deserialize(&self, header: &MessageHeader, source: &mut PooledBuffer) -> Result<String, CodecError> {
        expect_type(header, Self::TYPE_ID)?;
        let mut text = String::with_capacity(source.remaining());
        source
            .read_to_string(&mut text)
            .map_err(|e| CodecError::deserialization_with_source("payload is not valid UTF-8", e))?;
        Ok(text)
    }
}

/// Bincode payloads for any serde type, tagged with one fixed type id
pub struct BincodeSerializer<T> {
    type_id: MessageTypeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    /// The handshake id is reserved and rejected
    pub fn new(type_id: MessageTypeId) -> Result<Self, CodecError> {
        if type_id.is_handshake() {
            return Err(CodecError::ReservedTypeId(type_id));
        }
        Ok(Self {
            type_id,
            _marker: PhantomData,
        })
    }

    pub fn type_id(&self) -> MessageTypeId {
        self.type_id
    }
}

impl<T> Serializer for BincodeSerializer<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Item = T;

    fn serialize(&self, item: &T, sink: &mut PooledBuffer) -> Result<MessageTypeId, CodecError> {
        bincode::serialize_into(&mut *sink, item)
            .map_err(|e| CodecError::serialization_with_source("bincode encoding failed", e))?;
        Ok(self.type_id)
    }

    fn deserialize(&self, header: &MessageHeader, source: &mut PooledBuffer) -> Result<T, CodecError> {
        expect_type(header, self.type_id)?;
        bincode::deserialize_from(&mut *source)
            .map_err(|e| CodecError::deserialization_with_source("bincode decoding failed", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageId;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Quote {
        symbol: String,
        bid: u64,
        ask: u64,
    }

    fn header_for(type_id: MessageTypeId) -> MessageHeader {
        MessageHeader::new(type_id, MessageId::new(1), MessageId::EMPTY)
    }

    #[test]
    fn test_text_round_trip() {
        let serializer = TextSerializer;
        let mut buffer = PooledBuffer::unpooled(4);
        let type_id = serializer.serialize(&"héllo wörld".to_string(), &mut buffer).unwrap();
        assert_eq!(type_id, TextSerializer::TYPE_ID);

        let text = serializer.deserialize(&header_for(type_id), &mut buffer).unwrap();
        assert_eq!(text, "héllo wörld");
    }

    #[test]
    fn test_text_rejects_invalid_utf8() {
        let mut buffer = PooledBuffer::unpooled(16);
        buffer.write_slice(&[0xC3, 0x28]);
        let err = TextSerializer
            .deserialize(&header_for(TextSerializer::TYPE_ID), &mut buffer)
            .unwrap_err();
        assert!(matches!(err, CodecError::Deserialization { .. }));
    }

    #[test]
    fn test_bincode_round_trip() {
        let serializer = BincodeSerializer::<Quote>::new(MessageTypeId(20)).unwrap();
        let quote = Quote {
            symbol: "ETH/USDC".to_string(),
            bid: 3_100,
            ask: 3_102,
        };
        let mut buffer = PooledBuffer::unpooled(8);
        let type_id = serializer.serialize(&quote, &mut buffer).unwrap();
        assert_eq!(type_id, MessageTypeId(20));

        let decoded = serializer.deserialize(&header_for(type_id), &mut buffer).unwrap();
        assert_eq!(decoded, quote);
    }

    #[test]
    fn test_bincode_rejects_foreign_type() {
        let serializer = BincodeSerializer::<Quote>::new(MessageTypeId(20)).unwrap();
        let mut buffer = PooledBuffer::unpooled(8);
        let err = serializer
            .deserialize(&header_for(MessageTypeId(21)), &mut buffer)
            .unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedType { .. }));
    }

    #[test]
    fn test_handshake_type_is_reserved() {
        assert!(matches!(
            BincodeSerializer::<Quote>::new(MessageTypeId::HANDSHAKE),
            Err(CodecError::ReservedTypeId(_))
        ));
    }
}
