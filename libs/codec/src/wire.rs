//! Wire Header and Handshake Framing
//!
//! Every frame on the wire is a fixed 64-byte header followed by exactly
//! `payload_size` payload bytes:
//!
//! ```text
//! ┌─────────┬─────────┬────────────┬──────────┬──────────────┬──────────┐
//! │ version │ type_id │ message_id │ reply_to │ payload_size │ reserved │
//! │ u16     │ i64     │ u64        │ u64      │ i32          │ zeroes   │
//! │ 0..2    │ 2..10   │ 10..18     │ 18..26   │ 26..30       │ 30..64   │
//! └─────────┴─────────┴────────────┴──────────┴──────────────┴──────────┘
//! ```
//!
//! All fields are little-endian and encoded field by field; the in-memory
//! layout of [`WireHeader`] is irrelevant to the wire format.

use crate::error::CodecError;
use crate::message::{HubId, MessageHeader, MessageId, MessageTypeId};
use byteorder::{ByteOrder, LittleEndian};

/// Size of the encoded header in bytes
pub const WIRE_HEADER_SIZE: usize = 64;

/// Wire format version written by this build
pub const PROTOCOL_VERSION: u16 = 1;

/// Upper bound on a handshake payload (the sender's hub id)
pub const MAX_HANDSHAKE_PAYLOAD: usize = 1024;

const VERSION_OFFSET: usize = 0;
const TYPE_ID_OFFSET: usize = 2;
const MESSAGE_ID_OFFSET: usize = 10;
const REPLY_TO_OFFSET: usize = 18;
const PAYLOAD_SIZE_OFFSET: usize = 26;

/// Fixed-size prefix describing the payload that follows it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub version: u16,
    pub header: MessageHeader,
    pub payload_size: i32,
}

impl WireHeader {
    /// Header for a payload of `payload_len` bytes at the current version
    pub fn for_payload(header: MessageHeader, payload_len: usize) -> Result<Self, CodecError> {
        let payload_size = i32::try_from(payload_len).map_err(|_| CodecError::PayloadTooLarge {
            size: payload_len,
            limit: i32::MAX as usize,
        })?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            header,
            payload_size,
        })
    }

    /// Payload length as a byte count
    pub fn payload_len(&self) -> usize {
        // decode() rejects negative sizes
        self.payload_size.max(0) as usize
    }

    pub fn encode(&self) -> [u8; WIRE_HEADER_SIZE] {
        let mut buf = [0u8; WIRE_HEADER_SIZE];
        LittleEndian::write_u16(&mut buf[VERSION_OFFSET..], self.version);
        LittleEndian::write_i64(&mut buf[TYPE_ID_OFFSET..], self.header.type_id.value());
        LittleEndian::write_u64(&mut buf[MESSAGE_ID_OFFSET..], self.header.message_id.value());
        LittleEndian::write_u64(&mut buf[REPLY_TO_OFFSET..], self.header.reply_to.value());
        LittleEndian::write_i32(&mut buf[PAYLOAD_SIZE_OFFSET..], self.payload_size);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < WIRE_HEADER_SIZE {
            return Err(CodecError::BufferTooShort {
                need: WIRE_HEADER_SIZE,
                got: bytes.len(),
                context: "wire header",
            });
        }

        let version = LittleEndian::read_u16(&bytes[VERSION_OFFSET..]);
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion {
                found: version,
                expected: PROTOCOL_VERSION,
            });
        }

        let payload_size = LittleEndian::read_i32(&bytes[PAYLOAD_SIZE_OFFSET..]);
        if payload_size < 0 {
            return Err(CodecError::NegativePayloadSize { size: payload_size });
        }

        Ok(Self {
            version,
            header: MessageHeader {
                type_id: MessageTypeId::new(LittleEndian::read_i64(&bytes[TYPE_ID_OFFSET..])),
                message_id: MessageId::new(LittleEndian::read_u64(&bytes[MESSAGE_ID_OFFSET..])),
                reply_to: MessageId::new(LittleEndian::read_u64(&bytes[REPLY_TO_OFFSET..])),
            },
            payload_size,
        })
    }
}

/// First frame each side sends: its hub identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    hub_id: HubId,
}

impl HandshakeMessage {
    pub fn new(hub_id: HubId) -> Self {
        Self { hub_id }
    }

    pub fn hub_id(&self) -> &HubId {
        &self.hub_id
    }

    pub fn into_hub_id(self) -> HubId {
        self.hub_id
    }

    /// Header announcing this handshake's payload
    pub fn wire_header(&self) -> Result<WireHeader, CodecError> {
        let payload = self.hub_id.as_bytes();
        if payload.len() > MAX_HANDSHAKE_PAYLOAD {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                limit: MAX_HANDSHAKE_PAYLOAD,
            });
        }
        let header = MessageHeader::new(MessageTypeId::HANDSHAKE, MessageId::EMPTY, MessageId::EMPTY);
        WireHeader::for_payload(header, payload.len())
    }

    /// Header followed by payload, ready for a single write
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let header = self.wire_header()?;
        let mut frame = Vec::with_capacity(WIRE_HEADER_SIZE + header.payload_len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(self.hub_id.as_bytes());
        Ok(frame)
    }

    /// Validate a received header before reading the handshake payload
    pub fn check_header(header: &WireHeader) -> Result<(), CodecError> {
        if !header.header.type_id.is_handshake() {
            return Err(CodecError::UnexpectedType {
                found: header.header.type_id,
                expected: MessageTypeId::HANDSHAKE,
            });
        }
        if header.payload_len() > MAX_HANDSHAKE_PAYLOAD {
            return Err(CodecError::PayloadTooLarge {
                size: header.payload_len(),
                limit: MAX_HANDSHAKE_PAYLOAD,
            });
        }
        Ok(())
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, CodecError> {
        let id = std::str::from_utf8(payload).map_err(|e| CodecError::InvalidHubId {
            reason: format!("handshake payload is not UTF-8: {}", e),
        })?;
        Ok(Self::new(HubId::new(id)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> WireHeader {
        WireHeader::for_payload(
            MessageHeader::new(MessageTypeId(42), MessageId::new(7), MessageId::new(3)),
            1234,
        )
        .unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let bytes = sample_header().encode();
        assert_eq!(bytes.len(), WIRE_HEADER_SIZE);
        assert_eq!(&bytes[0..2], &PROTOCOL_VERSION.to_le_bytes());
        assert_eq!(&bytes[2..10], &42i64.to_le_bytes());
        assert_eq!(&bytes[10..18], &7u64.to_le_bytes());
        assert_eq!(&bytes[18..26], &3u64.to_le_bytes());
        assert_eq!(&bytes[26..30], &1234i32.to_le_bytes());
        assert!(bytes[30..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_round_trip_preserves_reply_to() {
        let original = sample_header();
        let decoded = WireHeader::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.header.reply_to, MessageId::new(3));
        assert_eq!(decoded.payload_len(), 1234);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let bytes = sample_header().encode();
        let err = WireHeader::decode(&bytes[..63]).unwrap_err();
        assert!(matches!(err, CodecError::BufferTooShort { need: 64, got: 63, .. }));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut bytes = sample_header().encode();
        bytes[0] = 9;
        let err = WireHeader::decode(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion { found: 9, .. }));
    }

    #[test]
    fn test_decode_rejects_negative_payload() {
        let mut bytes = sample_header().encode();
        bytes[26..30].copy_from_slice(&(-5i32).to_le_bytes());
        assert!(matches!(
            WireHeader::decode(&bytes),
            Err(CodecError::NegativePayloadSize { size: -5 })
        ));
    }

    #[test]
    fn test_decode_ignores_reserved_bytes() {
        let mut bytes = sample_header().encode();
        bytes[40] = 0xFF;
        assert_eq!(WireHeader::decode(&bytes).unwrap(), sample_header());
    }

    #[test]
    fn test_handshake_frame() {
        let hub = HubId::new("hub-east").unwrap();
        let frame = HandshakeMessage::new(hub.clone()).encode().unwrap();
        assert_eq!(frame.len(), WIRE_HEADER_SIZE + 8);

        let header = WireHeader::decode(&frame).unwrap();
        HandshakeMessage::check_header(&header).unwrap();
        assert_eq!(header.payload_len(), 8);

        let parsed = HandshakeMessage::from_payload(&frame[WIRE_HEADER_SIZE..]).unwrap();
        assert_eq!(parsed.into_hub_id(), hub);
    }

    #[test]
    fn test_handshake_rejects_application_header() {
        let header = sample_header();
        assert!(matches!(
            HandshakeMessage::check_header(&header),
            Err(CodecError::UnexpectedType { .. })
        ));
        assert!(HandshakeMessage::from_payload(&[]).is_err());
        assert!(HandshakeMessage::from_payload(&[0xFF, 0xFE]).is_err());
    }
}
