use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

/// Length of a message identifier in bytes.
pub const MSG_ID_LENGTH: usize = 16;

/// Fixed header: timestamp (8) + attempts (2) + id (16).
pub const MSG_HEADER_LENGTH: usize = 8 + 2 + MSG_ID_LENGTH;

/// Opaque, fixed-size message identifier, unique within the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; MSG_ID_LENGTH]);

impl MessageId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        MessageId(*Uuid::new_v4().as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; MSG_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; MSG_ID_LENGTH]> for MessageId {
    fn from(raw: [u8; MSG_ID_LENGTH]) -> Self {
        MessageId(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub body: Bytes,
    /// Number of times this message has been handed to a consumer.
    pub attempts: u16,
    /// Nanoseconds since the UNIX epoch.
    pub timestamp: u64,
}

impl Message {
    pub fn new(id: MessageId, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            body: body.into(),
            attempts: 0,
            timestamp: current_timestamp_nanos(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message too short: {len} bytes, need at least {MSG_HEADER_LENGTH}")]
    TooShort { len: usize },
}

pub fn new_message(body: impl Into<Bytes>) -> Message {
    Message::new(MessageId::generate(), body)
}

pub fn current_timestamp_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Serialize a `Message` into its backend representation.
pub fn encode_message(msg: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(MSG_HEADER_LENGTH + msg.body.len());
    encode_message_into(msg, &mut buf);
    buf.freeze()
}

pub fn encode_message_into(msg: &Message, buf: &mut BytesMut) {
    buf.reserve(MSG_HEADER_LENGTH + msg.body.len());
    buf.put_u64(msg.timestamp);
    buf.put_u16(msg.attempts);
    buf.put_slice(msg.id.as_bytes());
    buf.put_slice(&msg.body);
}

/// Deserialize a `Message` produced by [`encode_message`].
pub fn decode_message(bytes: &[u8]) -> Result<Message, DecodeError> {
    if bytes.len() < MSG_HEADER_LENGTH {
        return Err(DecodeError::TooShort { len: bytes.len() });
    }

    let mut buf = bytes;
    let timestamp = buf.get_u64();
    let attempts = buf.get_u16();
    let mut id = [0u8; MSG_ID_LENGTH];
    buf.copy_to_slice(&mut id);

    Ok(Message {
        id: MessageId(id),
        body: Bytes::copy_from_slice(buf),
        attempts,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_restores_every_field() {
        let mut msg = new_message("payload");
        msg.attempts = 7;

        let decoded = decode_message(&encode_message(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn empty_body_is_valid() {
        let msg = new_message(Bytes::new());
        let encoded = encode_message(&msg);
        assert_eq!(encoded.len(), MSG_HEADER_LENGTH);
        assert!(decode_message(&encoded).unwrap().body.is_empty());
    }

    #[test]
    fn short_input_is_rejected() {
        let err = decode_message(&[0u8; MSG_HEADER_LENGTH - 1]).unwrap_err();
        assert_eq!(err, DecodeError::TooShort { len: MSG_HEADER_LENGTH - 1 });
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(MessageId::generate(), MessageId::generate());
    }

    #[test]
    fn id_displays_as_hex() {
        let id = MessageId([0xab; MSG_ID_LENGTH]);
        assert_eq!(id.to_string(), "ab".repeat(MSG_ID_LENGTH));
    }
}
