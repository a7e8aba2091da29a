//! Application messages and their slice-based encoding.
//!
//! Messages are encoded with `serde_json` directly into a caller-provided
//! slice. The encoder reports [`EncodeError::Overflow`] instead of
//! allocating when the slice is too small, which lets the messenger keep a
//! single scratch buffer that grows by doubling and is never shrunk.

use std::io::Cursor;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when encoding a [`Message`] into a slice.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The target slice is too small for the encoded message.
    #[error("encoded message does not fit in {capacity} bytes")]
    Overflow {
        /// Capacity of the slice that overflowed.
        capacity: usize,
    },

    /// The message could not be serialized at all.
    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// Errors produced when decoding a [`Message`] from bytes.
#[derive(Debug, Error)]
#[error("deserialization failed: {0}")]
pub struct DecodeError(String);

/// An application message.
///
/// `address` names the destination node (`amqp://host[:port][/path]`);
/// `reply_to` is defaulted by the messenger on `put` when empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Destination address.
    pub address: Option<String>,
    /// Address replies should be sent to.
    pub reply_to: Option<String>,
    /// Free-form subject line.
    pub subject: Option<String>,
    /// MIME type of the body.
    pub content_type: Option<String>,
    /// Correlation identifier for request/response pairing.
    pub correlation_id: Option<String>,
    /// Payload bytes.
    pub body: Vec<u8>,
}

impl Message {
    /// Create a message with an address and body.
    pub fn new(address: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            address: Some(address.into()),
            body: body.into(),
            ..Self::default()
        }
    }

    /// Encode into `buf`, returning the encoded size.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Overflow`] when the message does not fit in
    /// `buf` (the caller is expected to grow the buffer and retry), and
    /// [`EncodeError::Serialize`] for non-capacity failures.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        let capacity = buf.len();
        let mut cursor = Cursor::new(buf);
        match serde_json::to_writer(&mut cursor, self) {
            Ok(()) => Ok(cursor.position() as usize),
            Err(e) if e.is_io() => Err(EncodeError::Overflow { capacity }),
            Err(e) => Err(EncodeError::Serialize(e.to_string())),
        }
    }

    /// Decode a message from bytes previously produced by [`encode`].
    ///
    /// [`encode`]: Message::encode
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the bytes are not a valid message.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(buf).map_err(|e| DecodeError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let message = Message {
            address: Some("amqp://example.com/q".to_string()),
            reply_to: Some("amqp://me".to_string()),
            subject: Some("greeting".to_string()),
            content_type: Some("text/plain".to_string()),
            correlation_id: None,
            body: b"hello".to_vec(),
        };

        let mut buf = vec![0u8; 1024];
        let size = message.encode(&mut buf).expect("encode");
        let decoded = Message::decode(&buf[..size]).expect("decode");
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_encode_overflow_on_small_buffer() {
        let message = Message::new("amqp://example.com/q", vec![7u8; 4096]);

        let mut buf = vec![0u8; 16];
        let result = message.encode(&mut buf);
        assert!(matches!(result, Err(EncodeError::Overflow { capacity: 16 })));
    }

    #[test]
    fn test_encode_fits_after_doubling() {
        let message = Message::new("amqp://example.com/q", vec![1u8; 300]);

        let mut capacity = 64;
        let size = loop {
            let mut buf = vec![0u8; capacity];
            match message.encode(&mut buf) {
                Ok(size) => break size,
                Err(EncodeError::Overflow { .. }) => capacity *= 2,
                Err(e) => panic!("unexpected encode error: {}", e),
            }
        };
        assert!(size <= capacity);
        assert!(capacity > 64);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Message::decode(b"not a message {").is_err());
    }

    #[test]
    fn test_default_message_is_empty() {
        let message = Message::default();
        assert!(message.address.is_none());
        assert!(message.reply_to.is_none());
        assert!(message.body.is_empty());
    }
}
