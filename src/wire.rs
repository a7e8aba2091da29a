//! Wire format for frame serialization.
//!
//! Packet format: `[length:4][checksum:4][payload:N]`
//!
//! - **length**: Total packet size including header (little-endian u32)
//! - **checksum**: CRC32C of the payload for integrity verification
//! - **payload**: One JSON-encoded [`Frame`]
//!
//! Frames carry the endpoint protocol: an optional anonymous SASL
//! handshake, then connection / session / link lifecycle and delivery
//! traffic. Every frame that references a session or link carries the
//! *sender's* channel and handle numbers; the receiving engine keeps the
//! remote-to-local mapping.

use serde::{Deserialize, Serialize};

use crate::engine::DeliveryState;

/// Header size: 4 (length) + 4 (checksum) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (1MB).
///
/// Packets larger than this are rejected to prevent memory exhaustion.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the packet.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed - data was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from header.
        expected: u32,
        /// Computed checksum from data.
        actual: u32,
    },

    /// Payload exceeds maximum allowed size.
    #[error("packet too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PacketTooLarge {
        /// Actual payload size in bytes.
        size: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid packet length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// Payload is not a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Server advertises its SASL mechanisms.
    SaslMechanisms {
        /// Mechanism names the server accepts.
        mechanisms: Vec<String>,
    },
    /// Client selects a mechanism.
    SaslInit {
        /// The chosen mechanism name.
        mechanism: String,
    },
    /// Server reports the handshake outcome.
    SaslOutcome {
        /// Whether authentication succeeded.
        ok: bool,
    },
    /// Open the connection.
    Open {
        /// Container identity of the sending endpoint.
        container: String,
        /// Host the sender believes it is talking to.
        hostname: Option<String>,
    },
    /// Open a session.
    Begin {
        /// The sender's channel number for this session.
        channel: u16,
        /// When answering a remote `Begin`, the remote channel being
        /// answered; `None` when initiating.
        reply_to: Option<u16>,
    },
    /// Open a link on a session.
    Attach {
        /// The sender's channel for the owning session.
        channel: u16,
        /// The sender's handle for this link.
        handle: u32,
        /// Link name; both sides match attaches by name.
        name: String,
        /// True when the sending endpoint transfers deliveries on the link.
        sending: bool,
        /// Source address (set by receivers).
        source: Option<String>,
        /// Target address (set by senders).
        target: Option<String>,
    },
    /// Grant credit on a receiving link (delta semantics).
    Flow {
        /// The sender's channel for the owning session.
        channel: u16,
        /// The sender's handle for the link.
        handle: u32,
        /// Additional transfers the peer may perform.
        credit: u32,
    },
    /// Carry one complete delivery.
    Transfer {
        /// The sender's channel for the owning session.
        channel: u16,
        /// The sender's handle for the link.
        handle: u32,
        /// Delivery tag, unique on the link.
        tag: Vec<u8>,
        /// True when the sender considers the delivery settled already.
        settled: bool,
        /// Encoded message bytes.
        payload: Vec<u8>,
    },
    /// Update disposition of one delivery.
    Disposition {
        /// The sender's channel for the owning session.
        channel: u16,
        /// The sender's handle for the link the delivery lives on.
        handle: u32,
        /// Delivery tag the disposition applies to.
        tag: Vec<u8>,
        /// New terminal state, if any.
        state: Option<DeliveryState>,
        /// Whether the sending side has settled the delivery.
        settled: bool,
    },
    /// Close a link.
    Detach {
        /// The sender's channel for the owning session.
        channel: u16,
        /// The sender's handle for the link.
        handle: u32,
        /// True for a full close (as opposed to a suspension).
        closed: bool,
    },
    /// Close a session.
    End {
        /// The sender's channel for the session.
        channel: u16,
    },
    /// Close the connection.
    Close {},
}

/// Serialize a frame into a wire packet.
///
/// # Errors
///
/// Returns `PacketTooLarge` if the encoded frame exceeds
/// [`MAX_PAYLOAD_SIZE`], `Malformed` if the frame cannot be encoded.
pub fn serialize_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(frame).map_err(|e| WireError::Malformed(e.to_string()))?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::PacketTooLarge {
            size: payload.len(),
        });
    }

    let total_length = HEADER_SIZE + payload.len();
    let checksum = crc32c::crc32c(&payload);

    let mut data = Vec::with_capacity(total_length);
    data.extend_from_slice(&(total_length as u32).to_le_bytes());
    data.extend_from_slice(&checksum.to_le_bytes());
    data.extend_from_slice(&payload);
    Ok(data)
}

/// Try to deserialize one frame from a buffer that may hold partial data.
///
/// # Returns
///
/// - `Ok(Some((frame, consumed)))` if a complete packet was parsed
/// - `Ok(None)` if more data is needed (not an error condition)
/// - `Err` if data is malformed
pub fn try_deserialize_frame(data: &[u8]) -> Result<Option<(Frame, usize)>, WireError> {
    if data.len() < HEADER_SIZE {
        return Ok(None); // Need more data for header
    }

    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

    if (length as usize) < HEADER_SIZE {
        return Err(WireError::InvalidLength { length });
    }
    let expected_len = length as usize;
    if expected_len - HEADER_SIZE > MAX_PAYLOAD_SIZE {
        return Err(WireError::PacketTooLarge {
            size: expected_len - HEADER_SIZE,
        });
    }
    if data.len() < expected_len {
        return Ok(None); // Need more data for payload
    }

    let payload = &data[HEADER_SIZE..expected_len];
    let computed = crc32c::crc32c(payload);
    if computed != checksum {
        return Err(WireError::ChecksumMismatch {
            expected: checksum,
            actual: computed,
        });
    }

    let frame = serde_json::from_slice(payload).map_err(|e| WireError::Malformed(e.to_string()))?;
    Ok(Some((frame, expected_len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame::Transfer {
            channel: 0,
            handle: 1,
            tag: b"42".to_vec(),
            settled: false,
            payload: b"hello world".to_vec(),
        }
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let frame = sample_frame();
        let packet = serialize_frame(&frame).expect("serialize");

        let (parsed, consumed) = try_deserialize_frame(&packet)
            .expect("deserialize")
            .expect("complete");
        assert_eq!(frame, parsed);
        assert_eq!(consumed, packet.len());
    }

    #[test]
    fn test_all_lifecycle_frames_roundtrip() {
        let frames = vec![
            Frame::SaslMechanisms {
                mechanisms: vec!["ANONYMOUS".to_string()],
            },
            Frame::SaslInit {
                mechanism: "ANONYMOUS".to_string(),
            },
            Frame::SaslOutcome { ok: true },
            Frame::Open {
                container: "m1".to_string(),
                hostname: Some("example.com".to_string()),
            },
            Frame::Begin {
                channel: 3,
                reply_to: Some(1),
            },
            Frame::Attach {
                channel: 3,
                handle: 0,
                name: "q".to_string(),
                sending: true,
                source: None,
                target: Some("q".to_string()),
            },
            Frame::Flow {
                channel: 3,
                handle: 0,
                credit: 10,
            },
            Frame::Disposition {
                channel: 3,
                handle: 0,
                tag: b"1".to_vec(),
                state: Some(DeliveryState::Accepted),
                settled: true,
            },
            Frame::Detach {
                channel: 3,
                handle: 0,
                closed: true,
            },
            Frame::End { channel: 3 },
            Frame::Close {},
        ];

        for frame in frames {
            let packet = serialize_frame(&frame).expect("serialize");
            let (parsed, _) = try_deserialize_frame(&packet)
                .expect("deserialize")
                .expect("complete");
            assert_eq!(frame, parsed);
        }
    }

    #[test]
    fn test_partial_header_needs_more_data() {
        let packet = serialize_frame(&sample_frame()).expect("serialize");
        assert!(try_deserialize_frame(&packet[..4]).expect("partial").is_none());
    }

    #[test]
    fn test_partial_payload_needs_more_data() {
        let packet = serialize_frame(&sample_frame()).expect("serialize");
        let partial = &packet[..packet.len() - 3];
        assert!(try_deserialize_frame(partial).expect("partial").is_none());
    }

    #[test]
    fn test_checksum_validation() {
        let mut packet = serialize_frame(&sample_frame()).expect("serialize");
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;

        let result = try_deserialize_frame(&packet);
        assert!(matches!(result, Err(WireError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_invalid_length_too_small() {
        let mut packet = serialize_frame(&sample_frame()).expect("serialize");
        packet[0..4].copy_from_slice(&3u32.to_le_bytes());

        let result = try_deserialize_frame(&packet);
        assert!(matches!(result, Err(WireError::InvalidLength { length: 3 })));
    }

    #[test]
    fn test_trailing_data_left_in_place() {
        let packet = serialize_frame(&sample_frame()).expect("serialize");
        let mut extended = packet.clone();
        extended.extend_from_slice(&serialize_frame(&Frame::Close {}).expect("serialize"));

        let (frame, consumed) = try_deserialize_frame(&extended)
            .expect("deserialize")
            .expect("complete");
        assert_eq!(frame, sample_frame());
        assert_eq!(consumed, packet.len());

        let (next, _) = try_deserialize_frame(&extended[consumed..])
            .expect("deserialize")
            .expect("complete");
        assert_eq!(next, Frame::Close {});
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = Frame::Transfer {
            channel: 0,
            handle: 0,
            tag: b"1".to_vec(),
            settled: false,
            payload: vec![0u8; MAX_PAYLOAD_SIZE],
        };
        // JSON-encoding a 1MB byte array produces well over MAX_PAYLOAD_SIZE.
        let result = serialize_frame(&frame);
        assert!(matches!(result, Err(WireError::PacketTooLarge { .. })));
    }
}
