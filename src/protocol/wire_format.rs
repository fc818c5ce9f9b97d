//! Wire format encoding and decoding.
//!
//! Implements the 25-byte header format:
//! ```text
//! ┌───────┬────────────────┬──────────┬──────────┐
//! │ Flags │ Correlation ID │ Sequence │ Length   │
//! │ 1 byte│ 16 bytes       │ uint32 BE│ uint32 BE│
//! └───────┴────────────────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The sequence field numbers stream
//! chunks; on a `STREAM_END` frame it carries the total chunk count.

use crate::envelope::CorrelationId;
use crate::error::{GatewayError, Result};

/// Header size in bytes (fixed, exactly 25).
pub const HEADER_SIZE: usize = 1 + CorrelationId::LEN + 4 + 4;

/// Default maximum payload size (64 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Flag constants for the protocol.
pub mod flags {
    /// Message type: response (1) or request (0).
    pub const IS_RESPONSE: u8 = 0b0000_0001;
    /// Error flag: error (1) or ok (0).
    pub const IS_ERROR: u8 = 0b0000_0010;
    /// Stream flag: part of a server stream.
    pub const IS_STREAM: u8 = 0b0000_0100;
    /// Stream end flag: terminal marker of a stream.
    pub const STREAM_END: u8 = 0b0000_1000;
    /// Cancel flag: the gateway gave up on this correlation id.
    pub const IS_CANCEL: u8 = 0b0001_0000;

    /// Reserved bits mask (bits 5-7).
    pub const RESERVED_MASK: u8 = 0b1110_0000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    /// Command envelope from gateway to worker.
    pub const REQUEST: u8 = 0;
    /// Single successful reply: 0x01
    pub const RESPONSE: u8 = IS_RESPONSE;
    /// Single failed reply: 0x03
    pub const ERROR_RESPONSE: u8 = IS_RESPONSE | IS_ERROR;
    /// Stream chunk: 0x05
    pub const STREAM_CHUNK: u8 = IS_RESPONSE | IS_STREAM;
    /// Stream completed: 0x0D
    pub const STREAM_END_RESPONSE: u8 = IS_RESPONSE | IS_STREAM | STREAM_END;
    /// Stream aborted by the worker: 0x0F
    pub const STREAM_ERROR: u8 = IS_RESPONSE | IS_STREAM | STREAM_END | IS_ERROR;
    /// Cancel from gateway to worker: 0x10
    pub const CANCEL: u8 = IS_CANCEL;
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Request the frame belongs to.
    pub correlation_id: CorrelationId,
    /// Chunk position (stream frames) or chunk count (stream end).
    pub sequence: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(flags: u8, correlation_id: CorrelationId, sequence: u32, payload_length: u32) -> Self {
        Self {
            flags,
            correlation_id,
            sequence,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.flags;
        buf[1..17].copy_from_slice(self.correlation_id.as_bytes());
        buf[17..21].copy_from_slice(&self.sequence.to_be_bytes());
        buf[21..25].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut id = [0u8; CorrelationId::LEN];
        id.copy_from_slice(&buf[1..17]);
        Some(Self {
            flags: buf[0],
            correlation_id: CorrelationId::from_bytes(id),
            sequence: u32::from_be_bytes([buf[17], buf[18], buf[19], buf[20]]),
            payload_length: u32::from_be_bytes([buf[21], buf[22], buf[23], buf[24]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Payload length doesn't exceed max
    /// - Reserved flag bits are 0
    /// - Cancel frames are never responses
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(GatewayError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(GatewayError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        if self.is_cancel() && self.is_response() {
            return Err(GatewayError::Protocol(
                "Cancel frame cannot be a response".to_string(),
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_RESPONSE)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }

    #[inline]
    pub fn is_stream(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_STREAM)
    }

    #[inline]
    pub fn is_stream_end(&self) -> bool {
        flags::has_flag(self.flags, flags::STREAM_END)
    }

    #[inline]
    pub fn is_cancel(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_CANCEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(flags::STREAM_CHUNK, CorrelationId::generate(), 7, 100);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_layout() {
        let id = CorrelationId::from_bytes([0xAA; 16]);
        let header = Header::new(0x05, id, 0x01020304, 0x0A0B0C0D);
        let bytes = header.encode();

        assert_eq!(bytes[0], 0x05);
        assert!(bytes[1..17].iter().all(|&b| b == 0xAA));
        assert_eq!(&bytes[17..21], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[21..25], &[0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn test_header_size_is_exactly_25() {
        assert_eq!(HEADER_SIZE, 25);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::new(flags::RESPONSE, CorrelationId::nil(), 0, 1_000_000);
        let result = header.validate(100);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_reserved_bits_must_be_zero() {
        let header = Header::new(0b1000_0000, CorrelationId::nil(), 0, 0);
        let result = header.validate(DEFAULT_MAX_PAYLOAD_SIZE);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Reserved flag bits"));
    }

    #[test]
    fn test_validate_cancel_response_rejected() {
        let header = Header::new(flags::CANCEL | flags::IS_RESPONSE, CorrelationId::nil(), 0, 0);
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_err());
    }

    #[test]
    fn test_flag_combinations() {
        assert_eq!(flags::RESPONSE, 0x01);
        assert_eq!(flags::ERROR_RESPONSE, 0x03);
        assert_eq!(flags::STREAM_CHUNK, 0x05);
        assert_eq!(flags::STREAM_END_RESPONSE, 0x0D);
        assert_eq!(flags::STREAM_ERROR, 0x0F);
        assert_eq!(flags::CANCEL, 0x10);
    }

    #[test]
    fn test_header_accessors() {
        let header = Header::new(flags::STREAM_END_RESPONSE, CorrelationId::nil(), 3, 0);

        assert!(header.is_response());
        assert!(header.is_stream());
        assert!(header.is_stream_end());
        assert!(!header.is_error());
        assert!(!header.is_cancel());
    }
}
