//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};
use crate::envelope::CorrelationId;

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn correlation_id(&self) -> CorrelationId {
        self.header.correlation_id
    }

    #[inline]
    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    #[inline]
    pub fn is_stream(&self) -> bool {
        self.header.is_stream()
    }

    #[inline]
    pub fn is_stream_end(&self) -> bool {
        self.header.is_stream_end()
    }

    #[inline]
    pub fn is_cancel(&self) -> bool {
        self.header.is_cancel()
    }
}

/// Build a complete frame as a single byte vector.
///
/// The writer task sends header and payload as separate slices; this is for
/// tests and tooling that want one contiguous buffer.
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;

    #[test]
    fn test_frame_flag_accessors() {
        let id = CorrelationId::generate();

        let response = Frame::new(Header::new(flags::RESPONSE, id, 0, 0), Bytes::new());
        assert!(response.is_response());
        assert!(!response.is_error());
        assert!(!response.is_stream());
        assert_eq!(response.correlation_id(), id);

        let error = Frame::new(Header::new(flags::ERROR_RESPONSE, id, 0, 0), Bytes::new());
        assert!(error.is_error());

        let chunk = Frame::new(Header::new(flags::STREAM_CHUNK, id, 4, 0), Bytes::new());
        assert!(chunk.is_stream());
        assert!(!chunk.is_stream_end());
        assert_eq!(chunk.sequence(), 4);

        let cancel = Frame::new(Header::new(flags::CANCEL, id, 0, 0), Bytes::new());
        assert!(cancel.is_cancel());
        assert!(!cancel.is_response());
    }

    #[test]
    fn test_build_frame() {
        let header = Header::new(flags::RESPONSE, CorrelationId::generate(), 0, 5);
        let bytes = build_frame(&header, b"hello");

        assert_eq!(bytes.len(), HEADER_SIZE + 5);
        assert_eq!(Header::decode(&bytes[..HEADER_SIZE]).unwrap(), header);
        assert_eq!(&bytes[HEADER_SIZE..], b"hello");
    }
}
