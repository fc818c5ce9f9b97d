//! Point-to-point codec: one envelope, exactly one reply.

use super::{decode_worker_error, ensure_response, Inbound, MsgPackCodec, TransportCodec};
use crate::envelope::{DispatchMode, Reply};
use crate::error::{GatewayError, Result};
use crate::protocol::Frame;

/// Codec for request/response services.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnaryCodec;

impl TransportCodec for UnaryCodec {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Single
    }

    fn decode(&self, frame: &Frame) -> Result<Inbound> {
        ensure_response(frame)?;

        if frame.is_stream() {
            return Err(GatewayError::Decode(
                "stream frame received on a unary connection".to_string(),
            ));
        }

        let outcome = if frame.is_error() {
            Err(decode_worker_error(frame.payload())?)
        } else {
            Ok(MsgPackCodec::decode_value(frame.payload())?)
        };

        Ok(Inbound::Reply(Reply {
            correlation_id: frame.correlation_id(),
            outcome,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CorrelationId;
    use crate::error::WorkerError;
    use crate::protocol::{flags, Header};
    use bytes::Bytes;

    fn frame(flags: u8, payload: Vec<u8>) -> Frame {
        let header = Header::new(flags, CorrelationId::generate(), 0, payload.len() as u32);
        Frame::new(header, Bytes::from(payload))
    }

    #[test]
    fn test_decode_ok_reply() {
        let payload = MsgPackCodec::encode(&serde_json::json!({ "message": "saved" })).unwrap();
        let frame = frame(flags::RESPONSE, payload);

        let Inbound::Reply(reply) = UnaryCodec.decode(&frame).unwrap() else {
            panic!("expected reply");
        };
        assert_eq!(reply.correlation_id, frame.correlation_id());
        assert_eq!(reply.outcome.unwrap()["message"], "saved");
    }

    #[test]
    fn test_decode_error_reply() {
        let payload = MsgPackCodec::encode(&WorkerError::not_found("no such note")).unwrap();
        let frame = frame(flags::ERROR_RESPONSE, payload);

        let Inbound::Reply(reply) = UnaryCodec.decode(&frame).unwrap() else {
            panic!("expected reply");
        };
        assert_eq!(reply.outcome, Err(WorkerError::not_found("no such note")));
    }

    #[test]
    fn test_stream_frame_is_decode_error() {
        let frame = frame(flags::STREAM_CHUNK, vec![]);
        assert!(matches!(
            UnaryCodec.decode(&frame),
            Err(GatewayError::Decode(_))
        ));
    }

    #[test]
    fn test_malformed_payload_is_decode_error() {
        let frame = frame(flags::RESPONSE, vec![0xc1, 0x00]);
        assert!(matches!(
            UnaryCodec.decode(&frame),
            Err(GatewayError::Decode(_))
        ));
    }

    #[test]
    fn test_request_frame_is_protocol_error() {
        let frame = frame(flags::REQUEST, vec![]);
        assert!(matches!(
            UnaryCodec.decode(&frame),
            Err(GatewayError::Protocol(_))
        ));
    }
}
