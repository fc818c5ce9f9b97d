//! Server-streaming codec: zero or more chunks, then exactly one terminal
//! marker (end or error).

use super::{decode_worker_error, ensure_response, Inbound, MsgPackCodec, TransportCodec};
use crate::envelope::{DispatchMode, StreamElement, StreamItem};
use crate::error::{GatewayError, Result};
use crate::protocol::Frame;

/// Codec for server-streaming services.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamCodec;

impl TransportCodec for StreamCodec {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Stream
    }

    fn decode(&self, frame: &Frame) -> Result<Inbound> {
        ensure_response(frame)?;

        if !frame.is_stream() {
            return Err(GatewayError::Decode(
                "single reply received on a streaming connection".to_string(),
            ));
        }

        let item = match (frame.is_stream_end(), frame.is_error()) {
            (true, true) => StreamItem::Error(decode_worker_error(frame.payload())?),
            (true, false) => StreamItem::End {
                chunks: frame.sequence(),
            },
            (false, false) => StreamItem::Chunk {
                sequence: frame.sequence(),
                chunk: MsgPackCodec::decode_value(frame.payload())?,
            },
            (false, true) => {
                return Err(GatewayError::Decode(
                    "error flag set on a non-terminal stream frame".to_string(),
                ))
            }
        };

        Ok(Inbound::Stream(StreamElement {
            correlation_id: frame.correlation_id(),
            item,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ChatChunk, CorrelationId};
    use crate::error::WorkerError;
    use crate::protocol::{flags, Header};
    use bytes::Bytes;

    fn frame(flags: u8, sequence: u32, payload: Vec<u8>) -> Frame {
        let header = Header::new(flags, CorrelationId::nil(), sequence, payload.len() as u32);
        Frame::new(header, Bytes::from(payload))
    }

    fn item(frame: &Frame) -> StreamItem {
        match StreamCodec.decode(frame).unwrap() {
            Inbound::Stream(element) => element.item,
            other => panic!("expected stream element, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_chunk() {
        let payload = MsgPackCodec::encode(&ChatChunk {
            content: "He".to_string(),
        })
        .unwrap();

        assert_eq!(
            item(&frame(flags::STREAM_CHUNK, 0, payload)),
            StreamItem::Chunk {
                sequence: 0,
                chunk: serde_json::json!({ "content": "He" }),
            }
        );
    }

    #[test]
    fn test_end_carries_chunk_count() {
        let end = item(&frame(flags::STREAM_END_RESPONSE, 2, vec![]));
        assert_eq!(end, StreamItem::End { chunks: 2 });
        assert!(end.is_terminal());
    }

    #[test]
    fn test_decode_stream_error() {
        let payload = MsgPackCodec::encode(&WorkerError::internal("model offline")).unwrap();
        assert_eq!(
            item(&frame(flags::STREAM_ERROR, 1, payload)),
            StreamItem::Error(WorkerError::internal("model offline"))
        );
    }

    #[test]
    fn test_single_reply_is_decode_error() {
        let result = StreamCodec.decode(&frame(flags::RESPONSE, 0, vec![]));
        assert!(matches!(result, Err(GatewayError::Decode(_))));
    }
}
