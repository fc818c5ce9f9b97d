//! Codec module - turning envelopes into frames and frames into replies.
//!
//! - [`MsgPackCodec`] - MessagePack payload serialization
//! - [`TransportCodec`] - per-transport-kind frame codec
//!   - [`UnaryCodec`] - one envelope, exactly one reply
//!   - [`StreamCodec`] - one envelope, chunks then one terminal marker
//!
//! The envelope body on the wire is `{service, command, payload}`; the
//! correlation id travels in the frame header.

mod msgpack;
mod streaming;
mod unary;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use msgpack::MsgPackCodec;
pub use streaming::StreamCodec;
pub use unary::UnaryCodec;

use crate::envelope::{Command, CommandEnvelope, DispatchMode, Reply, StreamElement};
use crate::error::{GatewayError, Result, WorkerError};
use crate::protocol::{flags, Frame, Header};
use crate::writer::OutboundFrame;

/// Decoded frame coming back from a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply(Reply),
    Stream(StreamElement),
}

/// Codec for one transport kind.
///
/// `decode` errors that are not [`GatewayError::Protocol`] belong to the
/// frame's correlation id only; the connection stays usable.
pub trait TransportCodec: Send + Sync + 'static {
    /// Delivery mode this codec carries.
    fn mode(&self) -> DispatchMode;

    /// Encode an envelope into a request frame.
    fn encode(&self, envelope: &CommandEnvelope) -> Result<OutboundFrame> {
        encode_request(envelope)
    }

    /// Decode a frame received from the worker.
    fn decode(&self, frame: &Frame) -> Result<Inbound>;
}

/// Which codec a service connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Unary,
    Streaming,
}

impl CodecKind {
    pub fn codec(self) -> Box<dyn TransportCodec> {
        match self {
            CodecKind::Unary => Box::new(UnaryCodec),
            CodecKind::Streaming => Box::new(StreamCodec),
        }
    }

    pub fn mode(self) -> DispatchMode {
        match self {
            CodecKind::Unary => DispatchMode::Single,
            CodecKind::Streaming => DispatchMode::Stream,
        }
    }
}

/// Envelope body as written by the gateway.
#[derive(Serialize)]
struct EnvelopeBodyRef<'a> {
    service: &'a str,
    command: &'a str,
    payload: &'a Command,
}

/// Routing part of an envelope body, read by workers before the payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnvelopeHead {
    pub service: String,
    pub command: String,
}

#[derive(Deserialize)]
struct EnvelopeBody<T> {
    payload: T,
}

/// Encode an envelope as a request frame.
pub fn encode_request(envelope: &CommandEnvelope) -> Result<OutboundFrame> {
    let body = MsgPackCodec::encode(&EnvelopeBodyRef {
        service: &envelope.service,
        command: &envelope.command,
        payload: &envelope.payload,
    })?;
    let header = Header::new(
        flags::REQUEST,
        envelope.correlation_id,
        0,
        body.len() as u32,
    );
    Ok(OutboundFrame::new(&header, Bytes::from(body)))
}

/// Read the service and command name of a request frame.
pub fn decode_request_head(bytes: &[u8]) -> Result<EnvelopeHead> {
    MsgPackCodec::decode(bytes).map_err(|e| GatewayError::Decode(e.to_string()))
}

/// Read the typed payload of a request frame.
///
/// Fields the handler type does not declare (including the `cmd` tag) are
/// ignored.
pub fn decode_request_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    MsgPackCodec::decode::<EnvelopeBody<T>>(bytes)
        .map(|body| body.payload)
        .map_err(|e| GatewayError::Decode(e.to_string()))
}

/// Decode the payload of an error frame.
fn decode_worker_error(payload: &[u8]) -> Result<WorkerError> {
    MsgPackCodec::decode(payload).map_err(|e| GatewayError::Decode(e.to_string()))
}

/// Reject frames a worker must never send to the gateway.
fn ensure_response(frame: &Frame) -> Result<()> {
    if frame.is_cancel() || !frame.is_response() {
        return Err(GatewayError::Protocol(format!(
            "unexpected non-response frame (flags {:#04x}) from worker",
            frame.header.flags
        )));
    }
    Ok(())
}
