//! Error types for gatewire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::CorrelationId;

/// Error reported by a worker for a single command.
///
/// Travels over the wire in error frames and is handed to the caller
/// unchanged. `code` follows HTTP status semantics so the gateway can map it
/// straight onto a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct WorkerError {
    /// HTTP-style status code chosen by the worker.
    pub code: u16,
    /// Human readable reason.
    pub message: String,
}

impl WorkerError {
    /// Create a worker error with an explicit code.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Internal failure inside the worker (code 500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    /// The requested record does not exist (code 404).
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    /// The payload was rejected by the worker (code 400).
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }
}

/// Main error type for all gateway and worker operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No service with this name is configured.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// The service is configured but its connection is down.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Malformed data received from the wire.
    #[error("Decode error: {0}")]
    Decode(String),

    /// No reply arrived before the sweep cutoff.
    #[error("Request timed out")]
    Timeout,

    /// The client went away before the stream terminated.
    #[error("Client cancelled the request")]
    ClientCancelled,

    /// Reply or stream element for an id that is no longer pending.
    #[error("Stale reply for correlation id {0}")]
    StaleReply(CorrelationId),

    /// A correlation id was registered twice.
    #[error("Duplicate correlation id {0}")]
    DuplicateCorrelationId(CorrelationId),

    /// The worker reported a failure for this command.
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// The request was rejected before dispatch.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Protocol violation (bad header, wrong frame kind, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection closed while the operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// I/O error on a socket or file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Configuration could not be loaded.
    #[error("Config error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl GatewayError {
    /// HTTP status code the gateway answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::UnknownService(_) => 404,
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::ServiceUnavailable(_) | GatewayError::ConnectionClosed => 503,
            GatewayError::Timeout => 504,
            GatewayError::Decode(_)
            | GatewayError::Protocol(_)
            | GatewayError::MsgPackDecode(_) => 502,
            GatewayError::ClientCancelled => 499,
            GatewayError::Worker(e) => e.code,
            _ => 500,
        }
    }
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
