//! Data model shared by the gateway and the workers.
//!
//! - [`CorrelationId`] - 128-bit token matching replies to requests
//! - [`Command`] - closed set of commands with typed payloads
//! - [`CommandEnvelope`] - unit of work sent to a worker
//! - [`Reply`] / [`StreamElement`] - what comes back
//!
//! Commands serialize as `{cmd: <name>, ...fields}`, which is the shape the
//! workers match on.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GatewayError, Result, WorkerError};

/// Service name of the note worker.
pub const NOTE_SERVICE: &str = "note";
/// Service name of the resource (file) worker.
pub const RESOURCE_SERVICE: &str = "resource";
/// Service name of the AI chat worker.
pub const AI_SERVICE: &str = "ai";

/// Opaque token identifying one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Size of the token on the wire.
    pub const LEN: usize = 16;

    /// Generate a fresh random token.
    ///
    /// Collisions between v4 UUIDs are not handled.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Rebuild a token from its wire bytes.
    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Wire bytes of the token.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        self.0.as_bytes()
    }

    /// The nil token (all zero bytes).
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How the caller wants the outcome delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Exactly one reply.
    Single,
    /// Zero or more chunks followed by a terminal marker.
    Stream,
}

/// Payload of `insert_note`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertNote {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub content: String,
    /// Existing note id to overwrite; a new id is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Payload of `get_notes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListNotes {}

/// Payload of `get_note_by_title` (the lookup is by id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteLookup {
    pub id: String,
}

/// A file received by the gateway's upload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    #[serde(rename = "originalname")]
    pub original_name: String,
    pub mimetype: String,
    #[serde(with = "serde_bytes")]
    pub buffer: Vec<u8>,
}

/// Payload of `upload_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFile {
    pub file: UploadedFile,
}

/// Payload of `get_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLookup {
    #[serde(rename = "filePath")]
    pub file_path: String,
}

/// Payload of `StreamChat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPrompt {
    pub prompt: String,
}

/// One chunk of a `StreamChat` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChunk {
    pub content: String,
}

/// Every command the gateway knows how to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    #[serde(rename = "insert_note")]
    InsertNote(InsertNote),
    #[serde(rename = "get_notes")]
    GetNotes(ListNotes),
    #[serde(rename = "get_note_by_title")]
    GetNoteByTitle(NoteLookup),
    #[serde(rename = "upload_file")]
    UploadFile(UploadFile),
    #[serde(rename = "get_file")]
    GetFile(FileLookup),
    #[serde(rename = "StreamChat")]
    StreamChat(ChatPrompt),
}

impl Command {
    /// Wire name of the command (the `cmd` tag).
    pub fn name(&self) -> &'static str {
        match self {
            Command::InsertNote(_) => "insert_note",
            Command::GetNotes(_) => "get_notes",
            Command::GetNoteByTitle(_) => "get_note_by_title",
            Command::UploadFile(_) => "upload_file",
            Command::GetFile(_) => "get_file",
            Command::StreamChat(_) => "StreamChat",
        }
    }

    /// Service that serves this command in the default deployment.
    pub fn default_service(&self) -> &'static str {
        match self {
            Command::InsertNote(_) | Command::GetNotes(_) | Command::GetNoteByTitle(_) => {
                NOTE_SERVICE
            }
            Command::UploadFile(_) | Command::GetFile(_) => RESOURCE_SERVICE,
            Command::StreamChat(_) => AI_SERVICE,
        }
    }

    /// Delivery mode the command produces.
    pub fn mode(&self) -> DispatchMode {
        match self {
            Command::StreamChat(_) => DispatchMode::Stream,
            _ => DispatchMode::Single,
        }
    }

    /// Reject payloads no worker could act on.
    pub fn validate(&self) -> Result<()> {
        match self {
            Command::InsertNote(note) if note.title.trim().is_empty() => Err(
                GatewayError::InvalidRequest("note title must not be empty".to_string()),
            ),
            Command::GetNoteByTitle(lookup) if lookup.id.trim().is_empty() => Err(
                GatewayError::InvalidRequest("note id must not be empty".to_string()),
            ),
            Command::UploadFile(upload) if upload.file.buffer.is_empty() => Err(
                GatewayError::InvalidRequest("uploaded file is empty".to_string()),
            ),
            Command::GetFile(lookup)
                if lookup.file_path.is_empty() || lookup.file_path.contains("..") =>
            {
                Err(GatewayError::InvalidRequest(format!(
                    "invalid file path: {:?}",
                    lookup.file_path
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Unit of work sent from the gateway to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub service: String,
    pub command: String,
    pub correlation_id: CorrelationId,
    pub payload: Command,
}

impl CommandEnvelope {
    /// Build an envelope for `payload` with a fresh correlation id.
    pub fn new(service: &str, payload: Command) -> Self {
        Self {
            service: service.to_string(),
            command: payload.name().to_string(),
            correlation_id: CorrelationId::generate(),
            payload,
        }
    }
}

/// Outcome of a single-reply command.
pub type Outcome = std::result::Result<serde_json::Value, WorkerError>;

/// Reply to a single-reply command.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub correlation_id: CorrelationId,
    pub outcome: Outcome,
}

/// Payload of one stream element.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A data chunk at position `sequence` (0-based).
    Chunk {
        sequence: u32,
        chunk: serde_json::Value,
    },
    /// The stream completed after `chunks` chunks.
    End { chunks: u32 },
    /// The worker aborted the stream.
    Error(WorkerError),
}

impl StreamItem {
    /// Whether this item ends the stream.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamItem::Chunk { .. })
    }
}

/// An element of a server stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamElement {
    pub correlation_id: CorrelationId,
    pub item: StreamItem,
}
