//! Route handlers.

use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::{Multipart, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use super::response::{client_message, ApiResponse};
use super::AppState;
use crate::bridge::{bridge, BridgeEvent};
use crate::envelope::{
    ChatPrompt, Command, InsertNote, ListNotes, NoteLookup, UploadFile, UploadedFile, AI_SERVICE,
};
use crate::error::{GatewayError, Result};

/// Tag given to notes created over HTTP.
pub const HTTP_NOTE_TAG: &str = "note";

#[derive(Debug, Default, Deserialize)]
pub struct NoteQuery {
    pub note: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NoteBody {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AskQuery {
    pub prompt: Option<String>,
}

/// Pick the note command for a `/note` request.
///
/// No title and no id lists every note, an id alone loads that note, and a
/// title saves (or overwrites, with an id) a note.
pub fn note_command(query: NoteQuery, content: String) -> Command {
    let title = query.note.filter(|t| !t.is_empty());
    let id = query.id.filter(|i| !i.is_empty());

    match (title, id) {
        (None, None) => Command::GetNotes(ListNotes::default()),
        (None, Some(id)) => Command::GetNoteByTitle(NoteLookup { id }),
        (Some(title), id) => Command::InsertNote(InsertNote {
            title,
            tag: Some(HTTP_NOTE_TAG.to_string()),
            content,
            id,
        }),
    }
}

/// `POST /note`
pub async fn note(
    State(state): State<AppState>,
    Query(query): Query<NoteQuery>,
    body: Bytes,
) -> Result<ApiResponse<Value>> {
    let body: NoteBody = if body.iter().all(u8::is_ascii_whitespace) {
        NoteBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid note body: {e}")))?
    };

    let command = note_command(query, body.content);
    let service = command.default_service();
    let data = state.router.call(service, command).await?;
    Ok(ApiResponse::ok(data))
}

/// `POST /upload`, multipart field `file`.
pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Result<ApiResponse<Value>> {
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let original_name = field.file_name().unwrap_or("file").to_string();
        let mimetype = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let buffer = field
            .bytes()
            .await
            .map_err(|e| GatewayError::InvalidRequest(format!("failed to read upload: {e}")))?;

        file = Some(UploadedFile {
            original_name,
            mimetype,
            buffer: buffer.to_vec(),
        });
        break;
    }

    let Some(file) = file else {
        return Err(GatewayError::InvalidRequest("missing multipart field `file`".to_string()));
    };

    let command = Command::UploadFile(UploadFile { file });
    let data = state.router.call(command.default_service(), command).await?;
    Ok(ApiResponse::ok(data))
}

/// Text sent for one chunk: its `content` when present, else the JSON.
fn chunk_text(chunk: &Value) -> String {
    match chunk.get("content").and_then(Value::as_str) {
        Some(content) => content.to_string(),
        None => chunk.to_string(),
    }
}

/// Map a bridged event onto an SSE event.
pub(crate) fn sse_event(event: BridgeEvent) -> Event {
    match event {
        BridgeEvent::Data(chunk) => Event::default().data(chunk_text(&chunk)),
        BridgeEvent::Error(e) => {
            tracing::warn!(error = %e, "Stream failed");
            Event::default().event("error").data(client_message(&e))
        }
    }
}

/// `GET /ask?prompt=...`, answered as server-sent events.
pub async fn ask(
    State(state): State<AppState>,
    Query(query): Query<AskQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let prompt = query
        .prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("missing query parameter `prompt`".to_string()))?;

    let handle = state
        .router
        .open_stream(AI_SERVICE, Command::StreamChat(ChatPrompt { prompt }))
        .await?;
    tracing::debug!(correlation_id = %handle.correlation_id(), "Chat stream opened");

    let events = bridge(handle).map(|event| Ok(sse_event(event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
