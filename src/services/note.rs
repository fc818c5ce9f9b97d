//! Note worker: notes stored as flat JSON files.
//!
//! Each note lives in `<dir>/<id>.json` as
//! `{id, title, tag, content, updatedAt}`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{InsertNote, ListNotes, NoteLookup, NOTE_SERVICE};
use crate::error::{GatewayError, Result, WorkerError};
use crate::worker::{Worker, WorkerBuilder};

/// Tag used when the caller gives none.
pub const DEFAULT_TAG: &str = "general";

/// A stored note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub title: String,
    pub tag: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// Reply to `insert_note`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedNote {
    pub id: String,
    pub message: String,
    pub path: String,
}

/// Replace characters that are unsafe in file names with `-`.
pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '%' | '*' | ':' | '|' | '"' | '<' | '>' => '-',
            c => c,
        })
        .collect()
}

/// Note ids become file names, so they must not walk out of the directory.
fn check_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
        return Err(WorkerError::bad_request(format!("invalid note id: {id:?}")).into());
    }
    Ok(())
}

/// Directory of note files.
#[derive(Debug, Clone)]
pub struct NoteStore {
    dir: PathBuf,
}

impl NoteStore {
    /// Open the store, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn note_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Create or overwrite a note. Write failures are returned, not logged
    /// away.
    pub async fn insert(&self, request: InsertNote) -> Result<SavedNote> {
        let id = match request.id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        check_id(&id)?;

        let note = Note {
            id: id.clone(),
            title: sanitize_title(&request.title),
            tag: request
                .tag
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_TAG.to_string()),
            content: request.content,
            updated_at: Utc::now(),
        };

        let path = self.note_path(&id);
        let body = serde_json::to_vec_pretty(&note)?;
        tokio::fs::write(&path, body).await.map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to write note");
            GatewayError::from(WorkerError::internal(format!("failed to write note {id}: {e}")))
        })?;

        tracing::info!(%id, "Note saved");
        Ok(SavedNote {
            message: format!("saved file: {id}.json"),
            path: path.display().to_string(),
            id,
        })
    }

    /// Every note in the directory.
    ///
    /// Files that are not notes are skipped.
    pub async fn list(&self) -> Result<Vec<Note>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut notes = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Note>(&bytes) {
                Ok(note) => notes.push(note),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable note"),
            }
        }

        notes.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(notes)
    }

    /// Load one note by id.
    pub async fn get(&self, id: &str) -> Result<Note> {
        check_id(id)?;
        let path = self.note_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkerError::not_found(format!("note {id} not found")).into());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Worker builder for the note commands, served from `store`.
pub fn note_worker(store: NoteStore) -> WorkerBuilder {
    let store = Arc::new(store);
    let insert_store = store.clone();
    let list_store = store.clone();

    Worker::builder(NOTE_SERVICE)
        .handle("insert_note", move |request: InsertNote, ctx| {
            let store = insert_store.clone();
            async move { ctx.respond(&store.insert(request).await?).await }
        })
        .handle("get_notes", move |_: ListNotes, ctx| {
            let store = list_store.clone();
            async move { ctx.respond(&store.list().await?).await }
        })
        .handle("get_note_by_title", move |lookup: NoteLookup, ctx| {
            let store = store.clone();
            async move { ctx.respond(&store.get(&lookup.id).await?).await }
        })
}
