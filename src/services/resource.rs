//! Resource worker: uploaded files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::envelope::{FileLookup, UploadFile, UploadedFile, RESOURCE_SERVICE};
use crate::error::{GatewayError, Result, WorkerError};
use crate::worker::{Worker, WorkerBuilder};

/// Reply to `upload_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub url: String,
}

/// Reply to `get_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    #[serde(rename = "filePath")]
    pub file_path: String,
    /// Base64 (standard alphabet) of the file bytes.
    pub content: String,
}

/// Extension an upload is stored with.
fn extension_for(mimetype: &str) -> &'static str {
    if mimetype == "image/png" {
        "png"
    } else {
        "text"
    }
}

/// Directory of uploaded files, served back under `public_base_url`.
#[derive(Debug, Clone)]
pub struct ResourceStore {
    dir: PathBuf,
    public_base_url: String,
}

impl ResourceStore {
    pub async fn open(dir: impl Into<PathBuf>, public_base_url: &str) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store an upload as `<unix-millis>-<uuid>.<png|text>`.
    pub async fn upload(&self, file: UploadedFile) -> Result<StoredFile> {
        let name = format!(
            "{}-{}.{}",
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4(),
            extension_for(&file.mimetype)
        );
        let path = self.dir.join(&name);

        tokio::fs::write(&path, &file.buffer).await.map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to write upload");
            GatewayError::from(WorkerError::internal(format!("failed to store {}: {e}", file.original_name)))
        })?;

        tracing::info!(
            original = %file.original_name,
            stored = %name,
            bytes = file.buffer.len(),
            "File stored"
        );
        Ok(StoredFile {
            url: format!("{}/{name}", self.public_base_url),
        })
    }

    /// Read a stored file back.
    pub async fn get(&self, file_path: &str) -> Result<FileContent> {
        if file_path.is_empty() || file_path.contains(['/', '\\']) || file_path.contains("..") {
            return Err(WorkerError::bad_request(format!("invalid file path: {file_path:?}")).into());
        }

        let bytes = match tokio::fs::read(self.dir.join(file_path)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkerError::not_found(format!("file {file_path} not found")).into());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(FileContent {
            file_path: file_path.to_string(),
            content: base64::engine::general_purpose::STANDARD.encode(bytes),
        })
    }
}

/// Worker builder for the resource commands, served from `store`.
pub fn resource_worker(store: ResourceStore) -> WorkerBuilder {
    let store = Arc::new(store);
    let upload_store = store.clone();

    Worker::builder(RESOURCE_SERVICE)
        .handle("upload_file", move |request: UploadFile, ctx| {
            let store = upload_store.clone();
            async move { ctx.respond(&store.upload(request.file).await?).await }
        })
        .handle("get_file", move |lookup: FileLookup, ctx| {
            let store = store.clone();
            async move { ctx.respond(&store.get(&lookup.file_path).await?).await }
        })
}
