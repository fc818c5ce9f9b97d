//! AI chat worker: streams `{content}` chunks for a prompt.
//!
//! The text comes from a [`ChatBackend`]:
//! - [`EchoBackend`] - deterministic, splits the prompt into words
//! - [`OllamaBackend`] - streams from an Ollama `/api/chat` endpoint

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::envelope::{ChatChunk, ChatPrompt, AI_SERVICE};
use crate::error::{GatewayError, Result, WorkerError};
use crate::transport::BoxFuture;
use crate::worker::{Worker, WorkerBuilder};

/// Stream of text pieces produced for one prompt.
pub type ChatStream = BoxStream<'static, Result<String>>;

/// Source of chat completions.
pub trait ChatBackend: Send + Sync + 'static {
    /// Start a completion for `prompt`.
    fn chat(&self, prompt: &str) -> BoxFuture<'_, Result<ChatStream>>;

    fn name(&self) -> &'static str;
}

/// Streams the prompt back word by word.
#[derive(Debug, Clone, Default)]
pub struct EchoBackend {
    delay: Duration,
}

impl EchoBackend {
    /// Pause `delay` before each chunk.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ChatBackend for EchoBackend {
    fn chat(&self, prompt: &str) -> BoxFuture<'_, Result<ChatStream>> {
        let words: Vec<String> = prompt.split_inclusive(' ').map(str::to_string).collect();
        let delay = self.delay;

        Box::pin(async move {
            let chunks = stream::iter(words).then(move |word| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(word)
            });
            Ok(chunks.boxed())
        })
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// Ollama chat client.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: [OllamaMessage<'a>; 1],
    stream: bool,
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OllamaLine {
    #[serde(default)]
    message: Option<OllamaLineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaLineMessage {
    #[serde(default)]
    content: String,
}

fn upstream_error(message: impl std::fmt::Display) -> GatewayError {
    WorkerError::new(502, format!("chat backend: {message}")).into()
}

impl OllamaBackend {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        }
    }
}

impl ChatBackend for OllamaBackend {
    fn chat(&self, prompt: &str) -> BoxFuture<'_, Result<ChatStream>> {
        let prompt = prompt.to_string();
        Box::pin(async move {
            let body = OllamaRequest {
                model: &self.model,
                messages: [OllamaMessage {
                    role: "user",
                    content: &prompt,
                }],
                stream: true,
            };

            let mut request = self
                .client
                .post(format!("{}/api/chat", self.base_url))
                .json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = request
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(upstream_error)?;

            tracing::debug!(model = %self.model, "Chat stream opened");
            Ok(ndjson_chunks(response.bytes_stream().boxed()).boxed())
        })
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

struct LineState<S> {
    bytes: S,
    buffer: Vec<u8>,
    done: bool,
}

/// Turn an NDJSON chat response body into content pieces.
///
/// Empty pieces are skipped; a line carrying `error` ends the stream with
/// that error.
fn ndjson_chunks<S, E>(bytes: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display,
{
    let state = LineState {
        bytes,
        buffer: Vec::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }

            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                match parse_line(&line) {
                    Ok(Some((content, done))) => {
                        state.done = done;
                        if content.is_empty() {
                            continue;
                        }
                        return Some((Ok(content), state));
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                }
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(upstream_error(e)), state));
                }
                None => {
                    // Last line without a trailing newline.
                    if state.buffer.iter().all(u8::is_ascii_whitespace) {
                        return None;
                    }
                    state.buffer.push(b'\n');
                }
            }
        }
    })
}

/// Parse one NDJSON line into `(content, done)`; blank lines give `None`.
fn parse_line(line: &[u8]) -> Result<Option<(String, bool)>> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let parsed: OllamaLine =
        serde_json::from_slice(trimmed).map_err(|e| upstream_error(format!("bad stream line: {e}")))?;
    if let Some(error) = parsed.error {
        return Err(upstream_error(error));
    }

    let content = parsed.message.map(|m| m.content).unwrap_or_default();
    Ok(Some((content, parsed.done)))
}

/// Worker builder for the AI commands, served from `backend`.
pub fn ai_worker(backend: Arc<dyn ChatBackend>) -> WorkerBuilder {
    tracing::info!(backend = backend.name(), "Chat backend selected");

    Worker::builder(AI_SERVICE)
        .handle_stream("StreamChat", move |request: ChatPrompt, ctx| {
            let backend = backend.clone();
            async move {
                let mut chunks = backend.chat(&request.prompt).await?;
                loop {
                    let next = tokio::select! {
                        _ = ctx.cancelled() => return Ok(()),
                        next = chunks.next() => next,
                    };
                    match next {
                        Some(Ok(content)) => ctx.chunk(&ChatChunk { content }).await?,
                        Some(Err(e)) => return Err(e),
                        None => break,
                    }
                }
                ctx.end().await
            }
        })
}
