//! Worker builder and runtime loop.
//!
//! The [`WorkerBuilder`] collects handlers; the [`Worker`] accepts gateway
//! connections and, for each one:
//! 1. spawns a writer task
//! 2. reads request frames and decodes the envelope head
//! 3. runs the matching handler in its own task
//! 4. turns handler errors into error frames
//!
//! # Example
//!
//! ```ignore
//! use gatewire::worker::Worker;
//!
//! let worker = Worker::builder("ai")
//!     .handle_stream("StreamChat", |prompt: ChatPrompt, ctx| async move {
//!         for word in prompt.prompt.split(' ') {
//!             ctx.chunk(&ChatChunk { content: word.to_string() }).await?;
//!         }
//!         ctx.end().await
//!     })
//!     .build();
//!
//! worker.serve(listener, shutdown).await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{HandlerRegistry, HandlerResult, RequestContext};
use crate::codec::decode_request_head;
use crate::envelope::{CorrelationId, DispatchMode};
use crate::error::{GatewayError, Result, WorkerError};
use crate::protocol::{Frame, FrameBuffer, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::transport::EndpointListener;
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default maximum concurrent handlers per connection.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Builder for a [`Worker`].
pub struct WorkerBuilder {
    service: String,
    registry: HandlerRegistry,
    writer_config: WriterConfig,
    max_concurrent_handlers: usize,
    max_payload_size: u32,
}

impl WorkerBuilder {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            registry: HandlerRegistry::new(),
            writer_config: WriterConfig::default(),
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Register a single-reply handler.
    ///
    /// The handler receives the decoded payload and answers with
    /// `ctx.respond()`; returning `Err` sends an error frame instead.
    pub fn handle<F, T, Fut>(mut self, command: &str, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry
            .register(command, DispatchMode::Single, handler);
        self
    }

    /// Register a streaming handler.
    ///
    /// Use `ctx.chunk()` for each element and `ctx.end()` to finish. A
    /// handler that returns `Ok` without ending gets its stream ended.
    pub fn handle_stream<F, T, Fut>(mut self, command: &str, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry
            .register(command, DispatchMode::Stream, handler);
        self
    }

    /// Maximum handlers running at once on one connection.
    ///
    /// Requests beyond the limit are answered with a 503 error frame.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = limit;
        self
    }

    /// Writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Largest request payload accepted.
    ///
    /// Default: 64 MB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn build(self) -> Worker {
        Worker {
            inner: Arc::new(WorkerInner {
                service: self.service,
                registry: self.registry,
                writer_config: self.writer_config,
                max_concurrent_handlers: self.max_concurrent_handlers,
                max_payload_size: self.max_payload_size,
            }),
        }
    }
}

struct WorkerInner {
    service: String,
    registry: HandlerRegistry,
    writer_config: WriterConfig,
    max_concurrent_handlers: usize,
    max_payload_size: u32,
}

/// A worker serving one service.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

/// Cancellation tokens of the requests running on one connection.
type ActiveRequests = Arc<Mutex<HashMap<CorrelationId, CancellationToken>>>;

impl Worker {
    pub fn builder(service: &str) -> WorkerBuilder {
        WorkerBuilder::new(service)
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Accept gateway connections until `shutdown` fires.
    pub async fn serve(&self, listener: EndpointListener, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            service = %self.inner.service,
            commands = ?self.inner.registry.commands(),
            "Worker listening"
        );

        loop {
            let (reader, writer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(service = %self.inner.service, error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let worker = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = worker.serve_connection(reader, writer) => {
                        if let Err(e) = result {
                            tracing::warn!(service = %worker.inner.service, error = %e, "Gateway connection failed");
                        }
                    }
                }
            });
        }

        tracing::info!(service = %self.inner.service, "Worker stopped");
        Ok(())
    }

    /// Serve one gateway connection until it closes.
    pub async fn serve_connection<R, W>(&self, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, _writer_task) = spawn_writer_task(writer, self.inner.writer_config.clone());
        let semaphore = Arc::new(Semaphore::new(self.inner.max_concurrent_handlers));
        let active: ActiveRequests = Arc::new(Mutex::new(HashMap::new()));

        let mut frame_buffer = FrameBuffer::with_max_payload(self.inner.max_payload_size);
        let mut buf = vec![0u8; 64 * 1024];

        let result = loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(GatewayError::Io(e)),
            };

            let frames = match frame_buffer.push(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => break Err(e),
            };

            for frame in frames {
                self.dispatch_frame(frame, &writer, &semaphore, &active);
            }
        };

        // The gateway is gone; nobody is left to read what handlers produce.
        for (_, token) in active.lock().drain() {
            token.cancel();
        }
        tracing::debug!(service = %self.inner.service, "Gateway connection closed");
        result
    }

    /// Dispatch a single frame to its handler.
    fn dispatch_frame(
        &self,
        frame: Frame,
        writer: &WriterHandle,
        semaphore: &Arc<Semaphore>,
        active: &ActiveRequests,
    ) {
        let id = frame.correlation_id();

        if frame.is_cancel() {
            match active.lock().remove(&id) {
                Some(token) => {
                    tracing::debug!(correlation_id = %id, "Request cancelled by gateway");
                    token.cancel();
                }
                None => tracing::debug!(correlation_id = %id, "Cancel for finished request"),
            }
            return;
        }

        if frame.is_response() {
            tracing::warn!(correlation_id = %id, "Received unexpected response frame");
            return;
        }

        let registry = &self.inner.registry;
        let head = match decode_request_head(frame.payload()) {
            Ok(head) => head,
            Err(e) => {
                self.reject(id, registry.fallback_mode(), writer, WorkerError::bad_request(e.to_string()));
                return;
            }
        };

        if head.service != self.inner.service {
            self.reject(
                id,
                registry.get_mode(&head.command).unwrap_or(registry.fallback_mode()),
                writer,
                WorkerError::not_found(format!("unknown service: {}", head.service)),
            );
            return;
        }

        let Some(mode) = registry.get_mode(&head.command) else {
            self.reject(
                id,
                registry.fallback_mode(),
                writer,
                WorkerError::not_found(format!("unknown command: {}", head.command)),
            );
            return;
        };

        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(
                    correlation_id = %id,
                    command = %head.command,
                    "Handler capacity reached, rejecting request"
                );
                self.reject(id, mode, writer, WorkerError::new(503, "worker is at capacity"));
                return;
            }
        };

        let cancel = CancellationToken::new();
        active.lock().insert(id, cancel.clone());
        let ctx = RequestContext::with_writer(&head.command, id, mode, writer.clone(), cancel);

        let worker = self.clone();
        let active = active.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let command = head.command;

            let result = match worker.inner.registry.get_handler(&command) {
                Some(handler) => handler.call(frame.payload(), ctx.clone()).await,
                None => Err(WorkerError::not_found(format!("unknown command: {command}")).into()),
            };
            active.lock().remove(&id);

            if let Err(e) = finish_request(&ctx, result).await {
                tracing::warn!(correlation_id = %id, %command, error = %e, "Failed to answer request");
            }
        });
    }

    /// Answer a request that never reaches a handler.
    fn reject(&self, id: CorrelationId, mode: DispatchMode, writer: &WriterHandle, error: WorkerError) {
        tracing::warn!(service = %self.inner.service, correlation_id = %id, error = %error, "Rejecting request");
        let ctx = RequestContext::with_writer("", id, mode, writer.clone(), CancellationToken::new());
        tokio::spawn(async move {
            if let Err(e) = ctx.error(error).await {
                tracing::debug!(correlation_id = %id, error = %e, "Failed to send rejection");
            }
        });
    }
}

/// Send whatever terminal answer the handler left out.
async fn finish_request(ctx: &RequestContext, result: HandlerResult) -> Result<()> {
    match result {
        Ok(()) if ctx.is_finished() => Ok(()),
        Ok(()) => match ctx.mode() {
            DispatchMode::Stream => ctx.end().await,
            DispatchMode::Single => {
                ctx.error(WorkerError::internal(format!(
                    "handler for {} returned without responding",
                    ctx.command()
                )))
                .await
            }
        },
        Err(GatewayError::ClientCancelled) if ctx.is_cancelled() => Ok(()),
        Err(e) => {
            tracing::debug!(
                correlation_id = %ctx.correlation_id(),
                command = %ctx.command(),
                error = %e,
                "Handler failed"
            );
            if ctx.is_finished() {
                return Ok(());
            }
            ctx.error(to_worker_error(e)).await
        }
    }
}

/// Error frame contents for a failed handler.
pub fn to_worker_error(error: GatewayError) -> WorkerError {
    match error {
        GatewayError::Worker(e) => e,
        GatewayError::Decode(message) => WorkerError::bad_request(message),
        other => WorkerError::new(other.status_code(), other.to_string()),
    }
}
