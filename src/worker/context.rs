//! Request context for worker handlers.
//!
//! Provides methods for answering the gateway:
//! - `respond` - send the single reply
//! - `chunk` - send the next stream chunk
//! - `end` - end a stream (the frame carries the chunk count)
//! - `error` - fail the request
//!
//! # Example
//!
//! ```ignore
//! async fn get_note(lookup: NoteLookup, ctx: RequestContext) -> Result<()> {
//!     ctx.respond(&load(&lookup.id)?).await
//! }
//!
//! async fn chat(prompt: ChatPrompt, ctx: RequestContext) -> Result<()> {
//!     for word in prompt.prompt.split(' ') {
//!         ctx.chunk(&ChatChunk { content: word.to_string() }).await?;
//!     }
//!     ctx.end().await
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::codec::MsgPackCodec;
use crate::envelope::{CorrelationId, DispatchMode};
use crate::error::{GatewayError, Result, WorkerError};
use crate::protocol::{flags, Header};
use crate::writer::{OutboundFrame, WriterHandle};

/// Context passed to request handlers.
///
/// `Clone` and safe to share across tasks; every clone answers the same
/// request. The first terminal answer (`respond`, `end`, `error`) wins and
/// later ones fail.
#[derive(Clone)]
pub struct RequestContext {
    command: Arc<str>,
    correlation_id: CorrelationId,
    mode: DispatchMode,
    writer: Option<WriterHandle>,
    next_sequence: Arc<AtomicU32>,
    finished: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Create a context that discards everything it sends (for tests).
    pub fn new(command: &str, correlation_id: CorrelationId, mode: DispatchMode) -> Self {
        Self {
            command: Arc::from(command),
            correlation_id,
            mode,
            writer: None,
            next_sequence: Arc::new(AtomicU32::new(0)),
            finished: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    /// Create a context answering through `writer`.
    pub fn with_writer(
        command: &str,
        correlation_id: CorrelationId,
        mode: DispatchMode,
        writer: WriterHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            writer: Some(writer),
            cancel,
            ..Self::new(command, correlation_id, mode)
        }
    }

    #[inline]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[inline]
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    #[inline]
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Whether a terminal answer has been sent.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Whether the gateway cancelled this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the gateway cancels this request.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Number of chunks sent so far.
    pub fn chunks_sent(&self) -> u32 {
        self.next_sequence.load(Ordering::Acquire)
    }

    /// Send the single reply.
    pub async fn respond<T: serde::Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        if self.mode != DispatchMode::Single {
            return Err(GatewayError::Protocol(format!(
                "{} is a streaming command; use chunk/end",
                self.command
            )));
        }
        let data = MsgPackCodec::encode(value)?;
        self.finish()?;
        self.send_frame(flags::RESPONSE, 0, Bytes::from(data)).await
    }

    /// Send the next stream chunk.
    ///
    /// Fails with `ClientCancelled` once the gateway has cancelled the
    /// request, so producer loops stop.
    pub async fn chunk<T: serde::Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        if self.mode != DispatchMode::Stream {
            return Err(GatewayError::Protocol(format!(
                "{} is a single-reply command; use respond",
                self.command
            )));
        }
        if self.is_cancelled() {
            return Err(GatewayError::ClientCancelled);
        }
        if self.is_finished() {
            return Err(GatewayError::Protocol(format!(
                "stream {} already ended",
                self.correlation_id
            )));
        }

        let data = MsgPackCodec::encode(value)?;
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        self.send_frame(flags::STREAM_CHUNK, sequence, Bytes::from(data))
            .await
    }

    /// End the stream.
    ///
    /// The end frame has an empty payload; its sequence field carries the
    /// number of chunks sent.
    pub async fn end(&self) -> Result<()> {
        if self.mode != DispatchMode::Stream {
            return Err(GatewayError::Protocol(format!(
                "{} is a single-reply command; use respond",
                self.command
            )));
        }
        self.finish()?;
        if self.is_cancelled() {
            return Ok(());
        }
        self.send_frame(flags::STREAM_END_RESPONSE, self.chunks_sent(), Bytes::new())
            .await
    }

    /// Fail the request with `error`.
    pub async fn error(&self, error: WorkerError) -> Result<()> {
        self.finish()?;
        if self.is_cancelled() {
            return Ok(());
        }

        let data = MsgPackCodec::encode(&error)?;
        let (frame_flags, sequence) = match self.mode {
            DispatchMode::Single => (flags::ERROR_RESPONSE, 0),
            DispatchMode::Stream => (flags::STREAM_ERROR, self.chunks_sent()),
        };
        self.send_frame(frame_flags, sequence, Bytes::from(data)).await
    }

    fn finish(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(GatewayError::Protocol(format!(
                "request {} already answered",
                self.correlation_id
            )));
        }
        Ok(())
    }

    async fn send_frame(&self, frame_flags: u8, sequence: u32, payload: Bytes) -> Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };

        let header = Header::new(
            frame_flags,
            self.correlation_id,
            sequence,
            payload.len() as u32,
        );
        writer.send(OutboundFrame::new(&header, payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuffer;
    use crate::writer::{spawn_writer_task, WriterConfig};
    use tokio::io::{duplex, AsyncReadExt};

    fn stream_ctx() -> RequestContext {
        RequestContext::new("StreamChat", CorrelationId::generate(), DispatchMode::Stream)
    }

    #[tokio::test]
    async fn test_respond_only_once() {
        let ctx = RequestContext::new("get_notes", CorrelationId::generate(), DispatchMode::Single);

        assert!(ctx.respond(&"first").await.is_ok());
        assert!(ctx.is_finished());
        assert!(ctx.respond(&"second").await.is_err());
        assert!(ctx.error(WorkerError::internal("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_mode_mismatch_is_rejected() {
        let single = RequestContext::new("get_notes", CorrelationId::generate(), DispatchMode::Single);
        assert!(single.chunk(&1).await.is_err());
        assert!(single.end().await.is_err());

        assert!(stream_ctx().respond(&1).await.is_err());
    }

    #[tokio::test]
    async fn test_chunks_counted_and_end_closes() {
        let ctx = stream_ctx();

        ctx.chunk(&"a").await.unwrap();
        ctx.chunk(&"b").await.unwrap();
        assert_eq!(ctx.chunks_sent(), 2);

        ctx.end().await.unwrap();
        assert!(ctx.chunk(&"c").await.is_err());
    }

    #[tokio::test]
    async fn test_chunk_after_cancel_fails() {
        let cancel = CancellationToken::new();
        let (client, _server) = duplex(4096);
        let (writer, _task) = spawn_writer_task(client, WriterConfig::default());
        let ctx = RequestContext::with_writer(
            "StreamChat",
            CorrelationId::generate(),
            DispatchMode::Stream,
            writer,
            cancel.clone(),
        );

        ctx.chunk(&"a").await.unwrap();
        cancel.cancel();

        assert!(ctx.is_cancelled());
        assert!(matches!(
            ctx.chunk(&"b").await,
            Err(GatewayError::ClientCancelled)
        ));
        // Ending a cancelled stream is quiet.
        assert!(ctx.end().await.is_ok());
    }

    #[tokio::test]
    async fn test_frames_written() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task(client, WriterConfig::default());
        let id = CorrelationId::generate();
        let ctx = RequestContext::with_writer(
            "StreamChat",
            id,
            DispatchMode::Stream,
            writer,
            CancellationToken::new(),
        );

        ctx.chunk(&"He").await.unwrap();
        ctx.chunk(&"llo").await.unwrap();
        ctx.end().await.unwrap();

        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 4096];
        while frames.len() < 3 {
            let n = server.read(&mut buf).await.unwrap();
            frames.extend(buffer.push(&buf[..n]).unwrap());
        }

        assert_eq!(frames[0].sequence(), 0);
        assert_eq!(frames[1].sequence(), 1);
        assert!(frames[2].is_stream_end());
        assert_eq!(frames[2].sequence(), 2);
        assert!(frames.iter().all(|f| f.correlation_id() == id));
    }
}
