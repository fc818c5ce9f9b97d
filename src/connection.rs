//! Gateway side of one worker connection.
//!
//! A [`WorkerConnection`] owns:
//! 1. a writer task (the only thing touching the socket's write half)
//! 2. a reader loop (the only caller of `resolve`/`push`/`terminate`)
//! 3. the [`CorrelationRegistry`] of everything in flight on this socket
//!
//! When either side of the socket fails the connection is marked dead and
//! every pending entry fails with [`GatewayError::ConnectionClosed`].

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::{CodecKind, Inbound, TransportCodec};
use crate::envelope::{CommandEnvelope, CorrelationId, StreamItem};
use crate::error::{GatewayError, Result};
use crate::protocol::{flags, FrameBuffer, Header, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::registry::{CorrelationRegistry, PendingHandle, Termination};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Size of the socket read buffer.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub writer: WriterConfig,
    /// Frames announcing a larger payload close the connection.
    pub max_payload_size: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Live connection to one named worker.
pub struct WorkerConnection {
    service: String,
    codec: Arc<dyn TransportCodec>,
    registry: Arc<CorrelationRegistry>,
    writer: WriterHandle,
    closed: CancellationToken,
}

impl WorkerConnection {
    /// Wrap an already established byte stream.
    ///
    /// Spawns the writer task and the reader loop; must be called inside a
    /// tokio runtime.
    pub fn from_io<R, W>(
        service: &str,
        kind: CodecKind,
        reader: R,
        writer: W,
        settings: ConnectionSettings,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let codec: Arc<dyn TransportCodec> = Arc::from(kind.codec());
        let registry = Arc::new(CorrelationRegistry::new());
        let closed = CancellationToken::new();

        let (writer, writer_task) = spawn_writer_task(writer, settings.writer);

        {
            let closed = closed.clone();
            let service = service.to_string();
            tokio::spawn(async move {
                match writer_task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(%service, error = %e, "Writer stopped"),
                    Err(e) => tracing::error!(%service, error = %e, "Writer task panicked"),
                }
                closed.cancel();
            });
        }

        {
            let codec = codec.clone();
            let registry = registry.clone();
            let closed = closed.clone();
            let service = service.to_string();
            let max_payload_size = settings.max_payload_size;
            tokio::spawn(async move {
                let result = read_loop(reader, codec.as_ref(), &registry, max_payload_size, &closed).await;
                closed.cancel();

                let failed = registry.drain(|| GatewayError::ConnectionClosed);
                match result {
                    Ok(()) => tracing::info!(%service, failed, "Worker connection closed"),
                    Err(e) => tracing::error!(%service, failed, error = %e, "Worker connection failed"),
                }
            });
        }

        Self {
            service: service.to_string(),
            codec,
            registry,
            writer,
            closed,
        }
    }

    /// Service name this connection serves.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether the socket is still usable.
    pub fn is_alive(&self) -> bool {
        !self.closed.is_cancelled() && !self.writer.is_closed()
    }

    /// Pending entries of this connection.
    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    /// Register the envelope and send it.
    ///
    /// Nothing stays registered when this returns an error.
    pub async fn send(&self, envelope: &CommandEnvelope) -> Result<PendingHandle> {
        if !self.is_alive() {
            return Err(GatewayError::ServiceUnavailable(self.service.clone()));
        }

        let frame = self.codec.encode(envelope)?;
        let id = envelope.correlation_id;
        let handle = self.registry.register(id, self.codec.mode())?;

        if let Err(e) = self.writer.send(frame).await {
            self.registry.remove(id);
            return Err(e);
        }

        tracing::debug!(
            service = %self.service,
            command = %envelope.command,
            correlation_id = %id,
            "Envelope sent"
        );
        Ok(handle)
    }

    /// Cancel an in-flight request.
    ///
    /// The entry is terminated with [`GatewayError::ClientCancelled`] and a
    /// cancel frame is queued without blocking. A full writer queue defers
    /// the frame instead of dropping it.
    pub fn cancel(&self, id: CorrelationId) {
        if !self.registry.cancel(id) {
            return;
        }

        let header = Header::new(flags::CANCEL, id, 0, 0);
        if let Err(e) = self.writer.send_detached(OutboundFrame::empty(&header)) {
            tracing::debug!(service = %self.service, correlation_id = %id, error = %e, "Cancel frame not sent");
        }
    }

    /// Close the connection, failing everything in flight.
    pub fn close(&self) {
        self.closed.cancel();
        self.registry.drain(|| GatewayError::ConnectionClosed);
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Reads frames and routes them into the registry until the socket closes.
///
/// Errors returned here are connection-level; per-request decode failures
/// fail only their own correlation id.
async fn read_loop<R>(
    mut reader: R,
    codec: &dyn TransportCodec,
    registry: &CorrelationRegistry,
    max_payload_size: u32,
    closed: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = closed.cancelled() => return Ok(()),
            read = reader.read(&mut buf) => match read {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => return Err(GatewayError::Io(e)),
            },
        };

        for frame in frame_buffer.push(&buf[..n])? {
            let id = frame.correlation_id();
            match codec.decode(&frame) {
                Ok(Inbound::Reply(reply)) => {
                    registry.resolve(reply.correlation_id, reply.outcome);
                }
                Ok(Inbound::Stream(element)) => match element.item {
                    StreamItem::Chunk { sequence, chunk } => {
                        registry.push(element.correlation_id, sequence, chunk);
                    }
                    StreamItem::End { chunks } => {
                        registry.terminate(element.correlation_id, Termination::End { chunks });
                    }
                    StreamItem::Error(e) => {
                        registry.terminate(element.correlation_id, Termination::Error(e.into()));
                    }
                },
                Err(e @ GatewayError::Protocol(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(correlation_id = %id, error = %e, "Undecodable frame");
                    registry.terminate(id, Termination::Error(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_request_head, MsgPackCodec};
    use crate::envelope::{ChatPrompt, Command, ListNotes, AI_SERVICE, NOTE_SERVICE};
    use crate::error::WorkerError;
    use crate::protocol::{build_frame, Frame};
    use crate::registry::StreamEvent;
    use serde_json::json;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    struct FakeWorker {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        buffer: FrameBuffer,
    }

    impl FakeWorker {
        async fn next_request(&mut self) -> Frame {
            let mut buf = vec![0u8; 4096];
            loop {
                let n = self.reader.read(&mut buf).await.unwrap();
                assert!(n > 0, "gateway closed the connection");
                if let Some(frame) = self.buffer.push(&buf[..n]).unwrap().into_iter().next() {
                    return frame;
                }
            }
        }

        async fn reply<T: serde::Serialize>(&mut self, flags: u8, id: CorrelationId, sequence: u32, value: Option<&T>) {
            let payload = value.map(|v| MsgPackCodec::encode(v).unwrap()).unwrap_or_default();
            let header = Header::new(flags, id, sequence, payload.len() as u32);
            self.writer.write_all(&build_frame(&header, &payload)).await.unwrap();
        }
    }

    fn connect(kind: CodecKind, service: &str) -> (WorkerConnection, FakeWorker) {
        let (gateway_side, worker_side) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(gateway_side);
        let connection =
            WorkerConnection::from_io(service, kind, reader, writer, ConnectionSettings::default());
        let (worker_reader, worker_writer) = tokio::io::split(worker_side);
        (
            connection,
            FakeWorker {
                reader: worker_reader,
                writer: worker_writer,
                buffer: FrameBuffer::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_unary_round_trip() {
        let (connection, mut worker) = connect(CodecKind::Unary, NOTE_SERVICE);
        let envelope = CommandEnvelope::new(NOTE_SERVICE, Command::GetNotes(ListNotes::default()));

        let PendingHandle::Single(rx) = connection.send(&envelope).await.unwrap() else {
            panic!("expected single handle");
        };

        let request = worker.next_request().await;
        assert_eq!(request.correlation_id(), envelope.correlation_id);
        assert_eq!(decode_request_head(request.payload()).unwrap().command, "get_notes");

        worker
            .reply(flags::RESPONSE, envelope.correlation_id, 0, Some(&json!([])))
            .await;

        assert_eq!(rx.await.unwrap().unwrap(), json!([]));
        assert!(connection.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stream_round_trip_and_error() {
        let (connection, mut worker) = connect(CodecKind::Streaming, AI_SERVICE);
        let envelope = CommandEnvelope::new(
            AI_SERVICE,
            Command::StreamChat(ChatPrompt {
                prompt: "hi".to_string(),
            }),
        );

        let PendingHandle::Stream(mut rx) = connection.send(&envelope).await.unwrap() else {
            panic!("expected stream handle");
        };
        let id = worker.next_request().await.correlation_id();

        worker.reply(flags::STREAM_CHUNK, id, 0, Some(&json!({ "content": "He" }))).await;
        worker
            .reply(flags::STREAM_ERROR, id, 1, Some(&WorkerError::internal("model offline")))
            .await;

        assert!(matches!(rx.recv().await, Some(StreamEvent::Chunk { sequence: 0, .. })));
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Failed(GatewayError::Worker(_)))
        ));
        assert!(connection.registry().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_only_that_request() {
        let (connection, mut worker) = connect(CodecKind::Unary, NOTE_SERVICE);
        let first = CommandEnvelope::new(NOTE_SERVICE, Command::GetNotes(ListNotes::default()));
        let second = CommandEnvelope::new(NOTE_SERVICE, Command::GetNotes(ListNotes::default()));

        let PendingHandle::Single(rx1) = connection.send(&first).await.unwrap() else {
            panic!("expected single handle");
        };
        let PendingHandle::Single(rx2) = connection.send(&second).await.unwrap() else {
            panic!("expected single handle");
        };

        let header = Header::new(flags::RESPONSE, first.correlation_id, 0, 1);
        worker.writer.write_all(&build_frame(&header, &[0xc1])).await.unwrap();
        worker
            .reply(flags::RESPONSE, second.correlation_id, 0, Some(&json!("ok")))
            .await;

        assert!(matches!(rx1.await.unwrap(), Err(GatewayError::Decode(_))));
        assert_eq!(rx2.await.unwrap().unwrap(), json!("ok"));
        assert!(connection.is_alive());
    }

    #[tokio::test]
    async fn test_bad_header_closes_connection() {
        let (connection, mut worker) = connect(CodecKind::Unary, NOTE_SERVICE);
        let envelope = CommandEnvelope::new(NOTE_SERVICE, Command::GetNotes(ListNotes::default()));
        let PendingHandle::Single(rx) = connection.send(&envelope).await.unwrap() else {
            panic!("expected single handle");
        };

        let mut bad = Header::new(flags::RESPONSE, envelope.correlation_id, 0, 0).encode();
        bad[0] |= flags::RESERVED_MASK;
        worker.writer.write_all(&bad).await.unwrap();

        assert!(matches!(rx.await.unwrap(), Err(GatewayError::ConnectionClosed)));
        assert!(!connection.is_alive());
        assert!(matches!(
            connection.send(&envelope).await,
            Err(GatewayError::ServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_hangup_fails_pending() {
        let (connection, worker) = connect(CodecKind::Unary, NOTE_SERVICE);
        let envelope = CommandEnvelope::new(NOTE_SERVICE, Command::GetNotes(ListNotes::default()));
        let PendingHandle::Single(rx) = connection.send(&envelope).await.unwrap() else {
            panic!("expected single handle");
        };

        drop(worker);

        assert!(matches!(rx.await.unwrap(), Err(GatewayError::ConnectionClosed)));
        assert!(connection.registry().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_sends_cancel_frame() {
        let (connection, mut worker) = connect(CodecKind::Streaming, AI_SERVICE);
        let envelope = CommandEnvelope::new(
            AI_SERVICE,
            Command::StreamChat(ChatPrompt {
                prompt: "hi".to_string(),
            }),
        );
        let _handle = connection.send(&envelope).await.unwrap();
        worker.next_request().await;

        connection.cancel(envelope.correlation_id);
        assert!(connection.registry().is_empty());

        let cancel = worker.next_request().await;
        assert!(cancel.is_cancel());
        assert_eq!(cancel.correlation_id(), envelope.correlation_id);
    }

    #[tokio::test]
    async fn test_cancel_survives_full_writer_queue() {
        // A tiny pipe the worker does not read yet stalls the writer task.
        let (gateway_side, worker_side) = duplex(64);
        let (reader, writer) = tokio::io::split(gateway_side);
        let settings = ConnectionSettings {
            writer: WriterConfig { channel_capacity: 1 },
            ..ConnectionSettings::default()
        };
        let connection = WorkerConnection::from_io(AI_SERVICE, CodecKind::Streaming, reader, writer, settings);

        let envelopes: Vec<CommandEnvelope> = (0..2)
            .map(|_| {
                CommandEnvelope::new(
                    AI_SERVICE,
                    Command::StreamChat(ChatPrompt {
                        prompt: "x".repeat(256),
                    }),
                )
            })
            .collect();
        let mut handles = Vec::new();
        for envelope in &envelopes {
            handles.push(connection.send(envelope).await.unwrap());
        }

        let cancelled = envelopes[1].correlation_id;
        connection.cancel(cancelled);
        assert!(!connection.registry().contains(cancelled));

        let (mut worker_reader, _worker_writer) = tokio::io::split(worker_side);
        let mut frame_buffer = FrameBuffer::new();
        let mut buf = vec![0u8; 4096];
        let cancel = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let n = worker_reader.read(&mut buf).await.unwrap();
                assert!(n > 0, "gateway closed the connection");
                let frames = frame_buffer.push(&buf[..n]).unwrap();
                if let Some(frame) = frames.into_iter().find(|f| f.is_cancel()) {
                    return frame;
                }
            }
        })
        .await
        .expect("cancel frame never arrived");

        assert_eq!(cancel.correlation_id(), cancelled);
    }
}
