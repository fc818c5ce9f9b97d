//! Dedicated writer task for frame sending.
//!
//! Every connection (gateway side and worker side) owns exactly one writer
//! task. Callers never touch the socket; they push frames into an mpsc queue
//! and the task batches whatever is ready into vectored writes.
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! Caller N ─┘
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{GatewayError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for STREAM_END, CANCEL, etc.).
    pub payload: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    #[inline]
    pub fn empty(header: &Header) -> Self {
        Self {
            header: header.encode(),
            payload: Bytes::new(),
        }
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; every clone feeds the same socket.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame, waiting for queue space if needed.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| GatewayError::ConnectionClosed)
    }

    /// Queue a frame without blocking the caller.
    ///
    /// When the queue is full the frame is handed to a spawned task that
    /// waits for space, so it still reaches the socket behind everything
    /// already queued. Fails only when the writer task has stopped.
    pub fn send_detached(&self, frame: OutboundFrame) -> Result<()> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GatewayError::ConnectionClosed),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::debug!("Writer queue full, deferring frame");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(frame).await.is_err() {
                        tracing::debug!("Writer stopped before deferred frame was queued");
                    }
                });
                Ok(())
            }
        }
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly when every handle is dropped, or with an error
/// when the socket fails.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

/// Receives frames and writes them to the socket in batches.
async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::warn!(frames = batch.len(), error = %e, "Writer failed, closing connection");
            return Err(e);
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(GatewayError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after the first `skip_bytes` bytes.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.header[start..]));
        }
        offset = header_end;

        if !frame.payload.is_empty() {
            let payload_end = offset + frame.payload.len();
            if skip_bytes < payload_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&frame.payload[start..]));
            }
            offset = payload_end;
        }
    }

    slices
}
