//! Stream bridge: worker stream in, client events out.
//!
//! A [`StreamHandle`] is the live result of a stream dispatch. It yields
//! chunk values in sequence order and ends after the terminal marker. If it
//! is dropped before that, the pending entry is terminated with
//! `ClientCancelled` and a cancel frame goes to the worker.
//!
//! [`bridge`] turns a handle into the client-facing [`BridgeEvent`]
//! sequence.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{Stream, StreamExt};
use serde_json::Value;

use crate::connection::WorkerConnection;
use crate::envelope::CorrelationId;
use crate::error::{GatewayError, Result};
use crate::registry::{StreamEvent, StreamReceiver};

/// Client-visible event of a bridged stream.
#[derive(Debug)]
pub enum BridgeEvent {
    /// One chunk, in order.
    Data(Value),
    /// The stream failed; always the last event.
    Error(GatewayError),
}

/// Cancels the upstream request unless disarmed.
struct CancelGuard {
    connection: Arc<WorkerConnection>,
    id: CorrelationId,
    armed: bool,
}

impl CancelGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(
                service = %self.connection.service(),
                correlation_id = %self.id,
                "Stream dropped before completion, cancelling"
            );
            self.connection.cancel(self.id);
        }
    }
}

/// Live result of a stream dispatch.
///
/// Not restartable: once it has ended (or been dropped) a new dispatch is
/// needed to request the stream again.
pub struct StreamHandle {
    id: CorrelationId,
    rx: StreamReceiver,
    guard: CancelGuard,
    finished: bool,
}

impl StreamHandle {
    pub(crate) fn new(id: CorrelationId, rx: StreamReceiver, connection: Arc<WorkerConnection>) -> Self {
        Self {
            id,
            rx,
            guard: CancelGuard {
                connection,
                id,
                armed: true,
            },
            finished: false,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }

    /// Whether the terminal marker has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stop the stream now; same as dropping the handle.
    pub fn cancel(self) {
        drop(self);
    }

    fn finish(&mut self) {
        self.finished = true;
        self.guard.disarm();
        self.rx.close();
    }
}

impl Stream for StreamHandle {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamEvent::Chunk { data, .. })) => Poll::Ready(Some(Ok(data))),
            Poll::Ready(Some(StreamEvent::End)) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamEvent::Failed(e))) => {
                self.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                // Entry removed without a terminal marker.
                self.finish();
                Poll::Ready(Some(Err(GatewayError::ConnectionClosed)))
            }
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("correlation_id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Adapt a stream handle into client events.
///
/// One `Data` per chunk; the sequence closes after `end`, or after a single
/// `Error` event. Dropping the returned stream cancels upstream.
pub fn bridge(handle: StreamHandle) -> impl Stream<Item = BridgeEvent> + Send + Unpin {
    handle.map(|item| match item {
        Ok(chunk) => BridgeEvent::Data(chunk),
        Err(e) => BridgeEvent::Error(e),
    })
}
