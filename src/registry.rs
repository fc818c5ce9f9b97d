//! Correlation registry - in-flight requests of one worker connection.
//!
//! Every envelope sent to a worker leaves a pending entry here until its
//! reply (single) or terminal marker (stream) comes back, the entry times
//! out, the client cancels, or the connection drops.
//!
//! The map sits behind a short synchronous lock. Nothing awaits while the
//! lock is held: single entries complete through a oneshot, stream entries
//! feed an unbounded channel.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::envelope::{CorrelationId, DispatchMode, Outcome};
use crate::error::{GatewayError, Result};

/// Receiving side of a single-reply entry.
pub type ReplyReceiver = oneshot::Receiver<Result<Value>>;

/// Receiving side of a stream entry.
pub type StreamReceiver = mpsc::UnboundedReceiver<StreamEvent>;

/// Event delivered to the consumer of a stream entry.
#[derive(Debug)]
pub enum StreamEvent {
    /// Next chunk, in sequence order.
    Chunk { sequence: u32, data: Value },
    /// The worker completed the stream.
    End,
    /// The stream failed; nothing follows.
    Failed(GatewayError),
}

/// How a stream entry ends.
#[derive(Debug)]
pub enum Termination {
    /// Completed after `chunks` chunks.
    End { chunks: u32 },
    /// Aborted; also fails single entries.
    Error(GatewayError),
}

/// Handle returned by [`CorrelationRegistry::register`].
#[derive(Debug)]
pub enum PendingHandle {
    Single(ReplyReceiver),
    Stream(StreamReceiver),
}

/// What happened to an inbound reply or element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the waiting consumer.
    Delivered,
    /// Held back until earlier chunks or the stream end arrive.
    Buffered,
    /// Sequence already delivered; dropped.
    Duplicate,
    /// No matching entry; dropped.
    Stale,
}

struct StreamSlot {
    tx: mpsc::UnboundedSender<StreamEvent>,
    next_sequence: u32,
    out_of_order: BTreeMap<u32, Value>,
    /// Chunk count of an `end` that arrived before all its chunks.
    pending_end: Option<u32>,
}

impl StreamSlot {
    fn new(tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self {
            tx,
            next_sequence: 0,
            out_of_order: BTreeMap::new(),
            pending_end: None,
        }
    }

    /// Deliver every chunk that is next in line. Returns false when the
    /// consumer is gone.
    fn flush(&mut self) -> bool {
        while let Some(data) = self.out_of_order.remove(&self.next_sequence) {
            let sequence = self.next_sequence;
            if self.tx.send(StreamEvent::Chunk { sequence, data }).is_err() {
                return false;
            }
            self.next_sequence += 1;
        }
        true
    }

    fn is_complete(&self) -> bool {
        matches!(self.pending_end, Some(chunks) if self.next_sequence >= chunks)
    }
}

enum Slot {
    Single(oneshot::Sender<Result<Value>>),
    Stream(StreamSlot),
}

struct PendingEntry {
    created_at: Instant,
    last_activity: Instant,
    slot: Slot,
}

impl PendingEntry {
    fn new(slot: Slot) -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_activity: now,
            slot,
        }
    }

    /// Single entries age from creation, streams from their last delivered
    /// chunk. Buffered chunks stuck behind a gap do not count.
    fn age(&self, now: Instant) -> Duration {
        let since = match self.slot {
            Slot::Single(_) => self.created_at,
            Slot::Stream(_) => self.last_activity,
        };
        now.saturating_duration_since(since)
    }

    fn fail(self, error: GatewayError) {
        match self.slot {
            Slot::Single(tx) => {
                let _ = tx.send(Err(error));
            }
            Slot::Stream(slot) => {
                let _ = slot.tx.send(StreamEvent::Failed(error));
            }
        }
    }
}

/// Pending entries keyed by correlation id.
#[derive(Default)]
pub struct CorrelationRegistry {
    entries: Mutex<HashMap<CorrelationId, PendingEntry>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending entry of the given kind.
    pub fn register(&self, id: CorrelationId, kind: DispatchMode) -> Result<PendingHandle> {
        match kind {
            DispatchMode::Single => self.register_single(id).map(PendingHandle::Single),
            DispatchMode::Stream => self.register_stream(id).map(PendingHandle::Stream),
        }
    }

    /// Register an entry completed by exactly one reply.
    pub fn register_single(&self, id: CorrelationId) -> Result<ReplyReceiver> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, Slot::Single(tx))?;
        Ok(rx)
    }

    /// Register an entry fed by stream elements.
    pub fn register_stream(&self, id: CorrelationId) -> Result<StreamReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(id, Slot::Stream(StreamSlot::new(tx)))?;
        Ok(rx)
    }

    fn insert(&self, id: CorrelationId, slot: Slot) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            tracing::error!(correlation_id = %id, "Correlation id registered twice");
            return Err(GatewayError::DuplicateCorrelationId(id));
        }
        entries.insert(id, PendingEntry::new(slot));
        Ok(())
    }

    /// Complete a single entry with the worker's outcome.
    pub fn resolve(&self, id: CorrelationId, outcome: Outcome) -> Delivery {
        let tx = {
            let mut entries = self.entries.lock();
            let is_single = match entries.get(&id) {
                Some(entry) => matches!(entry.slot, Slot::Single(_)),
                None => {
                    log_stale(id);
                    return Delivery::Stale;
                }
            };
            if !is_single {
                tracing::warn!(correlation_id = %id, "Single reply for a stream entry, dropped");
                return Delivery::Stale;
            }
            let Some(PendingEntry {
                slot: Slot::Single(tx),
                ..
            }) = entries.remove(&id)
            else {
                return Delivery::Stale;
            };
            tx
        };

        // The caller may have given up already; that is not an error here.
        let _ = tx.send(outcome.map_err(GatewayError::from));
        Delivery::Delivered
    }

    /// Forward a chunk to a stream entry, restoring sequence order.
    pub fn push(&self, id: CorrelationId, sequence: u32, data: Value) -> Delivery {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&id) else {
            log_stale(id);
            return Delivery::Stale;
        };
        let Slot::Stream(slot) = &mut entry.slot else {
            tracing::warn!(correlation_id = %id, "Stream chunk for a single entry, dropped");
            return Delivery::Stale;
        };

        if sequence < slot.next_sequence || slot.out_of_order.contains_key(&sequence) {
            tracing::debug!(correlation_id = %id, sequence, "Duplicate stream chunk dropped");
            return Delivery::Duplicate;
        }

        slot.out_of_order.insert(sequence, data);
        let before = slot.next_sequence;

        if !slot.flush() {
            tracing::debug!(correlation_id = %id, "Stream consumer gone, releasing entry");
            entries.remove(&id);
            return Delivery::Delivered;
        }

        let delivered = slot.next_sequence > before;
        if delivered {
            entry.last_activity = Instant::now();
        }
        if slot.is_complete() {
            let _ = slot.tx.send(StreamEvent::End);
            entries.remove(&id);
        }

        if delivered {
            Delivery::Delivered
        } else {
            Delivery::Buffered
        }
    }

    /// Apply a terminal marker.
    ///
    /// An `end` that is ahead of the delivered chunks is held until the
    /// missing chunks arrive.
    pub fn terminate(&self, id: CorrelationId, termination: Termination) -> Delivery {
        let mut entries = self.entries.lock();
        match termination {
            Termination::Error(error) => {
                let Some(entry) = entries.remove(&id) else {
                    log_stale(id);
                    return Delivery::Stale;
                };
                drop(entries);
                if let Slot::Stream(slot) = &entry.slot {
                    if !slot.out_of_order.is_empty() {
                        tracing::debug!(
                            correlation_id = %id,
                            delivered = slot.next_sequence,
                            discarded = slot.out_of_order.len(),
                            "Dropping buffered chunks on stream error"
                        );
                    }
                }
                entry.fail(error);
                Delivery::Delivered
            }
            Termination::End { chunks } => {
                let Some(entry) = entries.get_mut(&id) else {
                    log_stale(id);
                    return Delivery::Stale;
                };
                let Slot::Stream(slot) = &mut entry.slot else {
                    tracing::warn!(correlation_id = %id, "Stream end for a single entry, dropped");
                    return Delivery::Stale;
                };

                slot.pending_end = Some(chunks);
                if slot.is_complete() {
                    let _ = slot.tx.send(StreamEvent::End);
                    entries.remove(&id);
                    Delivery::Delivered
                } else {
                    tracing::debug!(
                        correlation_id = %id,
                        delivered = slot.next_sequence,
                        chunks,
                        "Stream end waiting for outstanding chunks"
                    );
                    Delivery::Buffered
                }
            }
        }
    }

    /// Terminate an entry on behalf of a client that went away.
    ///
    /// Returns false if the entry was already gone.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        let entry = self.entries.lock().remove(&id);
        match entry {
            Some(entry) => {
                entry.fail(GatewayError::ClientCancelled);
                true
            }
            None => false,
        }
    }

    /// Remove an entry without notifying its consumer.
    pub fn remove(&self, id: CorrelationId) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Fail every entry older than `max_age` with [`GatewayError::Timeout`].
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<(CorrelationId, PendingEntry)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<CorrelationId> = entries
                .iter()
                .filter(|(_, entry)| entry.age(now) > max_age)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            tracing::warn!(correlation_id = %id, "Request timed out");
            entry.fail(GatewayError::Timeout);
        }
        count
    }

    /// Fail every entry with the error produced by `make_error`.
    ///
    /// Returns the number of entries failed.
    pub fn drain<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> GatewayError,
    {
        let drained: Vec<PendingEntry> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            entry.fail(make_error());
        }
        count
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn log_stale(id: CorrelationId) {
    tracing::warn!(correlation_id = %id, "{}", GatewayError::StaleReply(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use serde_json::json;

    fn chunk(event: StreamEvent) -> Value {
        match event {
            StreamEvent::Chunk { data, .. } => data,
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_completes_once() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let rx = registry.register_single(id).unwrap();

        assert_eq!(registry.resolve(id, Ok(json!({ "ok": 1 }))), Delivery::Delivered);
        assert_eq!(registry.resolve(id, Ok(json!(2))), Delivery::Stale);

        assert_eq!(rx.await.unwrap().unwrap(), json!({ "ok": 1 }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_passes_worker_error_through() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let rx = registry.register_single(id).unwrap();

        registry.resolve(id, Err(WorkerError::internal("disk full")));

        match rx.await.unwrap() {
            Err(GatewayError::Worker(e)) => assert_eq!(e.message, "disk full"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let _rx = registry.register_single(id).unwrap();

        assert!(matches!(
            registry.register(id, DispatchMode::Stream),
            Err(GatewayError::DuplicateCorrelationId(dup)) if dup == id
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_id_is_stale() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();

        assert_eq!(registry.resolve(id, Ok(Value::Null)), Delivery::Stale);
        assert_eq!(registry.push(id, 0, Value::Null), Delivery::Stale);
        assert_eq!(
            registry.terminate(id, Termination::End { chunks: 0 }),
            Delivery::Stale
        );
    }

    #[tokio::test]
    async fn test_stream_in_order() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let mut rx = registry.register_stream(id).unwrap();

        registry.push(id, 0, json!("He"));
        registry.push(id, 1, json!("llo"));
        registry.terminate(id, Termination::End { chunks: 2 });

        assert_eq!(chunk(rx.recv().await.unwrap()), json!("He"));
        assert_eq!(chunk(rx.recv().await.unwrap()), json!("llo"));
        assert!(matches!(rx.recv().await, Some(StreamEvent::End)));
        assert!(rx.recv().await.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stream_reorders_and_drops_duplicates() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let mut rx = registry.register_stream(id).unwrap();

        assert_eq!(registry.push(id, 2, json!("c")), Delivery::Buffered);
        assert_eq!(registry.push(id, 1, json!("b")), Delivery::Buffered);
        assert_eq!(registry.push(id, 1, json!("b")), Delivery::Duplicate);
        assert_eq!(registry.push(id, 0, json!("a")), Delivery::Delivered);
        assert_eq!(registry.push(id, 0, json!("a")), Delivery::Duplicate);

        let mut seen = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                StreamEvent::Chunk { sequence, data } => seen.push((sequence, data)),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(
            seen,
            vec![(0, json!("a")), (1, json!("b")), (2, json!("c"))]
        );
    }

    #[tokio::test]
    async fn test_end_waits_for_outstanding_chunks() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let mut rx = registry.register_stream(id).unwrap();

        registry.push(id, 0, json!("a"));
        assert_eq!(
            registry.terminate(id, Termination::End { chunks: 2 }),
            Delivery::Buffered
        );
        assert!(registry.contains(id));

        registry.push(id, 1, json!("b"));
        assert!(!registry.contains(id));

        assert_eq!(chunk(rx.recv().await.unwrap()), json!("a"));
        assert_eq!(chunk(rx.recv().await.unwrap()), json!("b"));
        assert!(matches!(rx.recv().await, Some(StreamEvent::End)));
    }

    #[tokio::test]
    async fn test_terminate_error_closes_stream() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let mut rx = registry.register_stream(id).unwrap();

        registry.push(id, 0, json!("a"));
        registry.terminate(
            id,
            Termination::Error(WorkerError::internal("model offline").into()),
        );
        assert_eq!(registry.push(id, 1, json!("b")), Delivery::Stale);

        assert_eq!(chunk(rx.recv().await.unwrap()), json!("a"));
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Failed(GatewayError::Worker(_)))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_marks_client_cancelled() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let mut rx = registry.register_stream(id).unwrap();

        assert!(registry.cancel(id));
        assert!(!registry.cancel(id));
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Failed(GatewayError::ClientCancelled))
        ));
    }

    #[tokio::test]
    async fn test_dropped_consumer_releases_entry_on_push() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let rx = registry.register_stream(id).unwrap();
        drop(rx);

        registry.push(id, 0, json!("a"));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_old_entries() {
        let registry = CorrelationRegistry::new();
        let old = CorrelationId::generate();
        let rx_old = registry.register_single(old).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;

        let fresh = CorrelationId::generate();
        let _rx_fresh = registry.register_single(fresh).unwrap();

        assert_eq!(registry.sweep(Duration::from_secs(5)), 1);
        assert!(registry.contains(fresh));
        assert!(matches!(rx_old.await.unwrap(), Err(GatewayError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_uses_idle_time_for_streams() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let mut rx = registry.register_stream(id).unwrap();

        for sequence in 0..4 {
            tokio::time::advance(Duration::from_secs(3)).await;
            registry.push(id, sequence, json!(sequence));
            assert_eq!(registry.sweep(Duration::from_secs(5)), 0);
        }

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(registry.sweep(Duration::from_secs(5)), 1);

        for _ in 0..4 {
            chunk(rx.recv().await.unwrap());
        }
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Failed(GatewayError::Timeout))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_stream_stuck_behind_gap() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let mut rx = registry.register_stream(id).unwrap();

        // Sequence 0 never arrives; later chunks only fill the buffer.
        let mut swept = 0;
        for sequence in 1..=10 {
            tokio::time::advance(Duration::from_secs(3)).await;
            assert_eq!(registry.push(id, sequence, json!(sequence)), Delivery::Buffered);
            swept += registry.sweep(Duration::from_secs(5));
            if swept > 0 {
                break;
            }
        }

        assert_eq!(swept, 1);
        assert!(!registry.contains(id));
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Failed(GatewayError::Timeout))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_end_does_not_refresh_idle_time() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let mut rx = registry.register_stream(id).unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            registry.terminate(id, Termination::End { chunks: 1 }),
            Delivery::Buffered
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(registry.sweep(Duration::from_secs(5)), 1);
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Failed(GatewayError::Timeout))
        ));
    }

    #[tokio::test]
    async fn test_error_discards_buffered_chunks() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        let mut rx = registry.register_stream(id).unwrap();

        assert_eq!(registry.push(id, 1, json!("late")), Delivery::Buffered);
        assert_eq!(registry.push(id, 2, json!("later")), Delivery::Buffered);
        assert_eq!(
            registry.terminate(id, Termination::Error(WorkerError::internal("boom").into())),
            Delivery::Delivered
        );

        assert!(registry.is_empty());
        match rx.recv().await {
            Some(StreamEvent::Failed(GatewayError::Worker(e))) => assert_eq!(e.message, "boom"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drain_fails_everything() {
        let registry = CorrelationRegistry::new();
        let single = registry.register_single(CorrelationId::generate()).unwrap();
        let mut stream = registry.register_stream(CorrelationId::generate()).unwrap();

        assert_eq!(registry.drain(|| GatewayError::ConnectionClosed), 2);
        assert!(registry.is_empty());

        assert!(matches!(
            single.await.unwrap(),
            Err(GatewayError::ConnectionClosed)
        ));
        assert!(matches!(
            stream.recv().await,
            Some(StreamEvent::Failed(GatewayError::ConnectionClosed))
        ));
    }
}
