//! Command router.
//!
//! Resolves a service name to its live [`WorkerConnection`], builds the
//! [`CommandEnvelope`] and drives it through the connection's registry.
//!
//! # Example
//!
//! ```ignore
//! use gatewire::codec::CodecKind;
//! use gatewire::envelope::{Command, ListNotes};
//! use gatewire::router::Router;
//! use gatewire::transport::Endpoint;
//!
//! let router = Router::builder()
//!     .service("note", CodecKind::Unary, Endpoint::tcp("127.0.0.1:3001"))
//!     .request_timeout(std::time::Duration::from_secs(30))
//!     .start()
//!     .await?;
//!
//! let notes = router.call("note", Command::GetNotes(ListNotes::default())).await?;
//! router.shutdown();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bridge::StreamHandle;
use crate::codec::CodecKind;
use crate::connection::{ConnectionSettings, WorkerConnection};
use crate::envelope::{Command, CommandEnvelope, CorrelationId, DispatchMode};
use crate::error::{GatewayError, Result};
use crate::registry::{CorrelationRegistry, PendingHandle};
use crate::transport::ConnectionFactory;

/// Default time a request may wait for its reply (or a stream stay idle).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default period of the timeout sweeper.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Result of [`Router::dispatch`].
pub enum Dispatched {
    Reply(Value),
    Stream(StreamHandle),
}

struct ServiceSpec {
    name: String,
    kind: CodecKind,
    factory: Arc<dyn ConnectionFactory>,
}

/// Builder for a [`Router`].
pub struct RouterBuilder {
    services: Vec<ServiceSpec>,
    settings: ConnectionSettings,
    request_timeout: Duration,
    sweep_interval: Duration,
    reconnect_delay: Duration,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            settings: ConnectionSettings::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Register a service reachable through `factory`.
    ///
    /// Registering the same name twice keeps the last registration.
    pub fn service<F>(mut self, name: &str, kind: CodecKind, factory: F) -> Self
    where
        F: ConnectionFactory,
    {
        self.services.retain(|s| s.name != name);
        self.services.push(ServiceSpec {
            name: name.to_string(),
            kind,
            factory: Arc::new(factory),
        });
        self
    }

    /// Age after which a pending request fails with `Timeout`.
    ///
    /// For streams this is an idle timeout: it counts from the last chunk
    /// delivered in order, so a long stream lives as long as chunks keep
    /// flowing. Chunks held back behind a missing sequence do not reset it.
    ///
    /// Default: 30 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// How often the sweeper runs.
    ///
    /// Default: 1 second
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Delay between reconnect attempts for a down service.
    ///
    /// Default: 2 seconds
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Writer queue capacity of each connection.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.settings.writer.channel_capacity = capacity;
        self
    }

    /// Largest payload accepted from a worker.
    ///
    /// Default: 64 MB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.settings.max_payload_size = size;
        self
    }

    /// Connect every service and start the sweeper.
    ///
    /// A service that cannot be reached stays registered but down; dispatches
    /// to it fail with `ServiceUnavailable` until a reconnect succeeds.
    pub async fn start(self) -> Result<Router> {
        let mut services = HashMap::with_capacity(self.services.len());

        for spec in self.services {
            let slot = ServiceSlot {
                kind: spec.kind,
                factory: spec.factory,
                connection: RwLock::new(None),
                reconnecting: AtomicBool::new(false),
            };
            match slot.connect(&spec.name, &self.settings).await {
                Ok(connection) => {
                    tracing::info!(service = %spec.name, target = %slot.factory.describe(), "Service connected");
                    *slot.connection.write() = Some(Arc::new(connection));
                }
                Err(e) => {
                    tracing::warn!(
                        service = %spec.name,
                        target = %slot.factory.describe(),
                        error = %e,
                        "Service unreachable at startup"
                    );
                }
            }
            services.insert(spec.name, slot);
        }

        let inner = Arc::new(RouterInner {
            services,
            settings: self.settings,
            request_timeout: self.request_timeout,
            reconnect_delay: self.reconnect_delay,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(sweeper(inner.clone(), self.sweep_interval));

        Ok(Router { inner })
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ServiceSlot {
    kind: CodecKind,
    factory: Arc<dyn ConnectionFactory>,
    connection: RwLock<Option<Arc<WorkerConnection>>>,
    reconnecting: AtomicBool,
}

impl ServiceSlot {
    async fn connect(&self, name: &str, settings: &ConnectionSettings) -> Result<WorkerConnection> {
        let (reader, writer) = self.factory.connect().await?;
        Ok(WorkerConnection::from_io(
            name,
            self.kind,
            reader,
            writer,
            settings.clone(),
        ))
    }

    fn live_connection(&self) -> Option<Arc<WorkerConnection>> {
        self.connection
            .read()
            .as_ref()
            .filter(|c| c.is_alive())
            .cloned()
    }
}

struct RouterInner {
    services: HashMap<String, ServiceSlot>,
    settings: ConnectionSettings,
    request_timeout: Duration,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
}

/// Routes commands to worker connections.
///
/// Cheap to clone; all clones share the same connections.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Dispatch a command to `service`.
    ///
    /// `Single` waits for the reply; `Stream` returns a live handle at once.
    pub async fn dispatch(
        &self,
        service: &str,
        command: Command,
        mode: DispatchMode,
    ) -> Result<Dispatched> {
        let slot = self
            .inner
            .services
            .get(service)
            .ok_or_else(|| GatewayError::UnknownService(service.to_string()))?;

        let Some(connection) = slot.live_connection() else {
            self.schedule_reconnect(service);
            return Err(GatewayError::ServiceUnavailable(service.to_string()));
        };

        if command.mode() != mode {
            return Err(GatewayError::InvalidRequest(format!(
                "command {} does not support {:?} dispatch",
                command.name(),
                mode
            )));
        }
        if slot.kind.mode() != mode {
            return Err(GatewayError::InvalidRequest(format!(
                "service {service} does not support {mode:?} dispatch"
            )));
        }
        command.validate()?;

        let envelope = CommandEnvelope::new(service, command);
        let id = envelope.correlation_id;
        let guard = PendingGuard::new(connection.registry().clone(), id);

        match connection.send(&envelope).await? {
            PendingHandle::Single(rx) => {
                let outcome = rx.await.map_err(|_| GatewayError::ConnectionClosed)?;
                guard.disarm();
                outcome.map(Dispatched::Reply)
            }
            PendingHandle::Stream(rx) => {
                guard.disarm();
                Ok(Dispatched::Stream(StreamHandle::new(id, rx, connection)))
            }
        }
    }

    /// Dispatch a single-reply command and wait for the value.
    pub async fn call(&self, service: &str, command: Command) -> Result<Value> {
        match self.dispatch(service, command, DispatchMode::Single).await? {
            Dispatched::Reply(value) => Ok(value),
            Dispatched::Stream(_) => Err(GatewayError::InvalidRequest(
                "single dispatch produced a stream".to_string(),
            )),
        }
    }

    /// Dispatch a streaming command.
    pub async fn open_stream(&self, service: &str, command: Command) -> Result<StreamHandle> {
        match self.dispatch(service, command, DispatchMode::Stream).await? {
            Dispatched::Stream(handle) => Ok(handle),
            Dispatched::Reply(_) => Err(GatewayError::InvalidRequest(
                "stream dispatch produced a single reply".to_string(),
            )),
        }
    }

    /// Whether `service` is registered.
    pub fn has_service(&self, service: &str) -> bool {
        self.inner.services.contains_key(service)
    }

    /// Whether `service` currently has a live connection.
    pub fn is_up(&self, service: &str) -> bool {
        self.inner
            .services
            .get(service)
            .and_then(ServiceSlot::live_connection)
            .is_some()
    }

    /// Pending entries for `service`, or across all services.
    pub fn in_flight(&self, service: Option<&str>) -> usize {
        self.inner
            .services
            .iter()
            .filter(|(name, _)| service.map_or(true, |s| s == name.as_str()))
            .filter_map(|(_, slot)| slot.connection.read().clone())
            .map(|connection| connection.registry().len())
            .sum()
    }

    /// Run one sweep over every connection now.
    pub fn sweep(&self) -> usize {
        sweep_all(&self.inner)
    }

    /// Stop the sweeper and reconnects, and close every connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for (name, slot) in &self.inner.services {
            if let Some(connection) = slot.connection.write().take() {
                connection.close();
                tracing::info!(service = %name, "Service connection closed");
            }
        }
    }

    /// Reconnect a down service in the background, once at a time.
    fn schedule_reconnect(&self, service: &str) {
        let Some(slot) = self.inner.services.get(service) else {
            return;
        };
        if self.inner.shutdown.is_cancelled() || slot.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = self.inner.clone();
        let service = service.to_string();
        tokio::spawn(async move {
            reconnect(&inner, &service).await;
            if let Some(slot) = inner.services.get(&service) {
                slot.reconnecting.store(false, Ordering::Release);
            }
        });
    }
}

async fn reconnect(inner: &RouterInner, service: &str) {
    let Some(slot) = inner.services.get(service) else {
        return;
    };

    let mut attempt = 0u32;
    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }
        attempt += 1;

        match slot.connect(service, &inner.settings).await {
            Ok(connection) => {
                if inner.shutdown.is_cancelled() {
                    connection.close();
                    return;
                }
                *slot.connection.write() = Some(Arc::new(connection));
                tracing::info!(%service, attempt, "Service reconnected");
                return;
            }
            Err(e) => {
                tracing::warn!(%service, attempt, error = %e, "Reconnect failed");
            }
        }

        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(inner.reconnect_delay) => {}
        }
    }
}

async fn sweeper(inner: Arc<RouterInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => {
                sweep_all(&inner);
            }
        }
    }
}

fn sweep_all(inner: &RouterInner) -> usize {
    let connections: Vec<Arc<WorkerConnection>> = inner
        .services
        .values()
        .filter_map(|slot| slot.connection.read().clone())
        .collect();

    connections
        .iter()
        .map(|connection| connection.registry().sweep(inner.request_timeout))
        .sum()
}

/// Removes a pending entry if the dispatching future is dropped before its
/// outcome is in.
struct PendingGuard {
    registry: Arc<CorrelationRegistry>,
    id: CorrelationId,
    armed: bool,
}

impl PendingGuard {
    fn new(registry: Arc<CorrelationRegistry>, id: CorrelationId) -> Self {
        Self {
            registry,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.registry.remove(self.id);
        }
    }
}
