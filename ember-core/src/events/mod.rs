//! Registry of live event-stream clients.
//!
//! The transport (SSE, WebSocket, anything push-capable) stays behind the
//! [`EventSink`] trait; this module only tracks which clients exist, closes
//! their streams when they are removed, and keeps idle-but-connected
//! clients alive by extending their store entry at each expiry evaluation.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{
    ExpiryCallback, ExpiryDecision, TimedStore, create_managed_store, now_ms,
};

const DEFAULT_CLIENT_TTL: Duration = Duration::from_secs(60);
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// A push-capable handle to one connected client.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Pushes an event (with optional event name) to the client.
    async fn emit(&self, event: Option<&str>, data: &str)
    -> anyhow::Result<()>;

    /// Sends a transport-level keepalive.
    async fn keepalive(&self) -> anyhow::Result<()>;

    /// Closes the underlying stream. Must tolerate being called twice.
    async fn close(&self) -> anyhow::Result<()>;

    /// Whether the transport still considers the client connected.
    fn is_connected(&self) -> bool;
}

/// A registered client: its id plus the shared sink.
///
/// Equality is sink identity, not content, so
/// [`TimedStore::delete_all_values`] removes exactly the entries pointing at
/// the same underlying stream.
#[derive(Clone)]
pub struct ClientHandle {
    id: Arc<str>,
    sink: Arc<dyn EventSink>,
}

impl ClientHandle {
    fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            id: Uuid::now_v7().to_string().into(),
            sink,
        }
    }

    /// The registry key for this client.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The underlying sink.
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.sink, &other.sink)
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("connected", &self.sink.is_connected())
            .finish()
    }
}

/// Tuning for [`ClientRegistry`].
#[derive(Debug, Clone, Copy)]
pub struct ClientRegistryConfig {
    /// How long a client entry lives between expiry evaluations. A client
    /// that is still connected at evaluation time gets another full TTL.
    pub client_ttl: Duration,
}

impl Default for ClientRegistryConfig {
    fn default() -> Self {
        Self {
            client_ttl: DEFAULT_CLIENT_TTL,
        }
    }
}

/// Live-event clients keyed by client id.
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    store: TimedStore<ClientHandle>,
    config: ClientRegistryConfig,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(ClientRegistryConfig::default())
    }
}

impl ClientRegistry {
    /// Creates a registry whose store takes part in coordinated shutdown.
    pub fn new(config: ClientRegistryConfig) -> Self {
        Self {
            store: create_managed_store(),
            config,
        }
    }

    /// Creates a registry on a caller-owned store. The caller is then
    /// responsible for closing that store at teardown.
    pub fn with_store(
        store: TimedStore<ClientHandle>,
        config: ClientRegistryConfig,
    ) -> Self {
        Self { store, config }
    }

    /// Registers a connected sink and returns its handle.
    ///
    /// The entry's expiry callback closes the stream on forced removal and
    /// on natural expiry of a disconnected client; a client that is still
    /// connected when its deadline passes is extended by another TTL.
    pub async fn register(&self, sink: Arc<dyn EventSink>) -> ClientHandle {
        let handle = ClientHandle::new(sink);
        let ttl_ms = self.config.client_ttl.as_millis() as i64;

        let callback: ExpiryCallback = {
            let handle = handle.clone();
            Arc::new(move |force_delete| {
                let handle = handle.clone();
                Box::pin(async move {
                    if !force_delete && handle.sink.is_connected() {
                        return Ok(ExpiryDecision::ExtendTo(now_ms() + ttl_ms));
                    }
                    handle.sink.close().await?;
                    debug!(id = handle.id(), "event client closed");
                    Ok(ExpiryDecision::Delete)
                })
            })
        };

        self.store
            .set_with_callback(
                handle.id().to_string(),
                handle.clone(),
                now_ms() + ttl_ms,
                callback,
            )
            .await;
        debug!(id = handle.id(), "event client registered");
        handle
    }

    /// Looks up a client by id.
    pub async fn get(&self, id: &str) -> Option<ClientHandle> {
        self.store.get(id).await
    }

    /// Removes a client, closing its stream. Returns whether it existed.
    pub async fn unregister(&self, id: &str) -> bool {
        self.store.delete(id).await
    }

    /// Removes every registration pointing at the same sink as `handle`.
    pub async fn disconnect(&self, handle: &ClientHandle) -> usize {
        self.store.delete_all_values(handle).await
    }

    /// Point-in-time snapshot of registered client ids, taken without the
    /// store lock.
    pub fn client_ids(&self) -> Vec<String> {
        self.store.keys()
    }

    /// Pushes one event to one client. `false` when the client is unknown.
    pub async fn emit_to(
        &self,
        id: &str,
        event: Option<&str>,
        data: &str,
    ) -> anyhow::Result<bool> {
        let Some(client) = self.store.get(id).await else {
            return Ok(false);
        };
        client.sink.emit(event, data).await?;
        Ok(true)
    }

    /// Pushes one event to every known client. Per-client failures are
    /// logged and skipped. Returns the number of successful deliveries.
    pub async fn broadcast(&self, event: Option<&str>, data: &str) -> usize {
        let mut delivered = 0;
        for id in self.client_ids() {
            let Some(client) = self.store.get(&id).await else {
                continue;
            };
            match client.sink.emit(event, data).await {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(id, %error, "event delivery failed");
                }
            }
        }
        delivered
    }
}

/// Handle to a running keepalive task.
///
/// Dropping the handle also stops the task, without waiting for an
/// in-flight sweep; use [`stop`](KeepaliveHandle::stop) to wait.
#[derive(Debug)]
pub struct KeepaliveHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl KeepaliveHandle {
    /// Stops the task and waits for an in-flight sweep to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Spawns a task that pings every registered client each `interval`.
///
/// The sweep iterates a lock-free key snapshot, so clients added or removed
/// mid-sweep may be skipped once; the next sweep sees them. A sweep taking
/// more than half the interval is logged as a warning.
pub fn spawn_keepalive(
    registry: &ClientRegistry,
    interval: Duration,
) -> KeepaliveHandle {
    let registry = registry.clone();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; clients were just pinged on connect.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    keepalive_sweep(&registry, interval).await;
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender means the handle is gone; stop too.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    KeepaliveHandle { shutdown_tx, task }
}

/// Default-interval variant of [`spawn_keepalive`].
pub fn spawn_default_keepalive(registry: &ClientRegistry) -> KeepaliveHandle {
    spawn_keepalive(registry, DEFAULT_KEEPALIVE_INTERVAL)
}

async fn keepalive_sweep(registry: &ClientRegistry, interval: Duration) {
    let started = Instant::now();
    for id in registry.client_ids() {
        let Some(client) = registry.get(&id).await else {
            continue;
        };
        if let Err(error) = client.sink.keepalive().await {
            warn!(id, %error, "keepalive ping failed");
        }
    }

    let elapsed = started.elapsed();
    if elapsed * 2 >= interval {
        warn!(?elapsed, ?interval, "keepalive sweep ran long");
    }
}
