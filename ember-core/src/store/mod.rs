//! Ephemeral keyed storage with adaptive expiry scheduling.
//!
//! [`TimedStore`] maps string keys to typed values with an absolute expiry
//! timestamp and an optional expiry callback per entry. Instead of sweeping
//! the whole map on an interval, each store owns a single adaptive timer
//! that is always armed for the soonest-expiring live entry and rearmed
//! after every mutation. All mutating and reading operations are linearized
//! through a [`FifoMutex`]; the timer's evaluation is just another
//! lock-acquiring flow, totally ordered with concurrent calls.
//!
//! State is memory-resident and rebuilt on process restart. Anything that
//! must survive a restart belongs in the callers' durable store, not here.

mod entry;
mod registry;

pub use entry::{ExpiryCallback, ExpiryDecision};
pub use registry::{close_all_managed_stores, create_managed_store};

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::sync::FifoMutex;
use entry::StoreEntry;

/// Milliseconds since the Unix epoch, the time source shared by the store
/// and its callers.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

struct TimerState {
    /// Bumped on every (re)arm and on close; a fired timer whose stamped
    /// generation no longer matches mutates nothing.
    generation: u64,
    /// Key the live timer is armed for, `None` when disarmed.
    armed_for: Option<String>,
    handle: Option<JoinHandle<()>>,
    closed: bool,
}

struct StoreInner<T> {
    entries: DashMap<String, StoreEntry<T>>,
    lock: FifoMutex,
    timer: StdMutex<TimerState>,
}

impl<T> Drop for StoreInner<T> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .timer
            .lock()
            .expect("timer state mutex poisoned")
            .handle
            .take()
        {
            handle.abort();
        }
    }
}

/// A keyed store whose entries expire at absolute timestamps.
///
/// Cloning is cheap and clones share the same underlying map and timer.
///
/// # Example
///
/// ```rust,no_run
/// use ember_core::store::TimedStore;
/// use ember_core::store::now_ms;
///
/// #[tokio::main]
/// async fn main() {
///     let store = TimedStore::new();
///     store.set("session", "avatar-1".to_string(), now_ms() + 60_000).await;
///     assert_eq!(store.get("session").await.as_deref(), Some("avatar-1"));
/// }
/// ```
pub struct TimedStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for TimedStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for TimedStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let timer = self.inner.timer.lock().expect("timer state mutex poisoned");
        f.debug_struct("TimedStore")
            .field("entries", &self.inner.entries.len())
            .field("armed_for", &timer.armed_for)
            .field("closed", &timer.closed)
            .finish()
    }
}

impl<T> Default for TimedStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimedStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty store with a disarmed timer.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                lock: FifoMutex::new(),
                timer: StdMutex::new(TimerState {
                    generation: 0,
                    armed_for: None,
                    handle: None,
                    closed: false,
                }),
            }),
        }
    }

    /// Stores `value` under `key` until `expires_at_ms`.
    ///
    /// An existing entry under the same key is forcibly retired first: its
    /// expiry callback runs with `force_delete = true` and is awaited before
    /// the new entry becomes visible.
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: T,
        expires_at_ms: i64,
    ) {
        self.set_inner(key.into(), value, expires_at_ms, None).await;
    }

    /// Like [`set`](TimedStore::set), with an expiry callback deciding at
    /// each expiry evaluation whether the entry dies or lives on.
    pub async fn set_with_callback(
        &self,
        key: impl Into<String>,
        value: T,
        expires_at_ms: i64,
        on_expire: ExpiryCallback,
    ) {
        self.set_inner(key.into(), value, expires_at_ms, Some(on_expire))
            .await;
    }

    async fn set_inner(
        &self,
        key: String,
        value: T,
        expires_at_ms: i64,
        on_expire: Option<ExpiryCallback>,
    ) {
        let _guard = self.inner.lock.acquire().await;
        if let Some((_, previous)) = self.inner.entries.remove(&key) {
            run_callback(&key, previous.into_callback(), true).await;
        }
        self.inner
            .entries
            .insert(key, StoreEntry::new(value, expires_at_ms, on_expire));
        self.reschedule();
    }

    /// Looks up `key`, expiring the entry lazily if its deadline passed.
    ///
    /// A fresh entry returns its value. An expired entry runs its callback
    /// with `force_delete = false`; a decision extending expiry into the
    /// future keeps the value alive, anything else removes the entry and
    /// returns `None`.
    pub async fn get(&self, key: &str) -> Option<T> {
        let _guard = self.inner.lock.acquire().await;
        let now = now_ms();
        let callback = {
            let guard = self.inner.entries.get(key)?;
            // Reborrow past the map guard's own `value` accessor.
            let entry = &*guard;
            if entry.is_fresh_at(now) {
                return Some(entry.value().clone());
            }
            entry.callback()
        };

        match run_callback(key, callback, false).await {
            ExpiryDecision::ExtendTo(at) if at > now => {
                let value = {
                    let mut guard = self.inner.entries.get_mut(key)?;
                    guard.set_expires_at(at);
                    (*guard).value().clone()
                };
                self.reschedule();
                Some(value)
            }
            _ => {
                self.inner.entries.remove(key);
                self.reschedule();
                None
            }
        }
    }

    /// Removes `key`, running its callback with `force_delete = true`.
    /// Returns whether the key was present.
    pub async fn delete(&self, key: &str) -> bool {
        let _guard = self.inner.lock.acquire().await;
        let Some((_, entry)) = self.inner.entries.remove(key) else {
            return false;
        };
        run_callback(key, entry.into_callback(), true).await;
        self.reschedule();
        true
    }

    /// Removes every entry. Callbacks run concurrently with
    /// `force_delete = true`; one failing callback does not affect the rest.
    pub async fn clear(&self) {
        let _guard = self.inner.lock.acquire().await;
        let keys: Vec<String> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut callbacks = Vec::new();
        for key in keys {
            if let Some((key, entry)) = self.inner.entries.remove(&key) {
                if let Some(callback) = entry.into_callback() {
                    callbacks.push((key, callback));
                }
            }
        }

        futures::future::join_all(callbacks.into_iter().map(
            |(key, callback)| async move {
                if let Err(error) = callback(true).await {
                    warn!(key, %error, "expiry callback failed during clear");
                }
            },
        ))
        .await;

        self.reschedule();
    }

    /// Removes every entry whose value equals `value`, running each entry's
    /// callback with `force_delete = true`. Returns the number of entries
    /// removed; the timer is rearmed once after the whole batch.
    pub async fn delete_all_values(&self, value: &T) -> usize
    where
        T: PartialEq,
    {
        let _guard = self.inner.lock.acquire().await;
        let matching: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.value().value() == value)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in matching {
            if let Some((key, entry)) = self.inner.entries.remove(&key) {
                run_callback(&key, entry.into_callback(), true).await;
                removed += 1;
            }
        }

        self.reschedule();
        removed
    }

    /// Point-in-time snapshot of the currently known keys.
    ///
    /// Deliberately does not take the store lock, so the result may be stale
    /// relative to in-flight mutations. Intended for non-critical iteration
    /// such as keepalive sweeps.
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of entries, including any whose deadline has passed but whose
    /// timer has not evaluated yet. Does not take the store lock.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the store currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Disarms the timer and waits for any in-flight expiry evaluation to
    /// finish. Idempotent. Entries remain readable afterwards and still
    /// expire lazily on [`get`](TimedStore::get), but no timer fires again.
    pub async fn close(&self) {
        let handle = {
            let _guard = self.inner.lock.acquire().await;
            let mut timer =
                self.inner.timer.lock().expect("timer state mutex poisoned");
            timer.closed = true;
            timer.generation = timer.generation.wrapping_add(1);
            timer.armed_for = None;
            timer.handle.take()
        };

        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        debug!("timed store closed");
    }

    /// Recomputes the nearest expiry and rearms the single timer for it,
    /// or disarms when the store is empty.
    ///
    /// Must be called while the store lock is held: the generation bump has
    /// to be linearized with the mutation that triggered it so that a
    /// concurrent in-flight fire reliably observes its cancellation.
    fn reschedule(&self) {
        let mut timer =
            self.inner.timer.lock().expect("timer state mutex poisoned");
        if timer.closed {
            return;
        }

        if let Some(previous) = timer.handle.take() {
            previous.abort();
        }
        timer.generation = timer.generation.wrapping_add(1);

        let nearest = self
            .inner
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at_ms())
            .map(|entry| (entry.key().clone(), entry.value().expires_at_ms()));

        let Some((key, expires_at_ms)) = nearest else {
            timer.armed_for = None;
            return;
        };

        let delay_ms = (expires_at_ms - now_ms() + 1).max(0) as u64;
        let generation = timer.generation;
        timer.armed_for = Some(key.clone());
        debug!(key, delay_ms, "expiry timer armed");

        let inner = Arc::downgrade(&self.inner);
        timer.handle = Some(tokio::spawn(timer_task(
            inner,
            key,
            generation,
            Duration::from_millis(delay_ms),
        )));
    }

    /// Timer-fire path: evaluate the remembered key, then rearm.
    async fn evaluate(&self, key: &str, generation: u64) {
        let _guard = self.inner.lock.acquire().await;
        {
            let timer =
                self.inner.timer.lock().expect("timer state mutex poisoned");
            if timer.closed || timer.generation != generation {
                debug!(key, "stale expiry timer fired, ignoring");
                return;
            }
        }

        let now = now_ms();
        // The entry can be missing or refreshed if a concurrent operation
        // won the lock first; evaluation then degrades to a reschedule.
        let pending = match self.inner.entries.get(key) {
            Some(entry) if !entry.is_fresh_at(now) => Some(entry.callback()),
            _ => None,
        };

        if let Some(callback) = pending {
            match run_callback(key, callback, false).await {
                ExpiryDecision::ExtendTo(at) if at > now => {
                    if let Some(mut entry) = self.inner.entries.get_mut(key) {
                        entry.set_expires_at(at);
                    }
                }
                _ => {
                    self.inner.entries.remove(key);
                    debug!(key, "entry expired");
                }
            }
        }

        self.reschedule();
    }
}

async fn timer_task<T>(
    inner: Weak<StoreInner<T>>,
    key: String,
    generation: u64,
    delay: Duration,
) where
    T: Clone + Send + Sync + 'static,
{
    tokio::time::sleep(delay).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    TimedStore { inner }.evaluate(&key, generation).await;
}

/// Runs an expiry callback, absorbing failures: an `Err` is logged and
/// treated as a delete decision so it never aborts the surrounding batch.
async fn run_callback(
    key: &str,
    callback: Option<ExpiryCallback>,
    force_delete: bool,
) -> ExpiryDecision {
    let Some(callback) = callback else {
        return ExpiryDecision::Delete;
    };
    match callback(force_delete).await {
        Ok(decision) => decision,
        Err(error) => {
            warn!(key, %error, "expiry callback failed, deleting entry");
            ExpiryDecision::Delete
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Callback that records the `force_delete` flag of every invocation
    /// and always decides to delete.
    fn recording_callback(log: Arc<StdMutex<Vec<bool>>>) -> ExpiryCallback {
        Arc::new(move |force_delete| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(force_delete);
                Ok(ExpiryDecision::Delete)
            })
        })
    }

    #[tokio::test]
    async fn get_returns_last_set_value() {
        let store = TimedStore::new();
        store.set("k", "v1".to_string(), now_ms() + 60_000).await;
        assert_eq!(store.get("k").await.as_deref(), Some("v1"));

        store.set("k", "v2".to_string(), now_ms() + 60_000).await;
        assert_eq!(store.get("k").await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn get_clones_the_stored_value_on_both_paths() {
        let store: TimedStore<Vec<u32>> = TimedStore::new();

        // Fresh path.
        store.set("fresh", vec![1, 2], now_ms() + 60_000).await;
        assert_eq!(store.get("fresh").await, Some(vec![1, 2]));

        // Extend path: the value comes back out of the in-place update.
        let extending: ExpiryCallback = Arc::new(|_force| {
            Box::pin(async { Ok(ExpiryDecision::ExtendTo(now_ms() + 60_000)) })
        });
        store
            .set_with_callback("stale", vec![3], now_ms() - 1, extending)
            .await;
        assert_eq!(store.get("stale").await, Some(vec![3]));
    }

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let store: TimedStore<String> = TimedStore::new();
        assert_eq!(store.get("missing").await, None);
    }

    #[tokio::test]
    async fn overwrite_force_expires_previous_entry() {
        let store = TimedStore::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        store
            .set_with_callback(
                "k",
                "old".to_string(),
                now_ms() + 60_000,
                recording_callback(Arc::clone(&log)),
            )
            .await;
        store.set("k", "new".to_string(), now_ms() + 60_000).await;

        assert_eq!(*log.lock().unwrap(), vec![true]);
        assert_eq!(store.get("k").await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn timer_removes_entry_without_any_read() {
        let store = TimedStore::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        store
            .set_with_callback(
                "k",
                "v".to_string(),
                now_ms() + 80,
                recording_callback(Arc::clone(&log)),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(300)).await;

        // No get() happened; the adaptive timer alone must have cleared it.
        assert!(store.keys().is_empty());
        assert_eq!(*log.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn expired_entry_is_gone_on_get() {
        let store = TimedStore::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        // Already expired at insert; the immediate timer fire and the get
        // race for the lock, but exactly one of them evaluates the entry.
        store
            .set_with_callback(
                "k",
                "v".to_string(),
                now_ms() - 1,
                recording_callback(Arc::clone(&log)),
            )
            .await;

        assert_eq!(store.get("k").await, None);
        assert!(store.keys().is_empty());
        assert_eq!(*log.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn extend_decision_keeps_entry_alive() {
        let store = TimedStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let callback: ExpiryCallback = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_force| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Ok(ExpiryDecision::ExtendTo(now_ms() + 400))
                    } else {
                        Ok(ExpiryDecision::Delete)
                    }
                })
            })
        };

        store
            .set_with_callback("k", "v".to_string(), now_ms() + 150, callback)
            .await;

        // First evaluation extends.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Second evaluation deletes.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.get("k").await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn extend_into_the_past_is_a_delete() {
        let store = TimedStore::new();
        let callback: ExpiryCallback = Arc::new(|_force| {
            Box::pin(async { Ok(ExpiryDecision::ExtendTo(now_ms() - 1_000)) })
        });

        store
            .set_with_callback("k", "v".to_string(), now_ms() - 1, callback)
            .await;

        assert_eq!(store.get("k").await, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn delete_runs_callback_once_with_force() {
        let store = TimedStore::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        store
            .set_with_callback(
                "k",
                "v".to_string(),
                now_ms() + 60_000,
                recording_callback(Arc::clone(&log)),
            )
            .await;

        assert!(store.delete("k").await);
        assert!(!store.delete("k").await);
        assert_eq!(store.get("k").await, None);
        assert_eq!(*log.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn clear_isolates_callback_failures() {
        let store = TimedStore::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let failing: ExpiryCallback = Arc::new(|_force| {
            Box::pin(async { anyhow::bail!("cleanup went sideways") })
        });

        store
            .set_with_callback("bad", "v".to_string(), now_ms() + 60_000, failing)
            .await;
        store
            .set_with_callback(
                "good",
                "v".to_string(),
                now_ms() + 60_000,
                recording_callback(Arc::clone(&log)),
            )
            .await;

        store.clear().await;

        assert!(store.is_empty());
        assert_eq!(*log.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn callback_error_on_timeout_deletes_entry() {
        let store = TimedStore::new();
        let failing: ExpiryCallback = Arc::new(|_force| {
            Box::pin(async { anyhow::bail!("refresh lookup failed") })
        });

        store
            .set_with_callback("k", "v".to_string(), now_ms() + 80, failing)
            .await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn delete_all_values_matches_exactly() {
        let store = TimedStore::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let deadline = now_ms() + 60_000;

        store.set("k0", "other".to_string(), deadline).await;
        for key in ["k1", "k2", "k3"] {
            store
                .set_with_callback(
                    key,
                    "target".to_string(),
                    deadline,
                    recording_callback(Arc::clone(&log)),
                )
                .await;
        }

        let removed = store.delete_all_values(&"target".to_string()).await;

        assert_eq!(removed, 3);
        assert_eq!(*log.lock().unwrap(), vec![true, true, true]);
        assert_eq!(store.get("k0").await.as_deref(), Some("other"));
        assert_eq!(store.get("k1").await, None);
        assert_eq!(store.get("k2").await, None);
        assert_eq!(store.get("k3").await, None);
    }

    #[tokio::test]
    async fn timer_retargets_to_sooner_entry() {
        let store = TimedStore::new();

        store.set("slow", "v".to_string(), now_ms() + 600).await;
        store.set("fast", "v".to_string(), now_ms() + 150).await;

        tokio::time::sleep(Duration::from_millis(350)).await;
        let keys = store.keys();
        assert!(!keys.contains(&"fast".to_string()));
        assert!(keys.contains(&"slow".to_string()));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn close_silences_pending_timer() {
        let store = TimedStore::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        store
            .set_with_callback(
                "k",
                "v".to_string(),
                now_ms() + 100,
                recording_callback(Arc::clone(&log)),
            )
            .await;

        store.close().await;
        store.close().await; // idempotent

        tokio::time::sleep(Duration::from_millis(300)).await;

        // Deadline long past, but no timer may touch the map after close.
        assert_eq!(store.keys(), vec!["k".to_string()]);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_is_a_point_in_time_snapshot() {
        let store = TimedStore::new();
        store.set("a", 1u32, now_ms() + 60_000).await;
        store.set("b", 2u32, now_ms() + 60_000).await;

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.len(), 2);
    }
}
