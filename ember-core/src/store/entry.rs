use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

/// Outcome of an expiry callback: either the entry dies now, or its life is
/// extended to a new absolute timestamp.
///
/// `ExtendTo` only takes effect when the timestamp is in the future relative
/// to the evaluation; a past or present timestamp is treated as [`Delete`].
///
/// [`Delete`]: ExpiryDecision::Delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryDecision {
    /// Remove the entry now.
    Delete,
    /// Keep the entry alive until the given timestamp (ms since epoch).
    ExtendTo(i64),
}

/// Caller-supplied expiry callback.
///
/// Invoked with `force_delete = true` when the entry is removed explicitly
/// (delete, overwrite, clear) and `false` when a natural timeout is being
/// evaluated. An `Err` is logged and treated as [`ExpiryDecision::Delete`];
/// it never aborts the surrounding batch.
///
/// The callback may suspend, but must not call back into the same store's
/// mutating operations: those acquire the store lock the callback is already
/// running under.
pub type ExpiryCallback = Arc<
    dyn Fn(bool) -> BoxFuture<'static, anyhow::Result<ExpiryDecision>>
        + Send
        + Sync,
>;

/// A stored value plus its expiry timestamp and optional expiry callback.
/// One per key, owned exclusively by its store.
pub(crate) struct StoreEntry<T> {
    value: T,
    expires_at_ms: i64,
    on_expire: Option<ExpiryCallback>,
}

impl<T> StoreEntry<T> {
    pub(crate) fn new(
        value: T,
        expires_at_ms: i64,
        on_expire: Option<ExpiryCallback>,
    ) -> Self {
        Self {
            value,
            expires_at_ms,
            on_expire,
        }
    }

    pub(crate) fn value(&self) -> &T {
        &self.value
    }

    pub(crate) fn expires_at_ms(&self) -> i64 {
        self.expires_at_ms
    }

    pub(crate) fn set_expires_at(&mut self, expires_at_ms: i64) {
        self.expires_at_ms = expires_at_ms;
    }

    pub(crate) fn is_fresh_at(&self, now_ms: i64) -> bool {
        self.expires_at_ms >= now_ms
    }

    pub(crate) fn callback(&self) -> Option<ExpiryCallback> {
        self.on_expire.clone()
    }

    pub(crate) fn into_callback(self) -> Option<ExpiryCallback> {
        self.on_expire
    }
}

impl<T: fmt::Debug> fmt::Debug for StoreEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreEntry")
            .field("value", &self.value)
            .field("expires_at_ms", &self.expires_at_ms)
            .field("has_callback", &self.on_expire.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_is_inclusive_of_the_deadline() {
        let entry = StoreEntry::new("v", 1_000, None);
        assert!(entry.is_fresh_at(999));
        assert!(entry.is_fresh_at(1_000));
        assert!(!entry.is_fresh_at(1_001));
    }
}
