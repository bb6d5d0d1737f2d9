//! Process-wide registry of live [`TimedStore`] instances.
//!
//! Stores created through [`create_managed_store`] are tracked in a global
//! set so process teardown can close them all in one call and no dangling
//! timer task keeps the runtime alive. Registration is explicit; nothing is
//! added behind the caller's back.

use std::sync::Mutex as StdMutex;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tracing::info;

use super::TimedStore;

/// Object-safe view of a store that only exposes shutdown.
trait ManagedStore: Send + Sync {
    fn close(&self) -> BoxFuture<'_, ()>;
}

impl<T> ManagedStore for TimedStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(TimedStore::close(self))
    }
}

static MANAGED_STORES: Lazy<StdMutex<Vec<Box<dyn ManagedStore>>>> =
    Lazy::new(|| StdMutex::new(Vec::new()));

/// Creates a [`TimedStore`] and registers it for coordinated shutdown via
/// [`close_all_managed_stores`].
pub fn create_managed_store<T>() -> TimedStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    let store = TimedStore::new();
    MANAGED_STORES
        .lock()
        .expect("managed store registry mutex poisoned")
        .push(Box::new(store.clone()));
    store
}

/// Closes every registered store and drains the registry. Intended for
/// process teardown; safe to call more than once.
pub async fn close_all_managed_stores() {
    let stores: Vec<Box<dyn ManagedStore>> = {
        let mut registry = MANAGED_STORES
            .lock()
            .expect("managed store registry mutex poisoned");
        registry.drain(..).collect()
    };

    info!(count = stores.len(), "closing managed timed stores");
    futures::future::join_all(stores.iter().map(|store| store.close())).await;
}
