//! # Ember Core
//!
//! Core library for the Ember site backend: ephemeral keyed state with
//! per-entry expiry, strict-FIFO async locking, credential handling and
//! live-event client tracking.
//!
//! ## Overview
//!
//! `ember-core` offers:
//!
//! - **Timed Storage**: [`TimedStore`], a keyed in-memory store whose
//!   entries carry absolute expiry deadlines and optional async expiry
//!   callbacks that can delete or extend an entry
//! - **Adaptive Scheduling**: one timer per store, always armed for the
//!   soonest deadline and rearmed after every mutation
//! - **FIFO Locking**: [`FifoMutex`], an async mutex that grants waiters
//!   strictly in arrival order
//! - **Coordinated Shutdown**: a process-wide registry so teardown can
//!   disarm every managed store in one call
//! - **Authentication**: one-time codes, sliding sessions and durable
//!   tokens behind a repository port
//! - **Event Clients**: a registry of push-capable client sinks with
//!   presence-based expiry and a periodic keepalive sweep
//!
//! ## Architecture
//!
//! - [`store`]: the timed store, its expiry model and the shutdown registry
//! - [`sync`]: the FIFO mutex
//! - [`auth`]: the authentication service and its token repository port
//! - [`events`]: the event client registry and keepalive task
//!
//! ## Examples
//!
//! ```no_run
//! use ember_core::{ExpiryDecision, TimedStore, now_ms};
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let store: TimedStore<String> = TimedStore::new();
//! store
//!     .set_with_callback(
//!         "greeting".to_string(),
//!         "hello".to_string(),
//!         now_ms() + 5_000,
//!         Arc::new(|force_delete| {
//!             Box::pin(async move {
//!                 if force_delete {
//!                     return Ok(ExpiryDecision::Delete);
//!                 }
//!                 Ok(ExpiryDecision::ExtendTo(now_ms() + 5_000))
//!             })
//!         }),
//!     )
//!     .await;
//! assert_eq!(store.get("greeting").await.as_deref(), Some("hello"));
//! # }
//! ```

pub mod auth;
pub mod events;
pub mod store;
pub mod sync;

pub use store::{
    ExpiryCallback, ExpiryDecision, TimedStore, close_all_managed_stores,
    create_managed_store, now_ms,
};
pub use sync::{FifoMutex, FifoMutexGuard};
