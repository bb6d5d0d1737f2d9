//! Asynchronous synchronization primitives.
//!
//! The store layer serializes every mutating operation through [`FifoMutex`],
//! which guarantees strict arrival-order handoff between cooperating tasks.

mod mutex;

pub use mutex::{FifoMutex, FifoMutexGuard};
