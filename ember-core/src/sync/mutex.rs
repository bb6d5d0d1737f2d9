use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use tokio::sync::oneshot;

/// An asynchronous mutual-exclusion lock with strict FIFO wait ordering.
///
/// Waiters are granted the lock in arrival order. On release, ownership is
/// handed directly to the next queued waiter instead of briefly going idle,
/// so a late arrival can never overtake a task that was already waiting.
///
/// The lock is **not reentrant**: a task that already holds the lock and
/// calls [`acquire`](FifoMutex::acquire) again deadlocks against itself.
/// This is a documented caller responsibility, not a runtime error.
#[derive(Debug, Default)]
pub struct FifoMutex {
    state: StdMutex<LockState>,
}

#[derive(Debug, Default)]
struct LockState {
    held: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// RAII guard returned by [`FifoMutex::acquire`]. Dropping the guard
/// releases the lock, on normal exit, early return and panic alike.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct FifoMutexGuard<'a> {
    lock: &'a FifoMutex,
}

impl Drop for FifoMutexGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Tracks a queued waiter until the handoff completes. If the waiting future
/// is dropped after the releasing task has already signalled it, the grant
/// would otherwise be lost and the lock leaked; the drop path reclaims it.
struct PendingGrant<'a> {
    rx: Option<oneshot::Receiver<()>>,
    lock: &'a FifoMutex,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.lock.unlock();
            }
        }
    }
}

impl FifoMutex {
    /// Creates a new unlocked mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends until the lock is free, then takes it.
    ///
    /// Cancel-safe: dropping the returned future while queued removes the
    /// waiter; dropping it in the narrow window after the previous holder
    /// handed the lock over releases the lock again.
    pub async fn acquire(&self) -> FifoMutexGuard<'_> {
        let rx = {
            let mut state =
                self.state.lock().expect("lock state mutex poisoned");
            if state.held {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            } else {
                state.held = true;
                None
            }
        };

        if let Some(rx) = rx {
            let mut pending = PendingGrant {
                rx: Some(rx),
                lock: self,
            };
            // The releasing task marks the lock as ours before signalling,
            // so a successful recv means ownership already transferred.
            pending
                .rx
                .as_mut()
                .expect("pending grant receiver present")
                .await
                .expect("lock dropped while waiters were queued");
            pending.rx = None;
        }

        FifoMutexGuard { lock: self }
    }

    /// Non-blocking observation of the current lock state.
    pub fn is_held(&self) -> bool {
        self.state.lock().expect("lock state mutex poisoned").held
    }

    /// Acquires the lock, runs `f`, and releases on every exit path.
    /// The closure's output (or panic) propagates to the caller.
    pub async fn run_exclusive<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire().await;
        f().await
    }

    /// Returns a callable that routes `f` through
    /// [`run_exclusive`](FifoMutex::run_exclusive) on this lock.
    pub fn wrap<F, Fut, T>(
        self: &Arc<Self>,
        f: F,
    ) -> impl Fn() -> BoxFuture<'static, T>
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let lock = Arc::clone(self);
        move || {
            let lock = Arc::clone(&lock);
            let f = f.clone();
            Box::pin(async move { lock.run_exclusive(f).await })
        }
    }

    fn unlock(&self) {
        let mut state = self.state.lock().expect("lock state mutex poisoned");
        while let Some(waiter) = state.waiters.pop_front() {
            // Handoff: the lock stays held and ownership moves to the next
            // waiter. A waiter that gave up while queued is skipped.
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.held = false;
    }
}
