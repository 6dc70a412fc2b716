use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Inner {
    flag: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

/// Cooperative cancellation flag shared between a run and whoever may abort it.
///
/// Cancellation is only observed at checkpoints: the exporter polls it while
/// writing, and the orchestrator checks it once between validation and upload.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Release);
        // Take the lock so a waiter between its flag check and `wait` can't miss the notify.
        let _g = self.inner.lock.lock();
        self.inner.cv.notify_all();
    }

    /// Blocks up to `timeout`, returning early once cancelled. Returns the flag.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut guard) = self.inner.lock.lock() else {
            return self.is_cancelled();
        };
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.inner.cv.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => guard = g,
                Err(_) => break,
            }
        }
        self.is_cancelled()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
