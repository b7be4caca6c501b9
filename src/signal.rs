//! Cooperative cancellation shared by the controller and every worker

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cloneable cancellation flag with interruptible sleeps
#[derive(Clone, Default)]
pub struct RunSignal {
    inner: Arc<Inner>,
}

impl RunSignal {
    /// Create an untriggered signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every sleeper
    pub fn cancel(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.wake.notify_all();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for `duration` unless cancelled first
    ///
    /// Returns `true` if the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration)
    }

    /// Sleep until `deadline` unless cancelled first
    ///
    /// Returns `true` if the deadline was reached.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            if Instant::now() >= deadline {
                return true;
            }
            if self.inner.wake.wait_until(&mut guard, deadline).timed_out() {
                return !self.is_cancelled();
            }
        }
        false
    }
}
