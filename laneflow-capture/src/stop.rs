//! Cooperative cancellation shared by every thread of a pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Clonable stop flag with a condvar so sleeps wake up promptly on stop.
///
/// `stop()` is idempotent. Once stopped, a signal never resets.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for up to `timeout`, returning early when stopped.
    ///
    /// Returns `true` if the signal fired (before or during the wait).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !self.is_stopped() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _timeout_result) = self
                .inner
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_false_on_timeout() {
        let s = StopSignal::new();
        let t0 = std::time::Instant::now();
        assert!(!s.wait_timeout(Duration::from_millis(30)));
        assert!(t0.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn stop_wakes_waiters_promptly() {
        let s = StopSignal::new();
        let s2 = s.clone();
        let h = std::thread::spawn(move || {
            let t0 = std::time::Instant::now();
            assert!(s2.wait_timeout(Duration::from_secs(10)));
            t0.elapsed()
        });
        std::thread::sleep(Duration::from_millis(20));
        s.stop();
        let waited = h.join().unwrap();
        assert!(waited < Duration::from_secs(2));
        assert!(s.is_stopped());
        // idempotent
        s.stop();
        assert!(s.wait_timeout(Duration::from_secs(1)));
    }
}
