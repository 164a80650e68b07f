//! Trailing-edge debounce on tokio.
//!
//! Bursts of entity or preference changes collapse into one region sync.
//! Only one run is ever pending: scheduling aborts the pending timer and
//! replaces it. The work itself stays synchronous and takes the engine's
//! locks, so it runs on the blocking pool rather than a runtime worker.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Single-slot trailing-edge debouncer.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `work` once `delay` has passed without another call.
    ///
    /// Outside a tokio runtime there is no timer to wait on, so `work`
    /// runs immediately. Returns whether the run was deferred.
    pub fn schedule<F>(&self, work: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(handle) = Handle::try_current() else {
            self.cancel();
            work();
            return false;
        };
        let delay = self.delay;
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(work).await {
                tracing::warn!(error = %e, "debounced run failed");
            }
        }));
        true
    }

    /// Drop the pending run, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.take() {
            Some(h) if !h.is_finished() => {
                h.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let make = move || -> Box<dyn FnOnce() + Send> {
            let r = Arc::clone(&r);
            Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
        };
        (runs, make)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_run() {
        let debouncer = Debouncer::new(Duration::from_millis(400));
        let (runs, make) = counter();
        for _ in 0..5 {
            assert!(debouncer.schedule(make()));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_run() {
        let debouncer = Debouncer::new(Duration::from_millis(400));
        let (runs, make) = counter();
        debouncer.schedule(make());
        assert!(debouncer.is_pending());
        assert!(debouncer.cancel());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_calls_each_run() {
        let debouncer = Debouncer::new(Duration::from_millis(400));
        let (runs, make) = counter();
        debouncer.schedule(make());
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.schedule(make());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn without_runtime_runs_inline() {
        let debouncer = Debouncer::new(Duration::from_millis(400));
        let (runs, make) = counter();
        assert!(!debouncer.schedule(make()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[allow(clippy::await_holding_lock)]
    async fn blocking_work_leaves_the_runtime_free() {
        let debouncer = Debouncer::new(Duration::from_millis(10));
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let g = Arc::clone(&gate);
        debouncer.schedule(move || {
            let _lock = g.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = tx.send(());
        });

        // The run is parked on the gate; this thread must still drive timers.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        rx.await.unwrap();
    }
}
