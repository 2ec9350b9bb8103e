//! Keep-alive watchdog for trace sessions.
//!
//! A watchdog holds at most one armed timer. Resetting cancels the armed timer
//! and schedules a fresh one, so two timers are never armed for the same
//! watchdog. Once stopped, a watchdog ignores further resets.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Slot {
    armed: Option<CancellationToken>,
    stopped: bool,
}

/// Cancellable deferred action, rearmed on every keep-alive.
pub(crate) struct Watchdog {
    interval: Duration,
    slot: Mutex<Slot>,
}

impl Watchdog {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Cancel the armed timer, if any, and run `on_expire` once the interval
    /// elapses without another reset or a stop.
    ///
    /// Returns `false` without arming anything if the watchdog was stopped.
    pub(crate) fn reset<F, Fut>(&self, on_expire: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.stopped {
            return false;
        }
        if let Some(previous) = slot.armed.take() {
            previous.cancel();
        }

        let token = CancellationToken::new();
        slot.armed = Some(token.clone());
        let interval = self.interval;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(interval) => on_expire().await,
            }
        });
        true
    }

    /// Cancel the armed timer and refuse any later reset.
    pub(crate) fn stop(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.stopped = true;
        if let Some(armed) = slot.armed.take() {
            armed.cancel();
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stopped
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(armed) = slot.armed.take() {
            armed.cancel();
        }
    }
}
