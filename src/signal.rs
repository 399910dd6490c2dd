//! Wake signals shared by the orchestrator loops.
//!
//! A `Signal` wraps a one-shot `CancellationToken`. `notify()` fires the
//! current token and swaps in a fresh one, so a notification wakes whoever is
//! waiting right now without affecting later waiters. A sticky `wake_pending`
//! flag covers the gap where a notify lands before the loop calls `wait()`:
//! the next `wait()` consumes the flag and returns immediately.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Upper bound for any single wait. Longer requests (including
/// `Duration::MAX`) are clamped to this.
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Why a `wait()` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The signal was notified (possibly before the wait started).
    Notified,
    /// The caller's `is_resolved` predicate was already true.
    Resolved,
    /// The timeout elapsed.
    TimedOut,
}

/// Edge-triggered wake primitive with a sticky pending flag.
#[derive(Debug)]
pub struct Signal {
    name: &'static str,
    token: Mutex<CancellationToken>,
    wake_pending: AtomicBool,
}

impl Signal {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            token: Mutex::new(CancellationToken::new()),
            wake_pending: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fire the current token and replace it with an un-fired one.
    pub fn notify(&self) {
        self.wake_pending.store(true, Ordering::SeqCst);
        let mut token = self.lock_token();
        if !token.is_cancelled() {
            token.cancel();
        }
        *token = CancellationToken::new();
    }

    /// Whether a notify has not yet been consumed by a `wait()`.
    pub fn is_pending(&self) -> bool {
        self.wake_pending.load(Ordering::SeqCst)
    }

    /// Suspend until notified, `timeout` elapses, or `is_resolved` is true.
    pub async fn wait<F>(&self, timeout: Duration, is_resolved: F) -> WakeReason
    where
        F: Fn() -> bool,
    {
        if self.wake_pending.swap(false, Ordering::SeqCst) {
            return WakeReason::Notified;
        }
        if is_resolved() {
            return WakeReason::Resolved;
        }

        let token = self.lock_token().clone();
        // A notify between the swap above and the clone replaced the token we
        // would have listened on; the flag still records it.
        if self.wake_pending.swap(false, Ordering::SeqCst) {
            return WakeReason::Notified;
        }

        tokio::select! {
            _ = token.cancelled() => {
                self.wake_pending.store(false, Ordering::SeqCst);
                WakeReason::Notified
            }
            _ = tokio::time::sleep(timeout.min(MAX_WAIT)) => WakeReason::TimedOut,
        }
    }

    fn lock_token(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        // The guarded section never panics, but recover the token if it did.
        self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One signal per logical loop.
#[derive(Debug)]
pub struct Signals {
    pub manager: Signal,
    pub worker: Signal,
    pub cron: Signal,
    pub ui: Signal,
}

impl Signals {
    pub fn new() -> Self {
        Self {
            manager: Signal::new("manager"),
            worker: Signal::new("worker"),
            cron: Signal::new("cron"),
            ui: Signal::new("ui"),
        }
    }

    /// Wake every loop (used on shutdown).
    pub fn notify_all(&self) {
        self.manager.notify();
        self.worker.notify();
        self.cron.notify();
        self.ui.notify();
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn notify_before_wait_is_not_lost() {
        let signal = Signal::new("test");
        signal.notify();
        let reason = tokio::time::timeout(
            Duration::from_secs(1),
            signal.wait(Duration::MAX, || false),
        )
        .await
        .expect("wait should return immediately");
        assert_eq!(reason, WakeReason::Notified);
        assert!(!signal.is_pending());
    }

    #[tokio::test]
    async fn pending_flag_is_consumed_once() {
        let signal = Signal::new("test");
        signal.notify();
        signal.notify();
        assert_eq!(
            signal.wait(Duration::from_millis(10), || false).await,
            WakeReason::Notified
        );
        assert_eq!(
            signal.wait(Duration::from_millis(10), || false).await,
            WakeReason::TimedOut
        );
    }

    #[tokio::test]
    async fn resolved_predicate_short_circuits() {
        let signal = Signal::new("test");
        assert_eq!(
            signal.wait(Duration::MAX, || true).await,
            WakeReason::Resolved
        );
    }

    #[tokio::test]
    async fn notify_wakes_a_parked_waiter() {
        let signal = Arc::new(Signal::new("test"));
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait(Duration::from_secs(30), || false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.notify();
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(reason, WakeReason::Notified);
    }

    #[tokio::test]
    async fn timeout_elapses_without_notify() {
        let signal = Signal::new("test");
        assert_eq!(
            signal.wait(Duration::from_millis(50), || false).await,
            WakeReason::TimedOut
        );
    }
}
