//! Time sources.
//!
//! Every component reads time through [`Clock`] as epoch milliseconds, so
//! persisted instants (rate-limit windows, cache expiry, sync cursors) stay
//! meaningful across restarts.
//!
//! [`SystemClock`] anchors the wall clock to `tokio::time::Instant`. Under a
//! paused tokio runtime (`#[tokio::test(start_paused = true)]`) it advances
//! together with `tokio::time::sleep`, which keeps time-driven tests
//! deterministic. [`ManualClock`] only moves when told to.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of "now" in epoch milliseconds.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_ms(&self) -> i64;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn unix_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Wall clock driven by the tokio timer.
#[derive(Debug, Clone)]
pub struct SystemClock {
    base_ms: i64,
    base: tokio::time::Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_ms: unix_now_ms(),
            base: tokio::time::Instant::now(),
        }
    }

    /// Convenience constructor for the shared form.
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        self.base_ms + self.base.elapsed().as_millis() as i64
    }
}

/// Clock that only moves when advanced explicitly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start_ms),
        })
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Milliseconds from `now` until `at`, clamped at zero.
#[must_use]
pub fn until(now_ms: i64, at_ms: i64) -> Duration {
    Duration::from_millis(at_ms.saturating_sub(now_ms).max(0) as u64)
}
