// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Admission control for a quota-limited upstream.
//!
//! Three independent ceilings must all pass before a call leaves the
//! process: a per-minute count, a per-day count and a minimum delay since
//! the previous request. Usage is persisted under `ratelimit:<name>` so a
//! restart inside a window keeps counting from where it stopped.
//!
//! Work that cannot be admitted right away waits on an admission ticket.
//! Tickets are ordered by descending priority, FIFO within a priority, and
//! a single dispatcher task grants them as quota frees up. The caller's
//! future never leaves the caller; only the ticket is queued.
//!
//! ```text
//! execute ─► queue empty && admitted? ── yes ─► record usage ─► run op
//!                    │ no
//!                    ▼
//!             push Ticket ─► dispatcher: sleep(wait) ─► grant ─► run op
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::{retry_if, RetryConfig};
use crate::clock::{until, SharedClock};
use crate::error::CallError;
use crate::storage::{load_json, save_json, KvStore};

const MINUTE_MS: i64 = 60_000;
const DAY_MS: i64 = 86_400_000;

/// Ceilings and quota-retry policy for one limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_day: u32,
    /// Minimum spacing between two admitted requests
    pub min_delay: Duration,
    /// Extra attempts after a quota-style upstream rejection
    pub max_quota_retries: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_day: 1500,
            min_delay: Duration::from_secs(1),
            max_quota_retries: 3,
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

impl RateLimitConfig {
    fn quota_retry(&self) -> RetryConfig {
        RetryConfig::quota(
            self.max_quota_retries,
            self.retry_initial_delay,
            self.retry_max_delay,
        )
    }

    fn check(&self, usage: &mut RateLimiterUsage, now: i64) -> Admission {
        usage.refresh(now);

        if usage.day_count >= self.requests_per_day {
            return Admission::denied(AdmissionReason::DailyQuota, until(now, usage.day_reset_at));
        }
        if usage.minute_count >= self.requests_per_minute {
            return Admission::denied(
                AdmissionReason::MinuteQuota,
                until(now, usage.minute_reset_at),
            );
        }
        if let Some(last) = usage.last_request_at {
            let next = last + self.min_delay.as_millis() as i64;
            if now < next {
                return Admission::denied(AdmissionReason::MinDelay, until(now, next));
            }
        }
        Admission::allowed()
    }
}

/// Persisted usage counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterUsage {
    pub minute_count: u32,
    pub minute_reset_at: i64,
    pub day_count: u32,
    pub day_reset_at: i64,
    pub total_requests: u64,
    pub total_errors: u64,
    #[serde(default)]
    pub last_request_at: Option<i64>,
}

impl RateLimiterUsage {
    /// Reset any window whose reset instant has passed.
    fn refresh(&mut self, now: i64) {
        if now >= self.minute_reset_at {
            self.minute_count = 0;
            self.minute_reset_at = now + MINUTE_MS;
        }
        if now >= self.day_reset_at {
            self.day_count = 0;
            self.day_reset_at = now + DAY_MS;
        }
    }

    fn record(&mut self, now: i64) {
        self.minute_count += 1;
        self.day_count += 1;
        self.total_requests += 1;
        self.last_request_at = Some(now);
    }
}

/// Which ceiling refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionReason {
    DailyQuota,
    MinuteQuota,
    MinDelay,
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub wait: Duration,
    pub reason: Option<AdmissionReason>,
}

impl Admission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            wait: Duration::ZERO,
            reason: None,
        }
    }

    fn denied(reason: AdmissionReason, wait: Duration) -> Self {
        Self {
            allowed: false,
            wait,
            reason: Some(reason),
        }
    }
}

struct Ticket {
    priority: i32,
    seq: u64,
    grant: oneshot::Sender<()>,
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Ticket {}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ticket {
    // Max-heap: higher priority first, then lower sequence first
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct LimiterState {
    usage: RateLimiterUsage,
    queue: BinaryHeap<Ticket>,
    next_seq: u64,
    dispatcher_running: bool,
}

pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    store: Arc<dyn KvStore>,
    clock: SharedClock,
    state: Mutex<LimiterState>,
    loaded: AtomicBool,
    /// Serializes usage writes so the newest snapshot always lands last
    persist_lock: tokio::sync::Mutex<()>,
}

impl RateLimiter {
    pub fn new(
        name: impl Into<String>,
        config: RateLimitConfig,
        store: Arc<dyn KvStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            store,
            clock,
            state: Mutex::new(LimiterState {
                usage: RateLimiterUsage::default(),
                queue: BinaryHeap::new(),
                next_seq: 0,
                dispatcher_running: false,
            }),
            loaded: AtomicBool::new(false),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn storage_key(&self) -> String {
        format!("ratelimit:{}", self.name)
    }

    /// Load persisted usage. Runs once; later calls are no-ops.
    pub async fn restore(&self) {
        let _guard = self.persist_lock.lock().await;
        if self.loaded.load(AtomicOrdering::Acquire) {
            return;
        }

        match load_json::<RateLimiterUsage>(self.store.as_ref(), &self.storage_key()).await {
            Ok(Some(usage)) => {
                info!(
                    limiter = %self.name,
                    minute_count = usage.minute_count,
                    day_count = usage.day_count,
                    "Restored rate limiter usage"
                );
                self.state.lock().usage = usage;
            }
            Ok(None) => {}
            Err(e) => warn!(limiter = %self.name, error = %e, "Ignoring unreadable rate limiter usage"),
        }
        self.loaded.store(true, AtomicOrdering::Release);
    }

    async fn ensure_loaded(&self) {
        if !self.loaded.load(AtomicOrdering::Acquire) {
            self.restore().await;
        }
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let usage = self.state.lock().usage.clone();
        if let Err(e) = save_json(self.store.as_ref(), &self.storage_key(), &usage).await {
            warn!(limiter = %self.name, error = %e, "Failed to persist rate limiter usage");
        }
    }

    /// Check all ceilings without consuming quota.
    pub async fn can_proceed(&self) -> Admission {
        self.ensure_loaded().await;
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.config.check(&mut state.usage, now)
    }

    /// Snapshot of the current counters.
    #[must_use]
    pub fn usage(&self) -> RateLimiterUsage {
        self.state.lock().usage.clone()
    }

    /// Number of callers waiting for admission.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Count a failed call against `total_errors`.
    pub async fn record_error(&self) {
        self.state.lock().usage.total_errors += 1;
        self.persist().await;
    }

    /// Consume quota now or fail with `QuotaExceeded`. Never queues.
    pub async fn try_acquire(&self) -> Result<(), CallError> {
        self.ensure_loaded().await;
        let now = self.clock.now_ms();
        {
            let mut state = self.state.lock();
            let admission = self.config.check(&mut state.usage, now);
            if !admission.allowed || !state.queue.is_empty() {
                crate::metrics::record_admission(&self.name, "rejected");
                return Err(CallError::QuotaExceeded {
                    wait_ms: admission.wait.as_millis() as u64,
                });
            }
            state.usage.record(now);
        }
        crate::metrics::record_admission(&self.name, "admitted");
        self.persist().await;
        Ok(())
    }

    /// Wait until quota admits one request at `priority`.
    ///
    /// Admits immediately when nothing is queued and every ceiling passes;
    /// otherwise enqueues a ticket. Dropping the returned future abandons
    /// the ticket without consuming quota.
    pub async fn acquire(self: &Arc<Self>, priority: i32) -> Result<(), CallError> {
        self.ensure_loaded().await;
        let now = self.clock.now_ms();

        let granted = {
            let mut state = self.state.lock();
            let admission = self.config.check(&mut state.usage, now);
            if state.queue.is_empty() && admission.allowed {
                state.usage.record(now);
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.queue.push(Ticket {
                    priority,
                    seq,
                    grant: tx,
                });
                crate::metrics::set_rate_limit_queue_depth(&self.name, state.queue.len());
                crate::metrics::record_admission(&self.name, "queued");
                debug!(
                    limiter = %self.name,
                    priority,
                    queued = state.queue.len(),
                    reason = ?admission.reason,
                    "Request queued for admission"
                );
                if !state.dispatcher_running {
                    state.dispatcher_running = true;
                    let limiter = Arc::clone(self);
                    tokio::spawn(async move { limiter.dispatch().await });
                }
                Some(rx)
            }
        };

        match granted {
            None => {
                crate::metrics::record_admission(&self.name, "admitted");
                self.persist().await;
                Ok(())
            }
            Some(rx) => {
                rx.await.map_err(|_| CallError::Cancelled)?;
                crate::metrics::record_admission(&self.name, "dequeued");
                Ok(())
            }
        }
    }

    async fn dispatch(&self) {
        loop {
            let now = self.clock.now_ms();
            let step = {
                let mut state = self.state.lock();
                while state.queue.peek().is_some_and(|t| t.grant.is_closed()) {
                    state.queue.pop();
                }
                if state.queue.is_empty() {
                    state.dispatcher_running = false;
                    crate::metrics::set_rate_limit_queue_depth(&self.name, 0);
                    return;
                }

                let admission = self.config.check(&mut state.usage, now);
                if admission.allowed {
                    let before = state.usage.clone();
                    let granted = match state.queue.pop() {
                        Some(ticket) => {
                            state.usage.record(now);
                            if ticket.grant.send(()).is_err() {
                                // Caller left between the peek and the send
                                state.usage = before;
                                false
                            } else {
                                true
                            }
                        }
                        None => false,
                    };
                    crate::metrics::set_rate_limit_queue_depth(&self.name, state.queue.len());
                    DispatchStep::Granted(granted)
                } else {
                    DispatchStep::Wait(admission.wait.max(Duration::from_millis(1)))
                }
            };

            match step {
                DispatchStep::Granted(true) => self.persist().await,
                DispatchStep::Granted(false) => {}
                DispatchStep::Wait(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Run `op` under admission control.
    ///
    /// Quota-style failures (`QuotaExceeded` from the upstream) are retried
    /// with exponential backoff up to `max_quota_retries` times, each retry
    /// re-entering admission. Other errors propagate unchanged. A cancelled
    /// call is not counted as an error.
    pub async fn execute<F, Fut, T>(self: &Arc<Self>, priority: i32, op: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let retry = self.config.quota_retry();
        let op = Mutex::new(op);
        let op = &op;

        retry_if(&self.name, &retry, CallError::is_quota_exceeded, move || async move {
            self.acquire(priority).await?;

            let attempt = (&mut *op.lock())();
            match attempt.await {
                Err(CallError::Cancelled) => Err(CallError::Cancelled),
                Err(err) => {
                    self.record_error().await;
                    if err.is_quota_exceeded() {
                        crate::metrics::record_quota_retry(&self.name);
                    }
                    Err(err)
                }
                ok => ok,
            }
        })
        .await
    }

    /// [`execute`](Self::execute) that gives up when `token` is cancelled.
    pub async fn execute_cancellable<F, Fut, T>(
        self: &Arc<Self>,
        token: &CancellationToken,
        priority: i32,
        op: F,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CallError::Cancelled),
            result = self.execute(priority, op) => result,
        }
    }
}

enum DispatchStep {
    Granted(bool),
    Wait(Duration),
}
