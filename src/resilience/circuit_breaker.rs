// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker for a single protected operation.
//!
//! Provides protection against amplifying failures when an upstream (the AI
//! service, the remote store) is unhealthy. Wraps async operations, tracks
//! failures inside a sliding monitoring window and trips the breaker when
//! the threshold is reached.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Upstream unhealthy, requests fail fast with [`CallError::BreakerOpen`]
//! - HalfOpen: Testing recovery, one probe request in flight at a time
//!
//! Legal transitions are `Closed → Open`, `Open → HalfOpen` (once
//! `next_attempt_at` has elapsed), `HalfOpen → Closed` (after
//! `success_threshold` consecutive successes) and `HalfOpen → Open` (on any
//! failure). [`CircuitBreaker::reset`] is the operator override.
//!
//! A call that finishes after the state it was admitted under has changed
//! still counts in the call metrics, but does not move the state machine.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::CallError;

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failures inside the monitoring window that trip the circuit
    pub failure_threshold: u32,
    /// Consecutive successes in half-open that close the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before a probe is allowed
    pub recovery_timeout: Duration,
    /// Failures older than this no longer count toward the threshold
    pub monitoring_window: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    /// Aggressive config for quota-limited upstreams (trips faster, recovers cautiously)
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(120),
        }
    }

    /// Lenient config for less critical paths (tolerates more failures)
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
            monitoring_window: Duration::from_secs(60),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
            monitoring_window: Duration::from_secs(60),
        }
    }
}

/// A state change, delivered to the transition hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    pub circuit: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at_ms: i64,
}

/// Observer for state transitions. Informational only.
pub type TransitionHook = Arc<dyn Fn(&CircuitTransition) + Send + Sync>;

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<i64>,
    pub next_attempt_at: Option<i64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Failure instants inside the monitoring window (Closed only)
    failures: VecDeque<i64>,
    success_count: u32,
    last_failure_at: Option<i64>,
    next_attempt_at: Option<i64>,
    probe_in_flight: bool,
    /// Bumped on every state change; outcomes admitted under an older
    /// value no longer apply
    generation: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            success_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            probe_in_flight: false,
            generation: 0,
        }
    }

    fn enter(&mut self, state: CircuitState) {
        self.state = state;
        self.generation += 1;
    }

    fn prune(&mut self, now: i64, window: Duration) {
        let cutoff = now - window.as_millis() as i64;
        while self.failures.front().is_some_and(|&at| at < cutoff) {
            self.failures.pop_front();
        }
    }
}

/// What `admit` granted: the state generation and whether the call holds
/// the half-open probe slot.
#[derive(Debug, Clone, Copy)]
struct Admitted {
    generation: u64,
    probe: bool,
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
    on_transition: Option<TransitionHook>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: SharedClock) -> Self {
        let name = name.into();
        crate::metrics::set_circuit_state(&name, CircuitState::Closed as u8);
        Self {
            name,
            config,
            clock,
            inner: Mutex::new(BreakerInner::new()),
            on_transition: None,
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Attach a transition observer.
    #[must_use]
    pub fn with_transition_hook(mut self, hook: TransitionHook) -> Self {
        self.on_transition = Some(hook);
        self
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Get current circuit state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.prune(now, self.config.monitoring_window);
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            next_attempt_at: inner.next_attempt_at,
        }
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure that returns a Future, so nothing runs when the
    /// breaker rejects the call. Errors from the operation propagate
    /// unchanged; `Cancelled` is not counted as a failure.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let admitted = match self.admit() {
            Ok(admitted) => admitted,
            Err(err) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                return Err(err);
            }
        };

        // Releases the half-open probe slot if the caller drops this future
        let mut probe = ProbeSlot {
            breaker: self,
            admitted,
            armed: admitted.probe,
        };

        let result = f().await;
        probe.armed = false;

        match &result {
            Ok(_) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call succeeded");
                crate::metrics::record_circuit_call(&self.name, "success");
                self.on_success(admitted);
            }
            Err(CallError::Cancelled) => {
                debug!(circuit = %self.name, "Circuit call cancelled");
                self.release_probe(admitted);
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, error = %e, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                self.on_failure(admitted);
            }
        }

        result
    }

    /// Force the breaker back to `Closed`, clearing all counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            let generation = inner.generation + 1;
            *inner = BreakerInner::new();
            inner.generation = generation;
            (from != CircuitState::Closed).then_some(from)
        };
        info!(circuit = %self.name, "Circuit breaker reset");
        if let Some(from) = transition {
            self.emit(from, CircuitState::Closed, self.clock.now_ms());
        }
    }

    fn admit(&self) -> Result<Admitted, CallError> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(Admitted {
                generation: inner.generation,
                probe: false,
            }),
            CircuitState::Open => {
                let next_attempt_at = inner.next_attempt_at.unwrap_or(now);
                if now < next_attempt_at {
                    return Err(self.open_error(next_attempt_at));
                }
                inner.enter(CircuitState::HalfOpen);
                inner.success_count = 0;
                inner.probe_in_flight = true;
                let admitted = Admitted {
                    generation: inner.generation,
                    probe: true,
                };
                drop(inner);
                self.emit(CircuitState::Open, CircuitState::HalfOpen, now);
                Ok(admitted)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.open_error(now));
                }
                inner.probe_in_flight = true;
                Ok(Admitted {
                    generation: inner.generation,
                    probe: true,
                })
            }
        }
    }

    fn on_success(&self, admitted: Admitted) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        if inner.generation != admitted.generation {
            debug!(circuit = %self.name, state = %inner.state, "Ignoring success of a call admitted before the last transition");
            return;
        }
        if admitted.probe {
            inner.probe_in_flight = false;
        }

        match inner.state {
            CircuitState::Closed => inner.failures.clear(),
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.enter(CircuitState::Closed);
                    inner.success_count = 0;
                    inner.failures.clear();
                    inner.next_attempt_at = None;
                    drop(inner);
                    self.emit(CircuitState::HalfOpen, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, admitted: Admitted) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(now);
        if inner.generation != admitted.generation {
            debug!(circuit = %self.name, state = %inner.state, "Ignoring failure of a call admitted before the last transition");
            return;
        }
        if admitted.probe {
            inner.probe_in_flight = false;
        }

        let from = match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                inner.prune(now, self.config.monitoring_window);
                if inner.failures.len() < self.config.failure_threshold as usize {
                    return;
                }
                CircuitState::Closed
            }
            CircuitState::HalfOpen => CircuitState::HalfOpen,
            CircuitState::Open => return,
        };

        let next_attempt_at = now + self.config.recovery_timeout.as_millis() as i64;
        inner.enter(CircuitState::Open);
        inner.success_count = 0;
        inner.failures.clear();
        inner.next_attempt_at = Some(next_attempt_at);
        drop(inner);

        warn!(
            circuit = %self.name,
            next_attempt_at,
            "Circuit breaker opened"
        );
        self.emit(from, CircuitState::Open, now);
    }

    fn release_probe(&self, admitted: Admitted) {
        let mut inner = self.inner.lock();
        if admitted.probe && inner.generation == admitted.generation {
            inner.probe_in_flight = false;
        }
    }

    fn open_error(&self, retry_at_ms: i64) -> CallError {
        CallError::BreakerOpen {
            circuit: self.name.clone(),
            retry_at_ms,
        }
    }

    fn emit(&self, from: CircuitState, to: CircuitState, at_ms: i64) {
        info!(circuit = %self.name, %from, %to, "Circuit state transition");
        crate::metrics::set_circuit_state(&self.name, to as u8);
        if let Some(hook) = &self.on_transition {
            hook(&CircuitTransition {
                circuit: self.name.clone(),
                from,
                to,
                at_ms,
            });
        }
    }

    /// Get total number of calls
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }

    /// Reset all metrics
    pub fn reset_metrics(&self) {
        self.calls_total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }
}

struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    admitted: Admitted,
    armed: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe(self.admitted);
        }
    }
}

/// One breaker per protected resource, created on first use.
pub struct CircuitRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitConfig,
    clock: SharedClock,
    on_transition: Option<TransitionHook>,
}

impl CircuitRegistry {
    pub fn new(default_config: CircuitConfig, clock: SharedClock) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            clock,
            on_transition: None,
        }
    }

    /// Hook attached to every breaker created from now on.
    #[must_use]
    pub fn with_transition_hook(mut self, hook: TransitionHook) -> Self {
        self.on_transition = Some(hook);
        self
    }

    /// The breaker for `name`, created with the default config if absent.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, || self.default_config.clone())
    }

    /// The breaker for `name`, created with `config()` if absent.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: impl FnOnce() -> CircuitConfig,
    ) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let mut breaker = CircuitBreaker::new(name, config(), self.clock.clone());
                if let Some(hook) = &self.on_transition {
                    breaker = breaker.with_transition_hook(hook.clone());
                }
                Arc::new(breaker)
            })
            .clone()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Snapshot of every registered breaker, sorted by name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<(String, CircuitSnapshot)> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
