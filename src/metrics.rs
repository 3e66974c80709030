// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for journal-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for installing an exporter.
//!
//! # Metric Naming Convention
//! - `journal_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: memory, durable
//! - `circuit`: breaker name
//! - `outcome`: success, failure, rejected, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache lookup (`outcome` is hit or miss)
pub fn record_cache_lookup(tier: &str, outcome: &str) {
    counter!(
        "journal_sync_cache_lookups_total",
        "tier" => tier.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the number of entries held by the memory tier
pub fn set_cache_memory_entries(count: usize) {
    gauge!("journal_sync_cache_memory_entries").set(count as f64);
}

/// Record entries removed by eviction or expiry sweep
pub fn record_cache_removed(reason: &str, count: usize) {
    counter!(
        "journal_sync_cache_removed_total",
        "reason" => reason.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// RATE LIMITER
// ═══════════════════════════════════════════════════════════════════════════

/// Record an admission decision (`outcome` is admitted, queued or rejected)
pub fn record_admission(limiter: &str, outcome: &str) {
    counter!(
        "journal_sync_rate_limit_admissions_total",
        "limiter" => limiter.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the number of calls waiting for admission
pub fn set_rate_limit_queue_depth(limiter: &str, depth: usize) {
    gauge!(
        "journal_sync_rate_limit_queue_depth",
        "limiter" => limiter.to_string()
    )
    .set(depth as f64);
}

/// Record a quota rejection reported by the upstream of a rate-limited call
pub fn record_quota_retry(limiter: &str) {
    counter!(
        "journal_sync_rate_limit_quota_retries_total",
        "limiter" => limiter.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker state (0 = closed, 1 = half open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "journal_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "journal_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// OFFLINE QUEUE
// ═══════════════════════════════════════════════════════════════════════════

/// Set offline queue depth
pub fn set_offline_queue_depth(queue: &str, depth: usize) {
    gauge!(
        "journal_sync_offline_queue_depth",
        "queue" => queue.to_string()
    )
    .set(depth as f64);
}

/// Record a replay outcome (replayed, failed, permanent_failure, evicted)
pub fn record_offline_outcome(queue: &str, outcome: &str) {
    counter!(
        "journal_sync_offline_queue_outcomes_total",
        "queue" => queue.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC
// ═══════════════════════════════════════════════════════════════════════════

/// Record a finished sync run
pub fn record_sync_run(status: &str, duration: Duration) {
    counter!(
        "journal_sync_sync_runs_total",
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("journal_sync_sync_seconds").record(duration.as_secs_f64());
}

/// Record a last-write-wins decision (`kept` is local or remote)
pub fn record_conflict_resolved(kept: &str) {
    counter!(
        "journal_sync_conflicts_resolved_total",
        "kept" => kept.to_string()
    )
    .increment(1);
}

/// Set the number of pending local changes
pub fn set_pending_changes(count: usize) {
    gauge!("journal_sync_pending_changes").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// STORAGE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a durable store error
pub fn record_storage_error(operation: &str) {
    counter!(
        "journal_sync_storage_errors_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "journal_sync_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder is installed; these only check the calls are well-formed.

    #[test]
    fn test_cache_metrics() {
        record_cache_lookup("memory", "hit");
        record_cache_lookup("durable", "miss");
        set_cache_memory_entries(12);
        record_cache_removed("expired", 3);
    }

    #[test]
    fn test_resilience_metrics() {
        record_admission("ai", "queued");
        set_rate_limit_queue_depth("ai", 4);
        record_quota_retry("ai");
        set_circuit_state("ai", 2);
        record_circuit_call("ai", "rejected");
    }

    #[test]
    fn test_queue_and_sync_metrics() {
        set_offline_queue_depth("default", 7);
        record_offline_outcome("default", "permanent_failure");
        record_sync_run("synced", Duration::from_millis(120));
        record_conflict_resolved("remote");
        set_pending_changes(2);
        record_storage_error("set");
    }

    #[test]
    fn test_latency_timer_records_on_drop() {
        let timer = LatencyTimer::new("cache", "get");
        drop(timer);
    }
}
