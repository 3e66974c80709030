// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy shared by every protected call.
//!
//! The rate limiter, circuit breaker, offline-queue handlers and remote store
//! all speak [`CallError`], so they can wrap one another without conversion:
//!
//! - `QuotaExceeded`: admission refused or upstream 429; retry after `wait_ms`
//! - `BreakerOpen`: failing fast; retry after `retry_at_ms`
//! - `Transient`: network-class failure, eligible for the offline queue
//! - `Upstream`: the call ran and failed for a non-retryable reason
//! - `Cancelled`: the caller gave up; counts as neither success nor failure

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("quota exceeded, retry in {wait_ms} ms")]
    QuotaExceeded { wait_ms: u64 },

    #[error("circuit '{circuit}' is open, next attempt at {retry_at_ms}")]
    BreakerOpen { circuit: String, retry_at_ms: i64 },

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("call cancelled")]
    Cancelled,
}

impl CallError {
    /// Build a transient error from anything displayable.
    pub fn transient(msg: impl std::fmt::Display) -> Self {
        Self::Transient(msg.to_string())
    }

    /// Build a non-retryable upstream error from anything displayable.
    pub fn upstream(msg: impl std::fmt::Display) -> Self {
        Self::Upstream(msg.to_string())
    }

    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the operation should be parked in the offline queue and
    /// replayed later instead of surfacing to the caller.
    #[must_use]
    pub fn should_queue_offline(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::BreakerOpen { .. })
    }

    /// Hint for how long a caller should back off, when the error carries one.
    #[must_use]
    pub fn retry_after(&self, now_ms: i64) -> Option<Duration> {
        match self {
            Self::QuotaExceeded { wait_ms } => Some(Duration::from_millis(*wait_ms)),
            Self::BreakerOpen { retry_at_ms, .. } => Some(crate::clock::until(now_ms, *retry_at_ms)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_eligibility() {
        assert!(CallError::transient("timeout").should_queue_offline());
        assert!(CallError::BreakerOpen { circuit: "ai".into(), retry_at_ms: 10 }.should_queue_offline());
        assert!(!CallError::upstream("bad request").should_queue_offline());
        assert!(!CallError::QuotaExceeded { wait_ms: 5 }.should_queue_offline());
        assert!(!CallError::Cancelled.should_queue_offline());
    }

    #[test]
    fn test_retry_after_hints() {
        let quota = CallError::QuotaExceeded { wait_ms: 1_500 };
        assert_eq!(quota.retry_after(0), Some(Duration::from_millis(1_500)));

        let open = CallError::BreakerOpen { circuit: "ai".into(), retry_at_ms: 10_000 };
        assert_eq!(open.retry_after(4_000), Some(Duration::from_secs(6)));
        assert_eq!(open.retry_after(12_000), Some(Duration::ZERO));

        assert_eq!(CallError::transient("x").retry_after(0), None);
    }

    #[test]
    fn test_display_messages() {
        let err = CallError::BreakerOpen { circuit: "gemini".into(), retry_at_ms: 42 };
        assert_eq!(err.to_string(), "circuit 'gemini' is open, next attempt at 42");
        assert_eq!(CallError::Cancelled.to_string(), "call cancelled");
    }
}
