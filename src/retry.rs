//! Retry policy for transient fulfillment failures
//!
//! Exponential backoff with a cap and a bounded number of attempts. Decisions are
//! made on the typed [`TransientKind`] reported by the engine.

use std::time::Duration;
use tracing::debug;

use crate::engine::TransientKind;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Transient attempts allowed before a deposit is marked failed
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if another attempt is allowed after `attempts` transient failures
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Decide what to do after the `attempts`-th transient failure
    pub fn decide(&self, attempts: u32, kind: TransientKind) -> RetryAction {
        if !self.should_retry(attempts) {
            return RetryAction::GiveUp;
        }
        let backoff = match kind {
            // A fresh nonce usually fixes this; no need to wait long
            TransientKind::OrderingConflict => self.initial_backoff,
            TransientKind::Unavailable | TransientKind::Timeout => {
                self.backoff_for_attempt(attempts.saturating_sub(1))
            }
        };
        debug!(?backoff, attempts, ?kind, "Scheduling fulfillment retry");
        RetryAction::RetryAfter {
            backoff,
            refresh_ordering: kind == TransientKind::OrderingConflict,
        }
    }
}

/// Action to take after a transient failure
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    /// Retry after a backoff period, optionally refreshing submission ordering
    RetryAfter {
        backoff: Duration,
        refresh_ordering: bool,
    },
    /// Attempts exhausted; escalate to the operator
    GiveUp,
}
