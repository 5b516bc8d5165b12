//! One outstanding failure for one portfolio.

use crate::domain::{Endpoint, RequestParams};
use crate::resilience::{FailureKind, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Latest failure state of a portfolio. At most one exists per portfolio id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub portfolio_id: String,
    pub portfolio_name: String,
    pub failure_kind: FailureKind,
    /// Last error message.
    pub message: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    /// Always at least 1.
    pub attempt_count: u32,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub request_params: RequestParams,
    pub abandoned: bool,
}

impl FailureRecord {
    /// Earliest time this record may be retried.
    pub fn retry_at(&self, policy: &RetryPolicy) -> DateTime<Utc> {
        let wait = policy.backoff(self.failure_kind, self.attempt_count);
        chrono::Duration::from_std(wait)
            .ok()
            .and_then(|wait| self.last_attempt_at.checked_add_signed(wait))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_eligible(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
        !self.abandoned && self.retry_at(policy) <= now
    }

    /// Time since the first failure.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.first_seen_at).to_std().unwrap_or(Duration::ZERO)
    }
}
