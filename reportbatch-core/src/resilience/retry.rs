//! Cross-run retry policy: per-kind exponential backoff with an optional cap.

use super::classifier::FailureKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default ceiling on any single backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// `None` disables the cap.
    pub max_backoff: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_backoff: Some(DEFAULT_MAX_BACKOFF),
        }
    }
}

impl RetryPolicy {
    pub fn uncapped() -> Self {
        Self { max_backoff: None }
    }

    pub fn capped(max_backoff: Duration) -> Self {
        Self {
            max_backoff: Some(max_backoff),
        }
    }

    /// `base_backoff(kind) * 2^(attempt_count - 1)`, saturating, then capped.
    ///
    /// An `attempt_count` of zero is treated as one.
    pub fn backoff(&self, kind: FailureKind, attempt_count: u32) -> Duration {
        let exponent = attempt_count.max(1) - 1;
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let secs = kind.base_backoff().as_secs().saturating_mul(factor);
        let raw = Duration::from_secs(secs);
        match self.max_backoff {
            Some(cap) => raw.min(cap),
            None => raw,
        }
    }

    /// Whether a record with `attempt_count` failures of `kind` is past its ceiling.
    pub fn is_abandoned(kind: FailureKind, attempt_count: u32) -> bool {
        attempt_count > kind.max_attempts()
    }
}
