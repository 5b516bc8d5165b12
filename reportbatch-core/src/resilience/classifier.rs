//! Failure classification.
//!
//! [`classify`] is a total function from [`FetchError`] to [`FailureKind`]:
//! every failure path yields exactly one kind, and each kind carries a fixed
//! retry ceiling and base backoff.

use crate::ports::FetchError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Failure kinds with their fixed policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    ApiError,
    Timeout,
    EmptyReport,
    ProcessingError,
    RateLimit,
    Authentication,
}

impl FailureKind {
    pub const ALL: [FailureKind; 6] = [
        FailureKind::ApiError,
        FailureKind::Timeout,
        FailureKind::EmptyReport,
        FailureKind::ProcessingError,
        FailureKind::RateLimit,
        FailureKind::Authentication,
    ];

    /// Attempts allowed before a record is abandoned.
    pub fn max_attempts(self) -> u32 {
        match self {
            FailureKind::ApiError => 5,
            FailureKind::Timeout => 3,
            FailureKind::EmptyReport => 2,
            FailureKind::ProcessingError => 2,
            FailureKind::RateLimit => 10,
            FailureKind::Authentication => 1,
        }
    }

    pub fn base_backoff(self) -> Duration {
        let secs = match self {
            FailureKind::ApiError => 60,
            FailureKind::Timeout => 30,
            FailureKind::EmptyReport => 120,
            FailureKind::ProcessingError => 180,
            FailureKind::RateLimit => 300,
            FailureKind::Authentication => 600,
        };
        Duration::from_secs(secs)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::ApiError => "API_ERROR",
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::EmptyReport => "EMPTY_REPORT",
            FailureKind::ProcessingError => "PROCESSING_ERROR",
            FailureKind::RateLimit => "RATE_LIMIT",
            FailureKind::Authentication => "AUTHENTICATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Coarse error taxonomy used for logging and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeout, refused or reset connection.
    NetworkFailure,
    /// HTTP 5xx.
    ServerFailure,
    /// HTTP 4xx other than rate limit and auth.
    ClientFailure,
    RateLimited,
    /// HTTP 401/403.
    AuthFailure,
    EmptyResult,
    /// Parse or processing error, including failure to write the artifact.
    MalformedResult,
    /// The failure store itself could not persist.
    StorageFailure,
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::Status {
                status: 401 | 403, ..
            } => ErrorClass::AuthFailure,
            FetchError::Status { status: 429, .. } | FetchError::RateLimited { .. } => {
                ErrorClass::RateLimited
            }
            FetchError::Status { status, .. } if *status >= 500 => ErrorClass::ServerFailure,
            FetchError::Status { .. } => ErrorClass::ClientFailure,
            FetchError::Timeout { .. } | FetchError::Connection { .. } => {
                ErrorClass::NetworkFailure
            }
            FetchError::Empty { .. } => ErrorClass::EmptyResult,
            FetchError::Malformed { .. } | FetchError::Output { .. } | FetchError::Other { .. } => {
                ErrorClass::MalformedResult
            }
        }
    }
}

/// Map a fetch failure to its kind, in priority order:
/// auth, rate limit, timeout, server error, empty payload, anything else.
///
/// Refused or reset connections count as `ApiError`. HTTP 408 counts as a
/// timeout. All remaining 4xx statuses are `ProcessingError`.
pub fn classify(err: &FetchError) -> FailureKind {
    match err {
        FetchError::Status {
            status: 401 | 403, ..
        } => FailureKind::Authentication,
        FetchError::Status { status: 429, .. } | FetchError::RateLimited { .. } => {
            FailureKind::RateLimit
        }
        FetchError::Timeout { .. } | FetchError::Status { status: 408, .. } => FailureKind::Timeout,
        FetchError::Status { status, .. } if (500..600).contains(status) => FailureKind::ApiError,
        FetchError::Connection { .. } => FailureKind::ApiError,
        FetchError::Empty { .. } => FailureKind::EmptyReport,
        FetchError::Status { .. }
        | FetchError::Malformed { .. }
        | FetchError::Output { .. }
        | FetchError::Other { .. } => FailureKind::ProcessingError,
    }
}
