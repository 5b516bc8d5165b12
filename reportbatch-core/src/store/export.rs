//! Tabular failure report: one CSV row per record.

use super::failure_store::StoreError;
use super::record::FailureRecord;
use crate::resilience::RetryPolicy;
use chrono::{DateTime, Utc};
use std::path::Path;

const HEADER: [&str; 14] = [
    "portfolio_id",
    "portfolio_name",
    "failure_kind",
    "message",
    "first_seen_at",
    "last_attempt_at",
    "attempt_count",
    "endpoint",
    "request_params",
    "abandoned",
    "age_minutes",
    "eligible",
    "retry_delay_secs",
    "retry_at",
];

/// Write `records` to `path` as CSV. Returns the number of rows written.
pub fn export_csv(
    records: &[FailureRecord],
    policy: &RetryPolicy,
    now: DateTime<Utc>,
    path: &Path,
) -> Result<usize, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(HEADER)?;

    for r in records {
        let params = serde_json::to_string(&r.request_params)?;
        let delay = policy.backoff(r.failure_kind, r.attempt_count);
        wtr.write_record([
            r.portfolio_id.clone(),
            r.portfolio_name.clone(),
            r.failure_kind.to_string(),
            r.message.clone(),
            r.first_seen_at.to_rfc3339(),
            r.last_attempt_at.to_rfc3339(),
            r.attempt_count.to_string(),
            r.endpoint.to_string(),
            params,
            r.abandoned.to_string(),
            (r.age(now).as_secs() / 60).to_string(),
            r.is_eligible(policy, now).to_string(),
            delay.as_secs().to_string(),
            r.retry_at(policy).to_rfc3339(),
        ])?;
    }

    wtr.flush().map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(path = %path.display(), rows = records.len(), "failure report exported");
    Ok(records.len())
}
