//! Run statistics: the externally visible completion signal of a batch.

use chrono::{DateTime, NaiveDate, Utc};
use reportbatch_core::{Endpoint, FailureKind, ReportFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Every configured portfolio.
    FullBatch,
    /// Only failure records that are past their backoff.
    RetryFailuresOnly,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::FullBatch => write!(f, "full_batch"),
            RunMode::RetryFailuresOnly => write!(f, "retry_failures_only"),
        }
    }
}

/// One artifact written during a run, in work-list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessfulOutput {
    pub portfolio_id: String,
    pub portfolio_name: String,
    /// Empty in manifests written before endpoints were recorded.
    #[serde(default)]
    pub endpoint: Endpoint,
    pub reference_date: NaiveDate,
    pub format: ReportFormat,
    pub path: PathBuf,
    pub bytes: usize,
}

/// Final outcome of one portfolio within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PortfolioOutcome {
    Succeeded { output: SuccessfulOutput, attempts: u32 },
    Failed { kind: FailureKind, message: String, attempts: u32 },
    Abandoned { kind: FailureKind, message: String, attempts: u32 },
    /// Circuit open; no call issued and no record touched.
    CircuitTripped,
    /// Cancelled before any call.
    NotStarted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub mode: RunMode,
    pub succeeded: usize,
    pub failed: usize,
    pub circuit_tripped: usize,
    pub abandoned: usize,
    /// Portfolios skipped because the run was cancelled.
    pub not_started: usize,
    pub failures_by_kind: BTreeMap<FailureKind, usize>,
    pub successes: Vec<SuccessfulOutput>,
    /// Some failure-store change exists only in memory.
    pub storage_degraded: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunStatistics {
    pub fn new(mode: RunMode, started_at: DateTime<Utc>) -> Self {
        Self {
            mode,
            succeeded: 0,
            failed: 0,
            circuit_tripped: 0,
            abandoned: 0,
            not_started: 0,
            failures_by_kind: BTreeMap::new(),
            successes: Vec::new(),
            storage_degraded: false,
            cancelled: false,
            started_at,
            finished_at: started_at,
        }
    }

    /// Fold one portfolio outcome into the tallies.
    pub fn record(&mut self, outcome: PortfolioOutcome) {
        match outcome {
            PortfolioOutcome::Succeeded { output, .. } => {
                self.succeeded += 1;
                self.successes.push(output);
            }
            PortfolioOutcome::Failed { kind, .. } => {
                self.failed += 1;
                *self.failures_by_kind.entry(kind).or_insert(0) += 1;
            }
            PortfolioOutcome::Abandoned { kind, .. } => {
                self.abandoned += 1;
                *self.failures_by_kind.entry(kind).or_insert(0) += 1;
            }
            PortfolioOutcome::CircuitTripped => self.circuit_tripped += 1,
            PortfolioOutcome::NotStarted => self.not_started += 1,
        }
    }

    /// Portfolios the run reached: succeeded, failed, abandoned or circuit-tripped.
    pub fn total_attempted(&self) -> usize {
        self.succeeded + self.failed + self.abandoned + self.circuit_tripped
    }

    /// `succeeded / total_attempted`, or 0.0 when nothing was attempted.
    pub fn success_rate(&self) -> f64 {
        match self.total_attempted() {
            0 => 0.0,
            total => self.succeeded as f64 / total as f64,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.total_attempted() == self.succeeded && self.not_started == 0
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{}: {} succeeded, {} failed, {} circuit-tripped, {} abandoned, {} not started ({:.1}% success)",
            self.mode,
            self.succeeded,
            self.failed,
            self.circuit_tripped,
            self.abandoned,
            self.not_started,
            self.success_rate() * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn output(id: &str) -> SuccessfulOutput {
        SuccessfulOutput {
            portfolio_id: id.into(),
            portfolio_name: format!("Fund {id}"),
            endpoint: Endpoint::new("1048"),
            reference_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            format: ReportFormat::CsvBr,
            path: PathBuf::from(format!("{id}.csv")),
            bytes: 10,
        }
    }

    #[test]
    fn empty_run_has_zero_rate() {
        let stats = RunStatistics::new(RunMode::FullBatch, Utc.timestamp_opt(0, 0).unwrap());
        assert_eq!(stats.total_attempted(), 0);
        assert_eq!(stats.success_rate(), 0.0);
    }

    #[test]
    fn tallies_each_outcome_once() {
        let mut stats = RunStatistics::new(RunMode::FullBatch, Utc.timestamp_opt(0, 0).unwrap());
        for i in 0..8 {
            stats.record(PortfolioOutcome::Succeeded {
                output: output(&i.to_string()),
                attempts: 1,
            });
        }
        stats.record(PortfolioOutcome::Failed {
            kind: FailureKind::ApiError,
            message: "HTTP 500".into(),
            attempts: 1,
        });
        stats.record(PortfolioOutcome::Abandoned {
            kind: FailureKind::ApiError,
            message: "HTTP 500".into(),
            attempts: 1,
        });
        stats.record(PortfolioOutcome::NotStarted);

        assert_eq!(stats.total_attempted(), 10);
        assert!((stats.success_rate() - 0.8).abs() < 1e-12);
        assert_eq!(stats.failures_by_kind[&FailureKind::ApiError], 2);
        assert_eq!(stats.successes.len(), 8);
        assert!(!stats.all_succeeded());
        assert!(stats.summary_line().contains("80.0% success"));
    }
}
