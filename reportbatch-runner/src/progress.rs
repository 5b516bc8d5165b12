//! Per-portfolio progress events.

use crate::stats::{PortfolioOutcome, RunStatistics};

/// Progress callback for batch runs. Called from worker threads.
pub trait RunProgress: Send + Sync {
    /// Called before a portfolio's first call.
    fn on_start(&self, portfolio_id: &str, index: usize, total: usize);

    /// Called once a portfolio's outcome is final.
    fn on_complete(&self, portfolio_id: &str, index: usize, total: usize, outcome: &PortfolioOutcome);

    /// Called when the entire batch is done.
    fn on_batch_complete(&self, stats: &RunStatistics);
}

/// Emits progress as `tracing` events.
pub struct LogProgress;

impl RunProgress for LogProgress {
    fn on_start(&self, portfolio_id: &str, index: usize, total: usize) {
        tracing::debug!(portfolio_id, position = index + 1, total, "fetching");
    }

    fn on_complete(&self, portfolio_id: &str, index: usize, total: usize, outcome: &PortfolioOutcome) {
        let position = index + 1;
        match outcome {
            PortfolioOutcome::Succeeded { output, attempts } => tracing::info!(
                portfolio_id,
                position,
                total,
                attempts,
                path = %output.path.display(),
                "OK"
            ),
            PortfolioOutcome::Failed { kind, message, attempts } => tracing::warn!(
                portfolio_id,
                position,
                total,
                attempts,
                kind = %kind,
                error = %message,
                "FAIL"
            ),
            PortfolioOutcome::Abandoned { kind, message, attempts } => tracing::warn!(
                portfolio_id,
                position,
                total,
                attempts,
                kind = %kind,
                error = %message,
                "ABANDONED"
            ),
            PortfolioOutcome::CircuitTripped => {
                tracing::warn!(portfolio_id, position, total, "SKIPPED: circuit open")
            }
            PortfolioOutcome::NotStarted => {
                tracing::debug!(portfolio_id, position, total, "not started: run cancelled")
            }
        }
    }

    fn on_batch_complete(&self, stats: &RunStatistics) {
        tracing::info!("{}", stats.summary_line());
    }
}

/// Discards all progress events.
pub struct NoProgress;

impl RunProgress for NoProgress {
    fn on_start(&self, _portfolio_id: &str, _index: usize, _total: usize) {}

    fn on_complete(&self, _portfolio_id: &str, _index: usize, _total: usize, _outcome: &PortfolioOutcome) {}

    fn on_batch_complete(&self, _stats: &RunStatistics) {}
}
