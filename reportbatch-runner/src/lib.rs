//! reportbatch runner: resilient batch orchestration over `reportbatch-core`.
//!
//! This crate provides:
//! - The batch orchestrator (full batch and retry-failures-only runs)
//! - Run statistics and per-portfolio progress callbacks
//! - Cooperative cancellation and a bounded worker pool
//! - Consolidation of a run's successful artifacts, with per-endpoint row
//!   normalization
//! - TOML engine configuration

pub mod cancel;
pub mod config;
pub mod consolidation;
pub mod normalize;
pub mod orchestrator;
pub mod progress;
pub mod stats;

pub use cancel::CancelToken;
pub use config::{ConfigError, EngineConfig, MAX_WORKERS};
pub use consolidation::{
    consolidate, consolidate_each_format, sidecar_path, ConsolidationError, ConsolidationSummary,
};
pub use orchestrator::{Orchestrator, OrchestratorParts, RunError};
pub use progress::{LogProgress, NoProgress, RunProgress};
pub use stats::{PortfolioOutcome, RunMode, RunStatistics, SuccessfulOutput};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn orchestrator_is_send_sync() {
        assert_send::<Orchestrator>();
        assert_sync::<Orchestrator>();
    }

    #[test]
    fn run_statistics_is_send_sync() {
        assert_send::<RunStatistics>();
        assert_sync::<RunStatistics>();
        assert_send::<ConsolidationSummary>();
    }

    #[test]
    fn cancel_token_is_send_sync() {
        assert_send::<CancelToken>();
        assert_sync::<CancelToken>();
    }
}
