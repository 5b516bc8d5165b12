//! Batch orchestrator: drives a portfolio work list through the report client.
//!
//! For each portfolio, in work-list order:
//! 1. Skip it (`circuit_tripped`) if its circuit is open. Its failure record
//!    is left untouched.
//! 2. Up to `attempts_per_run` times: wait on the rate limiter, fetch, reject
//!    empty payloads, write the artifact. Between attempts the worker sleeps a
//!    jittered exponential delay. Every failed attempt is fed to the circuit
//!    breaker; an authentication failure or an opened circuit ends the loop.
//! 3. On success remove the failure record. Otherwise classify the last error
//!    and upsert the failure record once; an abandoned record tallies as
//!    `abandoned`, anything else as `failed`.
//!
//! No fetch failure escapes a portfolio. Failure-store write errors are
//! logged and the run continues on the store's in-memory state.

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::progress::{NoProgress, RunProgress};
use crate::stats::{PortfolioOutcome, RunMode, RunStatistics, SuccessfulOutput};
use chrono::NaiveDate;
use rand::Rng;
use rayon::prelude::*;
use reportbatch_core::domain::{date_from_params, format_from_params};
use reportbatch_core::resilience::ErrorClass;
use reportbatch_core::store::StoreError;
use reportbatch_core::{
    classify, CircuitBoard, CircuitState, Clock, Endpoint, FailureKind, FailureStats,
    FailureStore, FetchError, OutputWriter, Portfolio, RateLimiter, ReportClient, ReportFormat,
    ReportRequest, RequestParams,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failure store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Everything the orchestrator needs, injected by the caller.
pub struct OrchestratorParts {
    pub client: Arc<dyn ReportClient>,
    pub writer: Arc<dyn OutputWriter>,
    pub store: Arc<FailureStore>,
    pub limiter: Arc<RateLimiter>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
}

/// One unit of work: a portfolio plus the exact call to make for it.
#[derive(Debug, Clone)]
struct WorkItem {
    portfolio: Portfolio,
    endpoint: Endpoint,
    params: RequestParams,
    format: ReportFormat,
    reference_date: NaiveDate,
}

impl WorkItem {
    fn from_request(portfolio: Portfolio, request: &ReportRequest) -> Self {
        Self {
            params: request.params_for(&portfolio),
            portfolio,
            endpoint: request.endpoint.clone(),
            format: request.format,
            reference_date: request.reference_date,
        }
    }
}

pub struct Orchestrator {
    client: Arc<dyn ReportClient>,
    writer: Arc<dyn OutputWriter>,
    store: Arc<FailureStore>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    circuits: CircuitBoard,
    progress: Arc<dyn RunProgress>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        let circuits = CircuitBoard::new(parts.config.circuit_breaker_config());
        Self {
            client: parts.client,
            writer: parts.writer,
            store: parts.store,
            limiter: parts.limiter,
            clock: parts.clock,
            config: parts.config,
            circuits,
            progress: Arc::new(NoProgress),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn RunProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Circuit breakers for this orchestrator's lifetime.
    pub fn circuits(&self) -> &CircuitBoard {
        &self.circuits
    }

    pub fn store(&self) -> &FailureStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a batch.
    ///
    /// `portfolios` is the configured catalog. In retry mode it only orders
    /// the eligible records, and `request` only fills in a format or date
    /// missing from a record's stored parameters.
    ///
    /// Circuit breakers belong to the orchestrator, not the run: consecutive
    /// failures carry over between runs of one instance, and a circuit opened
    /// in one run still skips the portfolio in the next. Set
    /// `circuit_breaker.reset_per_run` to start every run with closed
    /// circuits instead.
    pub fn run(
        &self,
        portfolios: &[Portfolio],
        request: &ReportRequest,
        mode: RunMode,
    ) -> Result<RunStatistics, RunError> {
        let items = match mode {
            RunMode::FullBatch => dedup(portfolios)
                .into_iter()
                .map(|p| WorkItem::from_request(p, request))
                .collect(),
            RunMode::RetryFailuresOnly => self.retry_work_list(portfolios, request),
        };
        self.execute(items, mode)
    }

    /// Retry eligible failures. Shorthand for [`RunMode::RetryFailuresOnly`].
    pub fn retry(
        &self,
        portfolios: &[Portfolio],
        fallback: &ReportRequest,
    ) -> Result<RunStatistics, RunError> {
        self.run(portfolios, fallback, RunMode::RetryFailuresOnly)
    }

    /// Retry at most `max` eligible failures, taken from the front of the
    /// retry work list. The rest stay eligible for a later run.
    pub fn retry_at_most(
        &self,
        portfolios: &[Portfolio],
        fallback: &ReportRequest,
        max: usize,
    ) -> Result<RunStatistics, RunError> {
        let mut items = self.retry_work_list(portfolios, fallback);
        if items.len() > max {
            tracing::info!(eligible = items.len(), max, "capping retry batch");
            items.truncate(max);
        }
        self.execute(items, RunMode::RetryFailuresOnly)
    }

    fn execute(&self, items: Vec<WorkItem>, mode: RunMode) -> Result<RunStatistics, RunError> {
        if self.config.circuit_breaker.reset_per_run {
            self.circuits.reset();
        }
        let mut stats = RunStatistics::new(mode, self.clock.now());
        let total = items.len();
        let workers = self.config.workers();
        tracing::info!(%mode, portfolios = total, workers, client = self.client.name(), "starting batch");

        let outcomes: Vec<PortfolioOutcome> = if workers > 1 && total > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()?;
            pool.install(|| {
                items
                    .par_iter()
                    .enumerate()
                    .map(|(index, item)| self.process(item, index, total))
                    .collect()
            })
        } else {
            items
                .iter()
                .enumerate()
                .map(|(index, item)| self.process(item, index, total))
                .collect()
        };

        for outcome in outcomes {
            stats.record(outcome);
        }
        stats.cancelled = self.cancel.is_cancelled();
        stats.storage_degraded = self.reconcile_store();
        stats.finished_at = self.clock.now();

        self.progress.on_batch_complete(&stats);
        if stats.storage_degraded {
            tracing::warn!(
                "WARNING: failure store could not be written; {} failure record(s) exist only in memory and will be lost on exit",
                self.store.len()
            );
        }
        Ok(stats)
    }

    pub fn stats(&self) -> FailureStats {
        self.store.stats(self.clock.now())
    }

    /// Remove failure records whose last attempt is older than `hours`.
    pub fn purge(&self, hours: u64) -> Result<usize, RunError> {
        Ok(self.store.purge_older_than(hours)?)
    }

    pub fn purge_abandoned(&self) -> Result<usize, RunError> {
        Ok(self.store.purge_abandoned()?)
    }

    /// Eligible records in catalog order, then records for portfolios no
    /// longer in the catalog, in eligibility order.
    fn retry_work_list(&self, portfolios: &[Portfolio], fallback: &ReportRequest) -> Vec<WorkItem> {
        let mut eligible = self.store.eligible_for_retry(self.clock.now());
        let mut items = Vec::with_capacity(eligible.len());

        for portfolio in dedup(portfolios) {
            if let Some(pos) = eligible.iter().position(|r| r.portfolio_id == portfolio.id) {
                let record = eligible.remove(pos);
                items.push(replay(portfolio, record.endpoint, record.request_params, fallback));
            }
        }
        for record in eligible {
            match Portfolio::new(&record.portfolio_id, &record.portfolio_name) {
                Ok(portfolio) => {
                    items.push(replay(portfolio, record.endpoint, record.request_params, fallback))
                }
                Err(e) => tracing::warn!(
                    portfolio_id = %record.portfolio_id,
                    error = %e,
                    "skipping unreplayable failure record"
                ),
            }
        }
        items
    }

    fn process(&self, item: &WorkItem, index: usize, total: usize) -> PortfolioOutcome {
        let id = item.portfolio.id.as_str();

        if self.cancel.is_cancelled() {
            let outcome = PortfolioOutcome::NotStarted;
            self.progress.on_complete(id, index, total, &outcome);
            return outcome;
        }
        if !self.circuits.allow(id, self.clock.now()) {
            let outcome = PortfolioOutcome::CircuitTripped;
            self.progress.on_complete(id, index, total, &outcome);
            return outcome;
        }

        self.progress.on_start(id, index, total);
        let outcome = self.attempt_loop(item);
        self.progress.on_complete(id, index, total, &outcome);
        outcome
    }

    fn attempt_loop(&self, item: &WorkItem) -> PortfolioOutcome {
        let id = item.portfolio.id.as_str();
        let max_attempts = self.config.retry.attempts_per_run.max(1);
        let mut attempts = 0;

        let last_error = loop {
            attempts += 1;
            self.limiter.acquire();

            let err = match self.attempt(item) {
                Ok(output) => {
                    self.circuits.record_success(id);
                    if let Err(e) = self.store.record_success(id) {
                        tracing::error!(portfolio_id = id, error = %e, "could not clear failure record");
                    }
                    return PortfolioOutcome::Succeeded { output, attempts };
                }
                Err(err) => err,
            };

            let kind = classify(&err);
            let circuit = self.circuits.record_failure(id, self.clock.now());
            tracing::debug!(
                portfolio_id = id,
                attempt = attempts,
                kind = %kind,
                class = ?err.class(),
                circuit = %circuit,
                error = %err,
                "attempt failed"
            );
            if circuit == CircuitState::Open {
                tracing::warn!(portfolio_id = id, "circuit opened");
            }

            if attempts >= max_attempts
                || kind == FailureKind::Authentication
                || self.cancel.is_cancelled()
            {
                break err;
            }
            self.clock.sleep(in_run_delay(
                self.config.in_run_base_delay(),
                self.config.retry.in_run_jitter,
                attempts,
                &err,
            ));
            if !self.circuits.allow(id, self.clock.now()) {
                break err;
            }
        };

        self.record_failure(item, &last_error, attempts)
    }

    /// One call: fetch, reject empty payloads, write the artifact.
    fn attempt(&self, item: &WorkItem) -> Result<SuccessfulOutput, FetchError> {
        let payload = self
            .client
            .fetch(&item.portfolio.id, &item.endpoint, &item.params)?;
        if payload.is_empty_report(item.format) {
            return Err(FetchError::empty(format!(
                "endpoint {} returned no data ({} bytes)",
                item.endpoint,
                payload.bytes.len()
            )));
        }

        let path = ReportRequest::new(item.endpoint.clone(), item.format, item.reference_date)
            .output_path(&self.config.output.dir, &item.portfolio);
        self.writer
            .write(&payload.bytes, &path, item.format)
            .map_err(|source| FetchError::Output {
                path: path.clone(),
                source,
            })?;

        Ok(SuccessfulOutput {
            portfolio_id: item.portfolio.id.clone(),
            portfolio_name: item.portfolio.name.clone(),
            endpoint: item.endpoint.clone(),
            reference_date: item.reference_date,
            format: item.format,
            path,
            bytes: payload.bytes.len(),
        })
    }

    fn record_failure(&self, item: &WorkItem, err: &FetchError, attempts: u32) -> PortfolioOutcome {
        let kind = classify(err);
        let message = err.to_string();
        let record = match self.store.record_failure(
            &item.portfolio,
            kind,
            &message,
            &item.endpoint,
            &item.params,
        ) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::error!(
                    portfolio_id = %item.portfolio.id,
                    class = ?ErrorClass::StorageFailure,
                    error = %e,
                    "failure recorded in memory only"
                );
                self.store.get(&item.portfolio.id)
            }
        };

        if record.is_some_and(|r| r.abandoned) {
            PortfolioOutcome::Abandoned {
                kind,
                message,
                attempts,
            }
        } else {
            PortfolioOutcome::Failed {
                kind,
                message,
                attempts,
            }
        }
    }

    /// Retry a degraded store once. Returns whether changes remain unsaved.
    fn reconcile_store(&self) -> bool {
        if !self.store.is_degraded() {
            return false;
        }
        match self.store.flush() {
            Ok(()) => {
                tracing::info!("failure store recovered; all changes persisted");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "failure store still not writable at end of run");
                true
            }
        }
    }
}

/// Delay before in-run attempt `completed + 1`: base * 2^(completed-1) plus
/// up to `jitter` of that, and at least any server Retry-After. `jitter` is
/// clamped to `0..=1`; a non-finite value disables it.
fn in_run_delay(base: Duration, jitter: f64, completed: u32, err: &FetchError) -> Duration {
    let factor = 1u32.checked_shl(completed.saturating_sub(1)).unwrap_or(u32::MAX);
    let mut delay = base.saturating_mul(factor);

    let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
    if jitter > 0.0 && !delay.is_zero() {
        let extra = rand::thread_rng().gen_range(0.0..=jitter);
        delay += Duration::try_from_secs_f64(delay.as_secs_f64() * extra).unwrap_or_default();
    }
    if let FetchError::RateLimited {
        retry_after_secs: Some(secs),
    } = err
    {
        delay = delay.max(Duration::from_secs(*secs));
    }
    delay
}

/// First occurrence of each id, in order.
fn dedup(portfolios: &[Portfolio]) -> Vec<Portfolio> {
    let mut seen = HashSet::new();
    portfolios
        .iter()
        .filter(|p| seen.insert(p.id.clone()))
        .cloned()
        .collect()
}

fn replay(
    portfolio: Portfolio,
    endpoint: Endpoint,
    params: RequestParams,
    fallback: &ReportRequest,
) -> WorkItem {
    WorkItem {
        format: format_from_params(&params).unwrap_or(fallback.format),
        reference_date: date_from_params(&params).unwrap_or(fallback.reference_date),
        portfolio,
        endpoint,
        params,
    }
}
