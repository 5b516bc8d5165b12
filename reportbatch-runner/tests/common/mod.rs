//! Shared fixtures: a scripted report client and an orchestrator harness on a
//! manual clock with an in-memory failure backend.
#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use reportbatch_core::{
    Clock, Endpoint, FailureStore, FetchError, FsOutputWriter, ManualClock, MemoryBackend,
    Portfolio, RateLimiter, ReportClient, ReportFormat, ReportPayload, ReportRequest,
    RequestParams,
};
use reportbatch_runner::{EngineConfig, Orchestrator, OrchestratorParts};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_CSV: &str = "asset;value\nPETR4;10,5\nVALE3;7,25\n";

#[derive(Debug, Clone)]
pub enum Reply {
    Body(String),
    Status(u16),
    Timeout,
    Empty,
    RateLimited(Option<u64>),
}

impl Reply {
    fn into_result(self) -> Result<ReportPayload, FetchError> {
        match self {
            Reply::Body(body) => Ok(ReportPayload::new(body.into_bytes(), "text/csv")),
            Reply::Status(status) => Err(FetchError::status(status, "scripted")),
            Reply::Timeout => Err(FetchError::timeout("scripted timeout")),
            Reply::Empty => Ok(ReportPayload::new(Vec::new(), "text/csv")),
            Reply::RateLimited(retry_after_secs) => Err(FetchError::RateLimited { retry_after_secs }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub portfolio_id: String,
    pub endpoint: Endpoint,
    pub params: RequestParams,
}

type Hook = Box<dyn Fn(usize) + Send + Sync>;

/// Replies per portfolio: scripted replies first, then the portfolio's
/// standing reply, then [`DEFAULT_CSV`].
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    standing: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<Call>>,
    hook: Mutex<Option<Hook>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always(&self, id: &str, reply: Reply) {
        self.standing.lock().unwrap().insert(id.to_string(), reply);
    }

    pub fn clear(&self, id: &str) {
        self.standing.lock().unwrap().remove(id);
    }

    pub fn script(&self, id: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(id.to_string(), replies.into());
    }

    /// Run `hook` with the 1-based call number after each call is logged.
    pub fn on_call(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Real wall-clock latency per call, for concurrency tests.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.portfolio_id).collect()
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.calls().iter().filter(|c| c.portfolio_id == id).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, id: &str) -> Reply {
        if let Some(reply) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        self.standing
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| Reply::Body(DEFAULT_CSV.to_string()))
    }
}

impl ReportClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch(
        &self,
        portfolio_id: &str,
        endpoint: &Endpoint,
        params: &RequestParams,
    ) -> Result<ReportPayload, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                portfolio_id: portfolio_id.to_string(),
                endpoint: endpoint.clone(),
                params: params.clone(),
            });
            calls.len()
        };
        let reply = self.next_reply(portfolio_id);
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(count);
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply.into_result()
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 6, 0, 0).unwrap()
}

pub fn reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()
}

pub fn request() -> ReportRequest {
    ReportRequest::new(Endpoint::new("1048"), ReportFormat::CsvBr, reference_date())
}

/// Portfolios "1" through "n".
pub fn portfolios(n: usize) -> Vec<Portfolio> {
    (1..=n)
        .map(|i| Portfolio::new(i.to_string(), format!("Fund {i}")).unwrap())
        .collect()
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub backend: Arc<MemoryBackend>,
    pub store: Arc<FailureStore>,
    pub client: Arc<ScriptedClient>,
    pub out_dir: tempfile::TempDir,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_backend(config, MemoryBackend::new())
    }

    pub fn with_backend(mut config: EngineConfig, backend: MemoryBackend) -> Self {
        let out_dir = tempfile::tempdir().unwrap();
        config.output.dir = out_dir.path().to_path_buf();

        let clock = Arc::new(ManualClock::new(t0()));
        let backend = Arc::new(backend);
        let store = Arc::new(
            FailureStore::open(
                Box::new(backend.clone()),
                config.retry_policy(),
                clock.clone(),
            )
            .unwrap(),
        );
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.max_calls,
            config.rate_period(),
            clock.clone(),
        ));
        let client = Arc::new(ScriptedClient::new());
        let orchestrator = Orchestrator::new(OrchestratorParts {
            client: client.clone(),
            writer: Arc::new(FsOutputWriter::new()),
            store: store.clone(),
            limiter,
            clock: clock.clone() as Arc<dyn Clock>,
            config,
        });

        Self {
            clock,
            backend,
            store,
            client,
            out_dir,
            orchestrator,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Defaults with a single in-run attempt, so each run makes one call per
/// portfolio.
pub fn single_attempt() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.attempts_per_run = 1;
    config
}
