//! The failure store: one record per failing portfolio, persisted on every
//! mutation through an injected [`FailureBackend`].
//!
//! All mutations run under a single lock and persist the full snapshot before
//! the lock is released, so writes for the same portfolio are linearizable.
//! If the backend cannot persist, the change is still applied in memory, the
//! store is marked degraded and [`StoreError::Persist`] is returned; a later
//! [`FailureStore::flush`] retries the write.

use super::backend::{FailureBackend, JsonFileBackend, LoadSource, RecordMap};
use super::record::FailureRecord;
use crate::clock::Clock;
use crate::domain::{Endpoint, Portfolio, RequestParams};
use crate::resilience::{FailureKind, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on a purge window; larger values purge nothing extra.
const MAX_PURGE_HOURS: i64 = 24 * 365 * 10_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failure store I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failure store serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failure store unavailable: {0}")]
    Unavailable(String),

    #[error("failure export: {0}")]
    Csv(#[from] csv::Error),

    /// The change was applied in memory but could not be written.
    #[error("failure store change not persisted: {source}")]
    Persist {
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    pub fn is_persist(&self) -> bool {
        matches!(self, StoreError::Persist { .. })
    }
}

/// Summary of the store's contents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureStats {
    pub total: usize,
    /// Not abandoned.
    pub recoverable: usize,
    pub abandoned: usize,
    /// Recoverable and past their backoff.
    pub eligible_now: usize,
    pub failures_by_kind: BTreeMap<FailureKind, usize>,
    /// Age of the oldest record, by first failure.
    pub oldest_failure_age: Option<Duration>,
}

struct StoreState {
    records: RecordMap,
    degraded: bool,
}

pub struct FailureStore {
    backend: Box<dyn FailureBackend>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for FailureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureStore")
            .field("backend", &self.backend.describe())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl FailureStore {
    /// Load the store from `backend`. Unreadable snapshots never abort the
    /// load; the backend falls back to its backup or to an empty store.
    pub fn open(
        backend: Box<dyn FailureBackend>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let loaded = backend.load()?;
        match loaded.source {
            LoadSource::Lost => tracing::error!(
                backend = %backend.describe(),
                "failure store started empty after losing its snapshot"
            ),
            source => tracing::debug!(
                backend = %backend.describe(),
                ?source,
                records = loaded.records.len(),
                "failure store loaded"
            ),
        }
        Ok(Self {
            backend,
            policy,
            clock,
            state: Mutex::new(StoreState {
                records: loaded.records,
                degraded: false,
            }),
        })
    }

    /// Open a JSON-file backed store at `path`.
    pub fn open_json(
        path: impl Into<PathBuf>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        Self::open(Box::new(JsonFileBackend::new(path)), policy, clock)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &mut StoreState) -> Result<(), StoreError> {
        match self.backend.save(&state.records) {
            Ok(()) => Ok(()),
            Err(e) => {
                state.degraded = true;
                tracing::error!(
                    backend = %self.backend.describe(),
                    error = %e,
                    "CRITICAL: failure store could not persist; continuing in memory"
                );
                Err(StoreError::Persist {
                    source: Box::new(e),
                })
            }
        }
    }

    /// Upsert the failure for `portfolio`, incrementing its attempt count.
    ///
    /// On [`StoreError::Persist`] the record is still updated in memory and
    /// can be read back with [`FailureStore::get`].
    pub fn record_failure(
        &self,
        portfolio: &Portfolio,
        kind: FailureKind,
        message: &str,
        endpoint: &Endpoint,
        params: &RequestParams,
    ) -> Result<FailureRecord, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();

        let record = match state.records.entry(portfolio.id.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.attempt_count = existing.attempt_count.saturating_add(1);
                existing.portfolio_name = portfolio.name.clone();
                existing.failure_kind = kind;
                existing.message = message.to_string();
                existing.last_attempt_at = now;
                existing.endpoint = endpoint.clone();
                existing.request_params = params.clone();
                existing.abandoned = RetryPolicy::is_abandoned(kind, existing.attempt_count);
                existing.clone()
            }
            Entry::Vacant(entry) => entry
                .insert(FailureRecord {
                    portfolio_id: portfolio.id.clone(),
                    portfolio_name: portfolio.name.clone(),
                    failure_kind: kind,
                    message: message.to_string(),
                    first_seen_at: now,
                    last_attempt_at: now,
                    attempt_count: 1,
                    endpoint: endpoint.clone(),
                    request_params: params.clone(),
                    abandoned: RetryPolicy::is_abandoned(kind, 1),
                })
                .clone(),
        };

        if record.abandoned {
            tracing::warn!(
                portfolio_id = %record.portfolio_id,
                kind = %kind,
                attempts = record.attempt_count,
                "portfolio abandoned after exceeding retry ceiling"
            );
        }

        self.persist(&mut state)?;
        Ok(record)
    }

    /// Remove any record for `portfolio_id`. Returns whether one existed.
    pub fn record_success(&self, portfolio_id: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.records.remove(portfolio_id).is_none() {
            return Ok(false);
        }
        self.persist(&mut state)?;
        Ok(true)
    }

    /// Non-abandoned records past their backoff, fewest attempts first.
    pub fn eligible_for_retry(&self, now: DateTime<Utc>) -> Vec<FailureRecord> {
        let state = self.lock();
        let mut eligible: Vec<FailureRecord> = state
            .records
            .values()
            .filter(|r| r.is_eligible(&self.policy, now))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            a.attempt_count
                .cmp(&b.attempt_count)
                .then(a.first_seen_at.cmp(&b.first_seen_at))
                .then_with(|| a.portfolio_id.cmp(&b.portfolio_id))
        });
        eligible
    }

    pub fn stats(&self, now: DateTime<Utc>) -> FailureStats {
        let state = self.lock();
        let mut failures_by_kind = BTreeMap::new();
        let mut abandoned = 0;
        let mut eligible_now = 0;
        for record in state.records.values() {
            *failures_by_kind.entry(record.failure_kind).or_insert(0) += 1;
            if record.abandoned {
                abandoned += 1;
            } else if record.is_eligible(&self.policy, now) {
                eligible_now += 1;
            }
        }
        let total = state.records.len();
        FailureStats {
            total,
            recoverable: total - abandoned,
            abandoned,
            eligible_now,
            failures_by_kind,
            oldest_failure_age: state.records.values().map(|r| r.age(now)).max(),
        }
    }

    /// Remove records whose last attempt is more than `hours` old.
    pub fn purge_older_than(&self, hours: u64) -> Result<usize, StoreError> {
        let hours = i64::try_from(hours).unwrap_or(i64::MAX).min(MAX_PURGE_HOURS);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(chrono::Duration::hours(hours))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.remove_where(|r| r.last_attempt_at < cutoff)
    }

    /// Remove every abandoned record.
    pub fn purge_abandoned(&self) -> Result<usize, StoreError> {
        self.remove_where(|r| r.abandoned)
    }

    fn remove_where(&self, pred: impl Fn(&FailureRecord) -> bool) -> Result<usize, StoreError> {
        let mut state = self.lock();
        let before = state.records.len();
        state.records.retain(|_, r| !pred(r));
        let removed = before - state.records.len();
        if removed > 0 {
            tracing::info!(removed, remaining = state.records.len(), "purged failure records");
            self.persist(&mut state)?;
        }
        Ok(removed)
    }

    /// Write the in-memory snapshot again. Clears the degraded flag on success.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        self.persist(&mut state)?;
        state.degraded = false;
        Ok(())
    }

    /// Whether some change since the last successful write exists only in memory.
    pub fn is_degraded(&self) -> bool {
        self.lock().degraded
    }

    pub fn get(&self, portfolio_id: &str) -> Option<FailureRecord> {
        self.lock().records.get(portfolio_id).cloned()
    }

    /// All records, ordered by portfolio id.
    pub fn records(&self) -> Vec<FailureRecord> {
        self.lock().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::backend::MemoryBackend;
    use chrono::TimeZone;

    fn setup() -> (FailureStore, Arc<ManualClock>, Arc<MemoryBackend>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 1, 6, 0, 0).unwrap(),
        ));
        let backend = Arc::new(MemoryBackend::new());
        let store =
            FailureStore::open(Box::new(backend.clone()), RetryPolicy::default(), clock.clone())
                .unwrap();
        (store, clock, backend)
    }

    fn fund(id: &str) -> Portfolio {
        Portfolio::new(id, format!("Fund {id}")).unwrap()
    }

    fn fail(store: &FailureStore, id: &str, kind: FailureKind) -> FailureRecord {
        store
            .record_failure(&fund(id), kind, "boom", &Endpoint::new("1048"), &RequestParams::new())
            .unwrap()
    }

    #[test]
    fn first_failure_starts_at_one() {
        let (store, clock, backend) = setup();
        let r = fail(&store, "1", FailureKind::ApiError);
        assert_eq!(r.attempt_count, 1);
        assert_eq!(r.first_seen_at, clock.now());
        assert!(!r.abandoned);
        assert_eq!(backend.snapshot().len(), 1);
    }

    #[test]
    fn repeated_failures_upsert_and_increment() {
        let (store, clock, _) = setup();
        let first = fail(&store, "1", FailureKind::ApiError);
        clock.advance(Duration::from_secs(10));
        let second = store
            .record_failure(
                &fund("1"),
                FailureKind::Timeout,
                "timed out",
                &Endpoint::new("1048"),
                &RequestParams::new(),
            )
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(second.attempt_count, 2);
        assert_eq!(second.first_seen_at, first.first_seen_at);
        assert_eq!(second.last_attempt_at, clock.now());
        assert_eq!(second.message, "timed out");
        assert_eq!(second.failure_kind, FailureKind::Timeout);
    }

    #[test]
    fn sixth_api_error_abandons() {
        let (store, clock, _) = setup();
        for n in 1..=5 {
            let r = fail(&store, "1", FailureKind::ApiError);
            assert_eq!(r.attempt_count, n);
            assert!(!r.abandoned);
        }
        let r = fail(&store, "1", FailureKind::ApiError);
        assert!(r.abandoned);
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert!(store.eligible_for_retry(clock.now()).is_empty());
        assert_eq!(store.stats(clock.now()).abandoned, 1);
    }

    #[test]
    fn success_removes_and_is_idempotent() {
        let (store, _, backend) = setup();
        fail(&store, "1", FailureKind::EmptyReport);
        assert!(store.record_success("1").unwrap());
        assert!(store.get("1").is_none());
        let saves = backend.save_count();
        assert!(!store.record_success("1").unwrap());
        assert!(!store.record_success("never-failed").unwrap());
        assert_eq!(backend.save_count(), saves);
    }

    #[test]
    fn eligibility_follows_backoff() {
        let (store, clock, _) = setup();
        for _ in 0..3 {
            fail(&store, "t", FailureKind::Timeout);
        }
        clock.advance(Duration::from_secs(119));
        assert!(store.eligible_for_retry(clock.now()).is_empty());
        clock.advance(Duration::from_secs(1));
        let eligible = store.eligible_for_retry(clock.now());
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].portfolio_id, "t");
    }

    #[test]
    fn eligible_sorted_by_attempts() {
        let (store, clock, _) = setup();
        fail(&store, "b", FailureKind::Timeout);
        fail(&store, "b", FailureKind::Timeout);
        fail(&store, "a", FailureKind::Timeout);
        clock.advance(Duration::from_secs(3600));
        let ids: Vec<String> = store
            .eligible_for_retry(clock.now())
            .into_iter()
            .map(|r| r.portfolio_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn stats_break_down_by_kind() {
        let (store, clock, _) = setup();
        fail(&store, "1", FailureKind::ApiError);
        clock.advance(Duration::from_secs(60));
        fail(&store, "2", FailureKind::ApiError);
        fail(&store, "3", FailureKind::Authentication);
        fail(&store, "3", FailureKind::Authentication);

        let stats = store.stats(clock.now());
        assert_eq!(stats.total, 3);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.recoverable, 2);
        assert_eq!(stats.eligible_now, 1);
        assert_eq!(stats.failures_by_kind[&FailureKind::ApiError], 2);
        assert_eq!(stats.failures_by_kind[&FailureKind::Authentication], 1);
        assert_eq!(stats.oldest_failure_age, Some(Duration::from_secs(60)));
    }

    #[test]
    fn purge_by_age_and_abandonment() {
        let (store, clock, _) = setup();
        fail(&store, "old", FailureKind::ApiError);
        clock.advance(Duration::from_secs(30 * 3600));
        fail(&store, "auth", FailureKind::Authentication);
        fail(&store, "auth", FailureKind::Authentication);
        fail(&store, "fresh", FailureKind::ApiError);

        assert_eq!(store.purge_older_than(24).unwrap(), 1);
        assert!(store.get("old").is_none());
        assert_eq!(store.purge_abandoned().unwrap(), 1);
        assert!(store.get("auth").is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_older_than(24).unwrap(), 0);
    }

    #[test]
    fn persist_failure_keeps_memory_state_and_flush_recovers() {
        let (store, _, backend) = setup();
        backend.set_fail_saves(true);
        let err = store
            .record_failure(
                &fund("1"),
                FailureKind::ApiError,
                "HTTP 500",
                &Endpoint::new("1048"),
                &RequestParams::new(),
            )
            .unwrap_err();
        assert!(err.is_persist());
        assert!(store.is_degraded());
        assert_eq!(store.get("1").map(|r| r.attempt_count), Some(1));
        assert!(backend.snapshot().is_empty());

        backend.set_fail_saves(false);
        store.flush().unwrap();
        assert!(!store.is_degraded());
        assert_eq!(backend.snapshot().len(), 1);
    }

    #[test]
    fn reopen_sees_persisted_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed_portfolios.json");
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 1, 6, 0, 0).unwrap(),
        ));
        {
            let store =
                FailureStore::open_json(&path, RetryPolicy::default(), clock.clone()).unwrap();
            let mut params = RequestParams::new();
            params.insert("date".into(), "2024-06-28".into());
            store
                .record_failure(&fund("7"), FailureKind::Timeout, "slow", &Endpoint::new("1799"), &params)
                .unwrap();
        }
        let store = FailureStore::open_json(&path, RetryPolicy::default(), clock).unwrap();
        let r = store.get("7").unwrap();
        assert_eq!(r.failure_kind, FailureKind::Timeout);
        assert_eq!(r.endpoint, Endpoint::new("1799"));
        assert_eq!(r.request_params["date"], "2024-06-28");
    }
}
