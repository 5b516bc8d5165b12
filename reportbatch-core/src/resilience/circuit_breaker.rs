//! Per-portfolio circuit breaker.
//!
//! After `failure_threshold` consecutive failures a portfolio's circuit opens
//! and the orchestrator stops calling the API for it. Once the cool-down has
//! elapsed one trial call is let through (half-open): success closes the
//! circuit, failure re-opens it with a longer cool-down up to `max_cooldown`.
//!
//! Breakers live in memory only. A [`CircuitBoard`] holds one per portfolio
//! and is owned by a single orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Externally visible circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// Cool-down growth applied each time a half-open trial fails.
    pub cooldown_multiplier: f64,
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BreakerState {
    Closed,
    Open { opened_at: DateTime<Utc> },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            cooldown: config.cooldown,
        }
    }

    /// Whether a call may be issued now. Moves Open to HalfOpen once the
    /// cool-down has elapsed and hands out the single trial slot.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open { opened_at } => {
                if elapsed(opened_at, now) >= self.cooldown {
                    self.state = BreakerState::HalfOpen {
                        trial_in_flight: true,
                    };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    false
                } else {
                    self.state = BreakerState::HalfOpen {
                        trial_in_flight: true,
                    };
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.cooldown = self.config.cooldown;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            BreakerState::HalfOpen { .. } => {
                self.cooldown = grow(self.cooldown, &self.config);
                self.state = BreakerState::Open { opened_at: now };
            }
            BreakerState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = BreakerState::Open { opened_at: now };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Force the circuit open.
    pub fn trip(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Open { opened_at: now };
    }

    /// State as seen at `now`, without consuming the trial slot.
    pub fn state(&self, now: DateTime<Utc>) -> CircuitState {
        match self.state {
            BreakerState::Closed => CircuitState::Closed,
            BreakerState::Open { opened_at } if elapsed(opened_at, now) >= self.cooldown => {
                CircuitState::HalfOpen
            }
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn current_cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Remaining cool-down (zero unless open).
    pub fn remaining_cooldown(&self, now: DateTime<Utc>) -> Duration {
        match self.state {
            BreakerState::Open { opened_at } => self.cooldown.saturating_sub(elapsed(opened_at, now)),
            _ => Duration::ZERO,
        }
    }
}

fn grow(cooldown: Duration, config: &CircuitBreakerConfig) -> Duration {
    let cap = config.max_cooldown.max(config.cooldown);
    Duration::try_from_secs_f64(cooldown.as_secs_f64() * config.cooldown_multiplier.max(1.0))
        .unwrap_or(cap)
        .min(cap)
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// One breaker per portfolio id.
#[derive(Debug)]
pub struct CircuitBoard {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBoard {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn with<R>(&self, portfolio_id: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let breaker = map
            .entry(portfolio_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        f(breaker)
    }

    pub fn allow(&self, portfolio_id: &str, now: DateTime<Utc>) -> bool {
        self.with(portfolio_id, |b| b.allow(now))
    }

    pub fn record_success(&self, portfolio_id: &str) {
        self.with(portfolio_id, |b| b.record_success());
    }

    /// Record a failure and return the resulting state.
    pub fn record_failure(&self, portfolio_id: &str, now: DateTime<Utc>) -> CircuitState {
        self.with(portfolio_id, |b| {
            b.record_failure(now);
            b.state(now)
        })
    }

    pub fn state(&self, portfolio_id: &str, now: DateTime<Utc>) -> CircuitState {
        let map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(portfolio_id)
            .map(|b| b.state(now))
            .unwrap_or(CircuitState::Closed)
    }

    /// Ids whose circuit is open at `now`, sorted.
    pub fn open_portfolios(&self, now: DateTime<Utc>) -> Vec<String> {
        let map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = map
            .iter()
            .filter(|(_, b)| b.state(now) == CircuitState::Open)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn reset(&self) {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(secs)
    }

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(150),
        }
    }

    #[test]
    fn starts_closed() {
        let mut cb = CircuitBreaker::new(config());
        assert!(cb.allow(t0()));
        assert_eq!(cb.state(t0()), CircuitState::Closed);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let mut cb = CircuitBreaker::new(config());
        cb.record_failure(t0());
        cb.record_failure(t0());
        assert!(cb.allow(t0()));
        cb.record_failure(t0());
        assert!(!cb.allow(t0()));
        assert_eq!(cb.state(t0()), CircuitState::Open);
        assert_eq!(cb.remaining_cooldown(at(20)), Duration::from_secs(40));
    }

    #[test]
    fn success_resets_counter() {
        let mut cb = CircuitBreaker::new(config());
        cb.record_failure(t0());
        cb.record_failure(t0());
        cb.record_success();
        cb.record_failure(t0());
        assert!(cb.allow(t0()));
        assert_eq!(cb.consecutive_failures(), 1);
    }

    #[test]
    fn half_open_allows_a_single_trial() {
        let mut cb = CircuitBreaker::new(config());
        cb.trip(t0());
        assert!(!cb.allow(at(59)));
        assert_eq!(cb.state(at(60)), CircuitState::HalfOpen);
        assert!(cb.allow(at(60)));
        assert!(!cb.allow(at(61)));
    }

    #[test]
    fn trial_success_closes() {
        let mut cb = CircuitBreaker::new(config());
        cb.trip(t0());
        assert!(cb.allow(at(60)));
        cb.record_success();
        assert_eq!(cb.state(at(60)), CircuitState::Closed);
        assert_eq!(cb.current_cooldown(), Duration::from_secs(60));
    }

    #[test]
    fn trial_failure_reopens_with_growth_up_to_cap() {
        let mut cb = CircuitBreaker::new(config());
        cb.trip(t0());
        assert!(cb.allow(at(60)));
        cb.record_failure(at(60));
        assert_eq!(cb.state(at(61)), CircuitState::Open);
        assert_eq!(cb.current_cooldown(), Duration::from_secs(120));

        assert!(cb.allow(at(180)));
        cb.record_failure(at(180));
        assert_eq!(cb.current_cooldown(), Duration::from_secs(150));
    }

    #[test]
    fn board_isolates_portfolios() {
        let board = CircuitBoard::new(config());
        for _ in 0..3 {
            board.record_failure("X", t0());
        }
        assert_eq!(board.state("X", t0()), CircuitState::Open);
        assert_eq!(board.state("Y", t0()), CircuitState::Closed);
        assert!(!board.allow("X", t0()));
        assert!(board.allow("Y", t0()));
        assert_eq!(board.open_portfolios(t0()), vec!["X".to_string()]);

        board.reset();
        assert_eq!(board.state("X", t0()), CircuitState::Closed);
    }
}
