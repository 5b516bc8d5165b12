//! Sliding-window rate limiter shared by all workers.
//!
//! At most `max_calls` acquisitions are granted in any window of `period`.
//! The lock is released while a caller waits, so other workers can inspect the
//! window concurrently.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    clock: Arc<dyn Clock>,
    calls: Mutex<VecDeque<DateTime<Utc>>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_calls", &self.max_calls)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// `max_calls` of zero is treated as one.
    pub fn new(max_calls: usize, period: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_calls: max_calls.max(1),
            period,
            clock,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Block until a slot is free, then take it.
    pub fn acquire(&self) {
        loop {
            let wait = match self.try_take() {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            self.clock.sleep(wait);
        }
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> bool {
        self.try_take().is_ok()
    }

    /// Time until the next slot frees up (zero if one is free now).
    pub fn wait_time(&self) -> Duration {
        let now = self.clock.now();
        let mut calls = self.lock_calls();
        self.prune(&mut calls, now);
        if calls.len() < self.max_calls {
            Duration::ZERO
        } else {
            self.wait_for_oldest(&calls, now)
        }
    }

    /// Calls recorded inside the current window.
    pub fn in_window(&self) -> usize {
        let now = self.clock.now();
        let mut calls = self.lock_calls();
        self.prune(&mut calls, now);
        calls.len()
    }

    fn try_take(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut calls = self.lock_calls();
        self.prune(&mut calls, now);
        if calls.len() < self.max_calls {
            calls.push_back(now);
            Ok(())
        } else {
            Err(self.wait_for_oldest(&calls, now))
        }
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, VecDeque<DateTime<Utc>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prune(&self, calls: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        while let Some(oldest) = calls.front() {
            if elapsed(*oldest, now) >= self.period {
                calls.pop_front();
            } else {
                break;
            }
        }
    }

    fn wait_for_oldest(&self, calls: &VecDeque<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        calls
            .front()
            .map(|oldest| self.period.saturating_sub(elapsed(*oldest, now)))
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_millis(1))
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn grants_up_to_max_without_waiting() {
        let clock = clock();
        let limiter = RateLimiter::new(3, Duration::from_secs(60), clock.clone());
        for _ in 0..3 {
            limiter.acquire();
        }
        assert_eq!(clock.total_slept(), Duration::ZERO);
        assert_eq!(limiter.in_window(), 3);
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn blocks_until_oldest_call_leaves_window() {
        let clock = clock();
        let limiter = RateLimiter::new(2, Duration::from_secs(60), clock.clone());
        limiter.acquire();
        clock.advance(Duration::from_secs(20));
        limiter.acquire();

        assert_eq!(limiter.wait_time(), Duration::from_secs(40));
        limiter.acquire();
        assert_eq!(clock.total_slept(), Duration::from_secs(40));
        assert_eq!(limiter.in_window(), 2);
    }

    #[test]
    fn zero_max_calls_still_makes_progress() {
        let clock = clock();
        let limiter = RateLimiter::new(0, Duration::from_secs(1), clock.clone());
        limiter.acquire();
        limiter.acquire();
        assert_eq!(clock.total_slept(), Duration::from_secs(1));
    }
}
