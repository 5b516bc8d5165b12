//! Rate limiter under concurrent callers.

use chrono::{TimeZone, Utc};
use reportbatch_core::{ManualClock, RateLimiter, SystemClock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn concurrent_try_acquire_never_exceeds_budget() {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(60), clock));
    let granted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let granted = Arc::clone(&granted);
            thread::spawn(move || {
                for _ in 0..10 {
                    if limiter.try_acquire() {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(granted.load(Ordering::SeqCst), 5);
    assert_eq!(limiter.in_window(), 5);
}

#[test]
fn blocking_acquire_spreads_calls_over_the_period() {
    let limiter = Arc::new(RateLimiter::new(
        2,
        Duration::from_millis(100),
        Arc::new(SystemClock),
    ));
    let start = Instant::now();

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || limiter.acquire())
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert!(start.elapsed() >= Duration::from_millis(95));
}
