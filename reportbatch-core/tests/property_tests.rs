//! Property tests for classification, backoff and attempt bookkeeping.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use reportbatch_core::{
    classify, Clock, Endpoint, FailureKind, FailureStore, FetchError, ManualClock, MemoryBackend,
    Portfolio, RequestParams, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;

fn any_kind() -> impl Strategy<Value = FailureKind> {
    prop::sample::select(FailureKind::ALL.to_vec())
}

proptest! {
    #[test]
    fn status_classification_is_total(status in 100u16..600) {
        let kind = classify(&FetchError::status(status, ""));
        let expected = match status {
            401 | 403 => FailureKind::Authentication,
            429 => FailureKind::RateLimit,
            408 => FailureKind::Timeout,
            500..=599 => FailureKind::ApiError,
            _ => FailureKind::ProcessingError,
        };
        prop_assert_eq!(kind, expected);
    }

    #[test]
    fn backoff_doubles_until_cap(kind in any_kind(), attempts in 1u32..20) {
        let uncapped = RetryPolicy::uncapped();
        let base = kind.base_backoff().as_secs();
        prop_assert_eq!(
            uncapped.backoff(kind, attempts),
            Duration::from_secs(base * (1u64 << (attempts - 1)))
        );
        let capped = RetryPolicy::default();
        prop_assert!(capped.backoff(kind, attempts) <= Duration::from_secs(3600));
        prop_assert!(capped.backoff(kind, attempts + 1) >= capped.backoff(kind, attempts));
    }

    #[test]
    fn attempts_strictly_increase_until_abandoned(kinds in prop::collection::vec(any_kind(), 1..15)) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let store = FailureStore::open(Box::new(MemoryBackend::new()), RetryPolicy::default(), clock.clone()).unwrap();
        let p = Portfolio::new("1", "Fund").unwrap();

        let mut last = 0;
        for kind in kinds {
            clock.advance(Duration::from_secs(1));
            let r = store
                .record_failure(&p, kind, "x", &Endpoint::new("1048"), &RequestParams::new())
                .unwrap();
            prop_assert_eq!(r.attempt_count, last + 1);
            prop_assert_eq!(r.abandoned, r.attempt_count > kind.max_attempts());
            if r.abandoned {
                let later = clock.now() + chrono::Duration::days(400);
                prop_assert!(store.eligible_for_retry(later).is_empty());
            }
            last = r.attempt_count;
        }
        prop_assert_eq!(store.len(), 1);
    }
}
