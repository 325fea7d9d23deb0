//! Per-session bound on simultaneously in-flight generation calls.
//!
//! Cancellation here is cooperative and session-local: canceling a unit
//! frees its slot and flips its token, but the underlying cache job is left
//! alone since other sessions may be waiting on it. The in-flight call
//! observes the token at its next checkpoint and discards the result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 3;

const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct SessionLimiter {
    limit: usize,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<HashMap<i32, CancelToken>>,
}

impl SessionLimiter {
    pub fn new(limit: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit: limit.max(1),
            clock,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn can_start(&self) -> bool {
        let in_flight = self.in_flight.lock().expect("limiter lock");
        in_flight.len() < self.limit
    }

    pub fn active_count(&self) -> usize {
        self.in_flight.lock().expect("limiter lock").len()
    }

    /// Claim a slot for `unit`. Returns the unit's cancellation token, or
    /// `None` when the limit is reached or the unit is already tracked.
    pub fn start(&self, unit: i32) -> Option<CancelToken> {
        let mut in_flight = self.in_flight.lock().expect("limiter lock");
        if in_flight.len() >= self.limit || in_flight.contains_key(&unit) {
            return None;
        }
        let token = CancelToken::default();
        in_flight.insert(unit, token.clone());
        Some(token)
    }

    pub fn complete(&self, unit: i32) {
        let mut in_flight = self.in_flight.lock().expect("limiter lock");
        in_flight.remove(&unit);
    }

    /// Idempotent; returns false when the unit is not tracked.
    pub fn cancel(&self, unit: i32) -> bool {
        let mut in_flight = self.in_flight.lock().expect("limiter lock");
        match in_flight.remove(&unit) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_outside_window(&self, start: i32, end: i32) -> Vec<i32> {
        let mut in_flight = self.in_flight.lock().expect("limiter lock");
        let outside: Vec<i32> = in_flight
            .keys()
            .copied()
            .filter(|unit| *unit < start || *unit > end)
            .collect();
        for unit in &outside {
            if let Some(token) = in_flight.remove(unit) {
                token.cancel();
            }
        }
        outside
    }

    pub fn cancel_all(&self) -> Vec<i32> {
        let mut in_flight = self.in_flight.lock().expect("limiter lock");
        let units: Vec<i32> = in_flight.keys().copied().collect();
        for (_, token) in in_flight.drain() {
            token.cancel();
        }
        units
    }

    /// Poll until a slot frees or the timeout elapses. Time advances through
    /// the injected clock, one poll interval per iteration.
    pub async fn wait_for_slot(&self, timeout: Duration) -> bool {
        let mut waited = Duration::ZERO;
        loop {
            if self.can_start() {
                return true;
            }
            if waited >= timeout {
                return false;
            }
            self.clock.sleep(SLOT_POLL_INTERVAL).await;
            waited += SLOT_POLL_INTERVAL;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDateTime;

    /// Clock whose sleeps yield without waiting, so polling loops run at
    /// full speed under test.
    struct InstantClock;

    impl InstantClock {
        fn new() -> Arc<Self> {
            Arc::new(Self)
        }
    }

    #[async_trait]
    impl Clock for InstantClock {
        fn now(&self) -> NaiveDateTime {
            chrono::Utc::now().naive_utc()
        }

        async fn sleep(&self, _duration: Duration) {
            tokio::task::yield_now().await;
        }
    }

    fn limiter(limit: usize) -> SessionLimiter {
        SessionLimiter::new(limit, InstantClock::new())
    }

    #[test]
    fn can_start_tracks_limit_of_three() {
        let limiter = limiter(3);
        assert!(limiter.can_start());
        limiter.start(1).expect("slot 1");
        assert!(limiter.can_start());
        limiter.start(2).expect("slot 2");
        assert!(limiter.can_start());
        limiter.start(3).expect("slot 3");
        assert!(!limiter.can_start());
        assert!(limiter.start(4).is_none());
    }

    #[test]
    fn completing_frees_the_slot() {
        let limiter = limiter(1);
        limiter.start(5).expect("slot");
        assert!(!limiter.can_start());
        limiter.complete(5);
        assert!(limiter.can_start());
    }

    #[test]
    fn duplicate_unit_is_rejected() {
        let limiter = limiter(3);
        limiter.start(5).expect("slot");
        assert!(limiter.start(5).is_none());
    }

    #[test]
    fn cancel_is_idempotent_and_flips_token() {
        let limiter = limiter(3);
        let token = limiter.start(5).expect("slot");
        assert!(!token.is_canceled());
        assert!(limiter.cancel(5));
        assert!(token.is_canceled());
        assert!(!limiter.cancel(5));
        assert!(!limiter.cancel(99));
    }

    #[test]
    fn cancel_outside_window_spares_inside_units() {
        let limiter = limiter(10);
        let inside = limiter.start(8).expect("slot");
        let low = limiter.start(3).expect("slot");
        let high = limiter.start(20).expect("slot");

        let mut canceled = limiter.cancel_outside_window(5, 15);
        canceled.sort_unstable();
        assert_eq!(canceled, vec![3, 20]);
        assert!(low.is_canceled());
        assert!(high.is_canceled());
        assert!(!inside.is_canceled());
        assert_eq!(limiter.active_count(), 1);
    }

    #[test]
    fn cancel_all_drains_everything() {
        let limiter = limiter(10);
        let a = limiter.start(1).expect("slot");
        let b = limiter.start(2).expect("slot");
        let mut canceled = limiter.cancel_all();
        canceled.sort_unstable();
        assert_eq!(canceled, vec![1, 2]);
        assert!(a.is_canceled());
        assert!(b.is_canceled());
        assert_eq!(limiter.active_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_slot_returns_immediately_when_free() {
        let limiter = limiter(1);
        assert!(limiter.wait_for_slot(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn wait_for_slot_times_out_when_full() {
        let limiter = limiter(1);
        limiter.start(1).expect("slot");
        assert!(!limiter.wait_for_slot(Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn wait_for_slot_sees_concurrent_completion() {
        let clock = InstantClock::new();
        let limiter = Arc::new(SessionLimiter::new(1, clock));
        limiter.start(1).expect("slot");

        let waiter = limiter.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_slot(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        limiter.complete(1);
        assert!(handle.await.expect("join"));
    }
}
