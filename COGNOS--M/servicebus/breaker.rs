//! Three-state circuit breaker guarding one provider.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use cognos_kernel::{
    clock::{chrono_duration, Clock},
    config::BreakerConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are refused until the reset timeout elapses.
    Open,
    /// A single probe call decides between CLOSED and OPEN.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Point-in-time copy of the breaker counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Current position.
    pub state: BreakerState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// When the breaker last opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// Openings since the last recovery.
    pub trips: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    first_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    probe_started: Option<DateTime<Utc>>,
    trips: u32,
}

/// Failure tracker for one `(category, provider)` pair.
///
/// Every method takes the breaker's own lock; breakers never share one.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                first_failure_at: None,
                opened_at: None,
                probe_started: None,
                trips: 0,
            }),
        }
    }

    /// Whether a call may go through now.
    ///
    /// In HALF_OPEN the first caller reserves the single probe; later callers
    /// are refused until the probe reports back. A probe that never reports
    /// back is released after another reset timeout.
    pub fn is_callable(&self) -> bool {
        let now = self.clock.now();
        let reset = chrono_duration(self.config.reset_timeout());
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map_or(true, |opened| now - opened >= reset);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_started = Some(now);
                }
                elapsed
            }
            BreakerState::HalfOpen => {
                let free = inner.probe_started.map_or(true, |started| now - started >= reset);
                if free {
                    inner.probe_started = Some(now);
                }
                free
            }
        }
    }

    /// Records a successful call. Returns the new state when it changed.
    pub fn record_success(&self) -> Option<BreakerState> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.first_failure_at = None;
                None
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.first_failure_at = None;
                inner.opened_at = None;
                inner.probe_started = None;
                inner.trips = 0;
                Some(BreakerState::Closed)
            }
            // A call that started before the breaker opened does not close it.
            BreakerState::Open => None,
        }
    }

    /// Records a failed call. Returns the new state when it changed.
    pub fn record_failure(&self) -> Option<BreakerState> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                if let (Some(window), Some(first)) =
                    (self.config.failure_window(), inner.first_failure_at)
                {
                    if now - first > chrono_duration(window) {
                        inner.consecutive_failures = 0;
                        inner.first_failure_at = None;
                    }
                }
                inner.consecutive_failures += 1;
                inner.first_failure_at.get_or_insert(now);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::open(&mut inner, now);
                    Some(BreakerState::Open)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                inner.consecutive_failures += 1;
                Self::open(&mut inner, now);
                Some(BreakerState::Open)
            }
            BreakerState::Open => {
                inner.consecutive_failures += 1;
                None
            }
        }
    }

    fn open(inner: &mut BreakerInner, now: DateTime<Utc>) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.probe_started = None;
        inner.trips += 1;
    }

    /// Current position without side effects.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Openings since the last recovery.
    #[must_use]
    pub fn trips(&self) -> u32 {
        self.inner.lock().trips
    }

    /// Copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            trips: inner.trips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use cognos_kernel::ManualClock;

    fn breaker(clock: &ManualClock) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::default(), Arc::new(clock.clone()))
    }

    #[test]
    fn opens_after_threshold_and_stays_open_under_failures() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.record_failure(), Some(BreakerState::Open));
        let opened_at = breaker.snapshot().opened_at;

        for _ in 0..5 {
            clock.advance(Duration::seconds(10));
            assert_eq!(breaker.record_failure(), None);
            assert!(!breaker.is_callable());
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot().opened_at, opened_at);
        assert_eq!(breaker.snapshot().consecutive_failures, 8);

        clock.advance(Duration::seconds(10));
        assert!(breaker.is_callable());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_grants_a_single_probe() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            breaker.record_failure();
        }
        clock.advance(Duration::seconds(60));
        assert!(breaker.is_callable());
        assert!(!breaker.is_callable());
        assert_eq!(breaker.record_success(), Some(BreakerState::Closed));
        assert!(breaker.is_callable());
        assert_eq!(breaker.trips(), 0);
    }

    #[test]
    fn failed_probe_reopens_and_restarts_timer() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            breaker.record_failure();
        }
        clock.advance(Duration::seconds(61));
        assert!(breaker.is_callable());
        assert_eq!(breaker.record_failure(), Some(BreakerState::Open));
        assert_eq!(breaker.trips(), 2);
        clock.advance(Duration::seconds(59));
        assert!(!breaker.is_callable());
        clock.advance(Duration::seconds(1));
        assert!(breaker.is_callable());
    }

    #[test]
    fn success_resets_the_closed_count() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn failure_window_expires_old_failures() {
        let clock = ManualClock::default();
        let config = BreakerConfig {
            failure_window_secs: Some(30),
            ..BreakerConfig::default()
        };
        let breaker = CircuitBreaker::new(config, Arc::new(clock.clone()));
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::seconds(31));
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }
}
