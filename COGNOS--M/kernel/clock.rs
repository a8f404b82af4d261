//! Time sources, constructor-injected wherever time matters.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Duration, TimeDelta, Utc};
use parking_lot::RwLock;

/// Wall-clock source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// System time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced time, shared between clones.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Starts at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Moves time forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now += by;
    }

    /// Moves time forward by a std duration.
    pub fn advance_std(&self, by: std::time::Duration) {
        self.advance(chrono_duration(by));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Converts a std duration for chrono arithmetic, saturating on overflow.
#[must_use]
pub fn chrono_duration(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualClock::default();
        let other = clock.clone();
        let start = clock.now();
        other.advance(Duration::seconds(61));
        assert_eq!(clock.now() - start, Duration::seconds(61));
        clock.advance_std(std::time::Duration::from_millis(500));
        assert_eq!(other.now() - start, Duration::milliseconds(61_500));
    }

    #[test]
    fn oversized_std_durations_saturate() {
        assert_eq!(chrono_duration(std::time::Duration::MAX), TimeDelta::MAX);
        assert_eq!(chrono_duration(std::time::Duration::from_secs(90)), Duration::seconds(90));
    }
}
