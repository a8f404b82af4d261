//! Dream cadence: when the next invitation is due and how long a dream lasts.

use chrono::{DateTime, Duration, Utc};
use cognos_kernel::config::SchedulerConfig;

/// What happened to a deferred invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationDecision {
    /// Postponed to the given time.
    Postponed(DateTime<Utc>),
    /// Too late to postpone; the dream starts.
    Accepted,
}

/// Dream timing state.
#[derive(Debug, Clone)]
pub struct DreamSchedule {
    interval: Duration,
    duration: Duration,
    step: Duration,
    window: Duration,
    due_at: DateTime<Utc>,
    first_due_at: DateTime<Utc>,
    ends_at: Option<DateTime<Utc>>,
    dreams: u64,
}

impl DreamSchedule {
    /// First invitation is due one interval after `start`.
    #[must_use]
    pub fn new(config: &SchedulerConfig, start: DateTime<Utc>) -> Self {
        let interval = secs(config.dream_interval_secs);
        Self {
            interval,
            duration: secs(config.dream_duration_secs),
            step: secs(config.dream_deferral_step_secs),
            window: secs(config.dream_deferral_window_secs),
            due_at: start + interval,
            first_due_at: start + interval,
            ends_at: None,
            dreams: 0,
        }
    }

    /// Whether an invitation should be issued.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_none() && now >= self.due_at
    }

    /// Next due time.
    #[must_use]
    pub const fn due_at(&self) -> DateTime<Utc> {
        self.due_at
    }

    /// Handles a DEFER of the invitation.
    ///
    /// Postpones by one step while `now` is still inside the window measured
    /// from the original due time; past the window the invitation stands.
    pub fn defer(&mut self, now: DateTime<Utc>) -> InvitationDecision {
        if now - self.first_due_at < self.window {
            self.due_at = now + self.step;
            InvitationDecision::Postponed(self.due_at)
        } else {
            InvitationDecision::Accepted
        }
    }

    /// Marks the dream as started.
    pub fn begin(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ends_at = now + self.duration;
        self.ends_at = Some(ends_at);
        self.dreams += 1;
        ends_at
    }

    /// Whether a started dream has run its course.
    #[must_use]
    pub fn is_over(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|ends_at| now >= ends_at)
    }

    /// Ends the dream and schedules the next invitation.
    pub fn end(&mut self, now: DateTime<Utc>) {
        self.ends_at = None;
        self.due_at = now + self.interval;
        self.first_due_at = self.due_at;
    }

    /// Dreams started so far.
    #[must_use]
    pub const fn dreams(&self) -> u64 {
        self.dreams
    }
}

const MAX_SECS: i64 = 100 * 365 * 86_400;

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).map_or(MAX_SECS, |secs| secs.min(MAX_SECS)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            dream_interval_secs: 600,
            dream_duration_secs: 60,
            dream_deferral_step_secs: 30,
            dream_deferral_window_secs: 90,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn deferral_is_bounded_by_window() {
        let start = Utc::now();
        let mut schedule = DreamSchedule::new(&config(), start);
        assert!(!schedule.is_due(start));
        let due = start + Duration::seconds(600);
        assert!(schedule.is_due(due));

        assert_eq!(
            schedule.defer(due),
            InvitationDecision::Postponed(due + Duration::seconds(30))
        );
        assert!(!schedule.is_due(due + Duration::seconds(10)));
        let late = due + Duration::seconds(60);
        assert!(matches!(schedule.defer(late), InvitationDecision::Postponed(_)));
        assert_eq!(schedule.defer(due + Duration::seconds(91)), InvitationDecision::Accepted);
    }

    #[test]
    fn dream_runs_for_duration_then_reschedules() {
        let start = Utc::now();
        let mut schedule = DreamSchedule::new(&config(), start);
        let began = start + Duration::seconds(600);
        let ends = schedule.begin(began);
        assert!(!schedule.is_due(ends));
        assert!(!schedule.is_over(began + Duration::seconds(59)));
        assert!(schedule.is_over(ends));
        schedule.end(ends);
        assert_eq!(schedule.due_at(), ends + Duration::seconds(600));
        assert_eq!(schedule.dreams(), 1);
    }
}
