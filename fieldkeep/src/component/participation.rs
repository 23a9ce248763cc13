//! Rolling participation window.
//!
//! An adapter "participates" each time a system-initiated health test finds
//! it healthy. Its rate is the number of such successes inside the horizon
//! divided by the number of tests the horizon should contain, capped at 1.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct ParticipationTracker {
    horizon: chrono::Duration,
    successes: VecDeque<DateTime<Utc>>,
}

impl ParticipationTracker {
    pub fn new(horizon: chrono::Duration) -> Self {
        Self {
            horizon,
            successes: VecDeque::new(),
        }
    }

    pub fn horizon(&self) -> chrono::Duration {
        self.horizon
    }

    /// Append a success and drop entries older than the horizon.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.successes.push_back(now);
        self.prune(now);
    }

    /// Drop entries older than `now - horizon`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.horizon;
        while let Some(oldest) = self.successes.front() {
            if *oldest < cutoff {
                self.successes.pop_front();
            } else {
                break;
            }
        }
    }

    /// Successes that fall inside the horizon ending at `now`.
    pub fn successes_within(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.horizon;
        self.successes.iter().filter(|t| **t >= cutoff).count()
    }

    /// Oldest retained success.
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.successes.front().copied()
    }

    pub fn len(&self) -> usize {
        self.successes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.successes.is_empty()
    }

    /// Participation rate in `[0, 1]` given the health-test interval.
    pub fn rate(&self, now: DateTime<Utc>, test_interval: Duration) -> f64 {
        let interval_secs = test_interval.as_secs_f64();
        let horizon_secs = self.horizon.num_milliseconds() as f64 / 1000.0;
        if interval_secs <= 0.0 || horizon_secs <= 0.0 {
            return 0.0;
        }

        let expected = horizon_secs / interval_secs;
        if expected <= 0.0 {
            return 0.0;
        }

        (self.successes_within(now) as f64 / expected).min(1.0)
    }
}

/// Average of the rates reported by a plan's adapters; `1.0` when none report.
pub fn plan_participation<I>(rates: I) -> f64
where
    I: IntoIterator<Item = Option<f64>>,
{
    let (sum, count) = rates
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(sum, count), rate| (sum + rate, count + 1));

    if count == 0 { 1.0 } else { sum / count as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_drops_entries_outside_horizon() {
        let start = Utc::now();
        let mut tracker = ParticipationTracker::new(chrono::Duration::hours(1));

        tracker.record_success(start);
        tracker.record_success(start + chrono::Duration::minutes(30));
        tracker.record_success(start + chrono::Duration::minutes(61));

        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.oldest(), Some(start + chrono::Duration::minutes(30)));
    }

    #[test]
    fn test_entry_at_exact_cutoff_is_kept() {
        let start = Utc::now();
        let mut tracker = ParticipationTracker::new(chrono::Duration::minutes(10));
        tracker.record_success(start);
        tracker.record_success(start + chrono::Duration::minutes(10));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_rate_is_capped() {
        let now = Utc::now();
        let mut tracker = ParticipationTracker::new(chrono::Duration::minutes(10));
        for i in 0..20 {
            tracker.record_success(now - chrono::Duration::seconds(i * 10));
        }

        // Ten 60s tests expected in the horizon, twenty recorded.
        let rate = tracker.rate(now, Duration::from_secs(60));
        assert_eq!(rate, 1.0);
    }

    #[test]
    fn test_rate_partial() {
        let now = Utc::now();
        let mut tracker = ParticipationTracker::new(chrono::Duration::minutes(10));
        tracker.record_success(now - chrono::Duration::minutes(2));
        tracker.record_success(now - chrono::Duration::minutes(1));

        let rate = tracker.rate(now, Duration::from_secs(60));
        assert!((rate - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_plan_participation_mean_or_one() {
        assert_eq!(plan_participation(Vec::<Option<f64>>::new()), 1.0);
        assert_eq!(plan_participation(vec![None, None]), 1.0);
        assert_eq!(plan_participation(vec![Some(0.5), None, Some(1.0)]), 0.75);
    }
}
