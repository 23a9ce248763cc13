//! Scheduled task provider.
//!
//! Plans register delayed and repeating events here (scheduled starts and
//! stops, the health-test loop). Firings are not callbacks: the scheduler
//! delivers each one as a [`Firing`] on a channel and the orchestrator run
//! loop dispatches it.

mod task;
mod timer;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use task::{EntryStatus, ScheduleEntry};
pub use timer::TokioScheduler;

/// Opaque identifier of a scheduled entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleHandle(Uuid);

impl ScheduleHandle {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ScheduleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a scheduled entry does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduledEvent {
    /// The recurring supervision pass over all running plans.
    HealthTest,
    /// A deferred start of the given plan.
    StartPlan(String),
    /// A deferred stop of the given plan.
    StopPlan(String),
}

impl ScheduledEvent {
    /// The plan this event targets, if any.
    pub fn plan_id(&self) -> Option<&str> {
        match self {
            Self::HealthTest => None,
            Self::StartPlan(id) | Self::StopPlan(id) => Some(id),
        }
    }
}

impl fmt::Display for ScheduledEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HealthTest => write!(f, "health-test"),
            Self::StartPlan(id) => write!(f, "start:{}", id),
            Self::StopPlan(id) => write!(f, "stop:{}", id),
        }
    }
}

/// A delivered firing.
#[derive(Debug, Clone)]
pub struct Firing {
    pub handle: ScheduleHandle,
    pub event: ScheduledEvent,
    /// When the entry was due.
    pub scheduled_for: DateTime<Utc>,
    /// When the firing was emitted.
    pub fired_at: DateTime<Utc>,
}

/// Problems found by [`TaskScheduler::inspect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerAnomaly {
    /// An entry is past due by more than the tolerance and has not fired.
    Overdue {
        handle: ScheduleHandle,
        event: ScheduledEvent,
        late_by: chrono::Duration,
    },
    /// A pending entry has no next execution time.
    MissingNextExecution {
        handle: ScheduleHandle,
        event: ScheduledEvent,
    },
    /// A one-shot entry already fired but was never released.
    Lingering {
        handle: ScheduleHandle,
        event: ScheduledEvent,
    },
    /// More than one live entry carries the same event.
    Duplicate {
        event: ScheduledEvent,
        handles: Vec<ScheduleHandle>,
    },
}

impl fmt::Display for SchedulerAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overdue {
                handle,
                event,
                late_by,
            } => write!(
                f,
                "entry {} ({}) is {}s overdue",
                handle,
                event,
                late_by.num_seconds()
            ),
            Self::MissingNextExecution { handle, event } => {
                write!(f, "entry {} ({}) has no next execution", handle, event)
            }
            Self::Lingering { handle, event } => {
                write!(f, "entry {} ({}) fired but was not released", handle, event)
            }
            Self::Duplicate { event, handles } => {
                write!(f, "{} entries scheduled for {}", handles.len(), event)
            }
        }
    }
}

/// Delay/repeat timer service.
///
/// `repeat` of `None` or zero schedules a one-shot entry. Repeating entries
/// fire on a fixed cadence measured from the previous due time, not from
/// when the previous firing was handled. Cancellation is idempotent.
pub trait TaskScheduler: Send + Sync {
    fn schedule(
        &self,
        delay: Duration,
        repeat: Option<Duration>,
        event: ScheduledEvent,
    ) -> ScheduleHandle;

    /// Cancel an entry. Returns `true` if it was still registered.
    fn cancel(&self, handle: &ScheduleHandle) -> bool;

    fn contains(&self, handle: &ScheduleHandle) -> bool;

    fn next_execution(&self, handle: &ScheduleHandle) -> Option<DateTime<Utc>>;

    /// Snapshot of all live entries.
    fn entries(&self) -> Vec<ScheduleEntry>;

    /// Self-test of the scheduler's bookkeeping.
    fn inspect(&self, now: DateTime<Utc>, tolerance: Duration) -> Vec<SchedulerAnomaly>;
}

/// Shared `inspect` logic over an entry snapshot.
pub(crate) fn inspect_entries(
    entries: &[ScheduleEntry],
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Vec<SchedulerAnomaly> {
    let tolerance = chrono::Duration::from_std(tolerance).unwrap_or(chrono::Duration::MAX);
    let mut anomalies = Vec::new();
    let mut by_event: std::collections::HashMap<&ScheduledEvent, Vec<ScheduleHandle>> =
        std::collections::HashMap::new();

    for entry in entries {
        by_event
            .entry(&entry.event)
            .or_default()
            .push(entry.handle.clone());

        if entry.status == EntryStatus::Fired && entry.repeat.is_none() {
            anomalies.push(SchedulerAnomaly::Lingering {
                handle: entry.handle.clone(),
                event: entry.event.clone(),
            });
            continue;
        }

        match entry.next_execution {
            None => anomalies.push(SchedulerAnomaly::MissingNextExecution {
                handle: entry.handle.clone(),
                event: entry.event.clone(),
            }),
            Some(due) => {
                let late_by = now - due;
                if late_by > tolerance {
                    anomalies.push(SchedulerAnomaly::Overdue {
                        handle: entry.handle.clone(),
                        event: entry.event.clone(),
                        late_by,
                    });
                }
            }
        }
    }

    for (event, handles) in by_event {
        if handles.len() > 1 {
            anomalies.push(SchedulerAnomaly::Duplicate {
                event: event.clone(),
                handles,
            });
        }
    }

    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(event: ScheduledEvent, next: Option<DateTime<Utc>>) -> ScheduleEntry {
        ScheduleEntry {
            handle: ScheduleHandle::new(),
            event,
            repeat: None,
            next_execution: next,
            status: EntryStatus::Pending,
            fire_count: 0,
        }
    }

    #[test]
    fn test_inspect_flags_overdue_and_missing() {
        let now = Utc::now();
        let entries = vec![
            entry(
                ScheduledEvent::StartPlan("a".into()),
                Some(now - chrono::Duration::minutes(5)),
            ),
            entry(ScheduledEvent::StopPlan("a".into()), None),
            entry(
                ScheduledEvent::StartPlan("b".into()),
                Some(now + chrono::Duration::minutes(5)),
            ),
        ];

        let anomalies = inspect_entries(&entries, now, Duration::from_secs(60));

        assert_eq!(anomalies.len(), 2);
        assert!(
            anomalies
                .iter()
                .any(|a| matches!(a, SchedulerAnomaly::Overdue { .. }))
        );
        assert!(
            anomalies
                .iter()
                .any(|a| matches!(a, SchedulerAnomaly::MissingNextExecution { .. }))
        );
    }

    #[test]
    fn test_inspect_flags_duplicates_and_lingering() {
        let now = Utc::now();
        let soon = Some(now + chrono::Duration::seconds(30));
        let mut fired = entry(ScheduledEvent::StopPlan("x".into()), soon);
        fired.status = EntryStatus::Fired;
        let entries = vec![
            entry(ScheduledEvent::HealthTest, soon),
            entry(ScheduledEvent::HealthTest, soon),
            fired,
        ];

        let anomalies = inspect_entries(&entries, now, Duration::from_secs(60));

        assert!(anomalies.iter().any(|a| matches!(
            a,
            SchedulerAnomaly::Duplicate { event: ScheduledEvent::HealthTest, handles }
                if handles.len() == 2
        )));
        assert!(
            anomalies
                .iter()
                .any(|a| matches!(a, SchedulerAnomaly::Lingering { .. }))
        );
    }

    #[test]
    fn test_event_plan_id() {
        assert_eq!(ScheduledEvent::HealthTest.plan_id(), None);
        assert_eq!(ScheduledEvent::StopPlan("p".into()).plan_id(), Some("p"));
    }
}
