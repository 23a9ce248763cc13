//! Scheduled entry definitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::{ScheduleHandle, ScheduledEvent};

/// Status of a scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Waiting for its next due time.
    Pending,
    /// Delivered at least once. One-shot entries are released right after.
    Fired,
}

/// Snapshot of a scheduled entry.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub handle: ScheduleHandle,
    pub event: ScheduledEvent,
    pub repeat: Option<Duration>,
    pub next_execution: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    pub fire_count: u64,
}

/// Live bookkeeping for an entry owned by the timer.
#[derive(Debug)]
pub(crate) struct EntryRecord {
    pub event: ScheduledEvent,
    pub repeat: Option<Duration>,
    pub next_execution: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    pub fire_count: u64,
    pub cancellation_token: CancellationToken,
}

impl EntryRecord {
    pub fn new(
        event: ScheduledEvent,
        repeat: Option<Duration>,
        next_execution: DateTime<Utc>,
        parent_token: &CancellationToken,
    ) -> Self {
        Self {
            event,
            repeat,
            next_execution: Some(next_execution),
            status: EntryStatus::Pending,
            fire_count: 0,
            cancellation_token: parent_token.child_token(),
        }
    }

    pub fn snapshot(&self, handle: &ScheduleHandle) -> ScheduleEntry {
        ScheduleEntry {
            handle: handle.clone(),
            event: self.event.clone(),
            repeat: self.repeat,
            next_execution: self.next_execution,
            status: self.status,
            fire_count: self.fire_count,
        }
    }
}
