//! Tokio-backed scheduler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::task::{EntryRecord, EntryStatus, ScheduleEntry};
use super::{Firing, ScheduleHandle, ScheduledEvent, SchedulerAnomaly, TaskScheduler};
use crate::clock::SharedClock;

/// Scheduler that runs one tokio task per entry.
///
/// Must be used from within a tokio runtime.
pub struct TokioScheduler {
    entries: Arc<DashMap<ScheduleHandle, EntryRecord>>,
    firing_tx: mpsc::UnboundedSender<Firing>,
    clock: SharedClock,
    cancellation_token: CancellationToken,
}

impl TokioScheduler {
    /// Create a scheduler and the receiver its firings are delivered on.
    pub fn new(clock: SharedClock) -> (Self, mpsc::UnboundedReceiver<Firing>) {
        let (firing_tx, firing_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            entries: Arc::new(DashMap::new()),
            firing_tx,
            clock,
            cancellation_token: CancellationToken::new(),
        };
        (scheduler, firing_rx)
    }

    /// Cancel every entry.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.entries.clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cap for delays too large to represent as an instant.
const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl TaskScheduler for TokioScheduler {
    fn schedule(
        &self,
        delay: Duration,
        repeat: Option<Duration>,
        event: ScheduledEvent,
    ) -> ScheduleHandle {
        let repeat = repeat.filter(|interval| !interval.is_zero());
        let handle = ScheduleHandle::new();
        let due = due_after(self.clock.now(), delay);
        let record = EntryRecord::new(event.clone(), repeat, due, &self.cancellation_token);
        let token = record.cancellation_token.clone();
        self.entries.insert(handle.clone(), record);

        debug!(handle = %handle, event = %event, delay_secs = delay.as_secs(), "Scheduled entry");

        let entries = Arc::clone(&self.entries);
        let firing_tx = self.firing_tx.clone();
        let clock = Arc::clone(&self.clock);
        let task_handle = handle.clone();

        tokio::spawn(async move {
            let handle = task_handle;
            let mut deadline = Instant::now() + delay.min(MAX_DELAY);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        trace!(handle = %handle, "Scheduled entry cancelled");
                        break;
                    }
                    _ = tokio::time::sleep_until(deadline) => {}
                }

                let scheduled_for = match repeat {
                    None => match entries.remove(&handle) {
                        Some((_, record)) => record.next_execution,
                        None => break,
                    },
                    Some(interval) => {
                        let Some(mut record) = entries.get_mut(&handle) else {
                            break;
                        };
                        let due = record.next_execution;

                        // Next due time follows the previous one, not the handling time.
                        deadline += interval.min(MAX_DELAY);
                        let now = Instant::now();
                        if deadline < now {
                            deadline = now;
                        }
                        record.next_execution =
                            Some(due_after(clock.now(), deadline.saturating_duration_since(now)));
                        record.status = EntryStatus::Fired;
                        record.fire_count += 1;
                        due
                    }
                };

                let firing = Firing {
                    handle: handle.clone(),
                    event: event.clone(),
                    scheduled_for: scheduled_for.unwrap_or_else(|| clock.now()),
                    fired_at: clock.now(),
                };

                if firing_tx.send(firing).is_err() {
                    debug!(handle = %handle, "Firing receiver dropped, releasing entry");
                    entries.remove(&handle);
                    break;
                }

                if repeat.is_none() {
                    break;
                }
            }
        });

        handle
    }

    fn cancel(&self, handle: &ScheduleHandle) -> bool {
        match self.entries.remove(handle) {
            Some((_, record)) => {
                record.cancellation_token.cancel();
                debug!(handle = %handle, event = %record.event, "Cancelled entry");
                true
            }
            None => false,
        }
    }

    fn contains(&self, handle: &ScheduleHandle) -> bool {
        self.entries.contains_key(handle)
    }

    fn next_execution(&self, handle: &ScheduleHandle) -> Option<DateTime<Utc>> {
        self.entries
            .get(handle)
            .and_then(|record| record.next_execution)
    }

    fn entries(&self) -> Vec<ScheduleEntry> {
        self.entries
            .iter()
            .map(|item| item.value().snapshot(item.key()))
            .collect()
    }

    fn inspect(&self, now: DateTime<Utc>, tolerance: Duration) -> Vec<SchedulerAnomaly> {
        super::inspect_entries(&self.entries(), now, tolerance)
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn scheduler() -> (TokioScheduler, mpsc::UnboundedReceiver<Firing>) {
        TokioScheduler::new(Arc::new(SystemClock))
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once_and_is_released() {
        let (scheduler, mut rx) = scheduler();
        let handle = scheduler.schedule(
            Duration::from_secs(10),
            None,
            ScheduledEvent::StartPlan("p".into()),
        );
        assert!(scheduler.contains(&handle));
        assert!(scheduler.next_execution(&handle).is_some());

        let firing = rx.recv().await.unwrap();
        assert_eq!(firing.handle, handle);
        assert_eq!(firing.event, ScheduledEvent::StartPlan("p".into()));
        assert!(!scheduler.contains(&handle));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_repeat_is_one_shot() {
        let (scheduler, mut rx) = scheduler();
        let handle = scheduler.schedule(
            Duration::from_secs(1),
            Some(Duration::ZERO),
            ScheduledEvent::HealthTest,
        );
        rx.recv().await.unwrap();
        assert!(!scheduler.contains(&handle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_entry_keeps_cadence() {
        let (scheduler, mut rx) = scheduler();
        let start = Instant::now();
        let handle = scheduler.schedule(
            Duration::from_secs(5),
            Some(Duration::from_secs(5)),
            ScheduledEvent::HealthTest,
        );

        for expected in [5u64, 10, 15] {
            let firing = rx.recv().await.unwrap();
            assert_eq!(firing.handle, handle);
            assert_eq!(start.elapsed().as_secs(), expected);
        }

        assert!(scheduler.contains(&handle));
        let entry = scheduler
            .entries()
            .into_iter()
            .find(|e| e.handle == handle)
            .unwrap();
        assert_eq!(entry.fire_count, 3);
        assert_eq!(entry.status, EntryStatus::Fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_prevents_firing() {
        let (scheduler, mut rx) = scheduler();
        let handle = scheduler.schedule(
            Duration::from_secs(10),
            None,
            ScheduledEvent::StopPlan("p".into()),
        );

        assert!(scheduler.cancel(&handle));
        assert!(!scheduler.cancel(&handle));
        assert!(!scheduler.contains(&handle));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inspect_reports_duplicate_health_tests() {
        let (scheduler, _rx) = scheduler();
        let interval = Some(Duration::from_secs(60));
        scheduler.schedule(Duration::from_secs(60), interval, ScheduledEvent::HealthTest);
        scheduler.schedule(Duration::from_secs(60), interval, ScheduledEvent::HealthTest);

        let anomalies = scheduler.inspect(Utc::now(), Duration::from_secs(60));
        assert_eq!(anomalies.len(), 1);
        assert!(matches!(anomalies[0], SchedulerAnomaly::Duplicate { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let (scheduler, mut rx) = scheduler();
        scheduler.schedule(Duration::from_secs(1), None, ScheduledEvent::HealthTest);
        scheduler.schedule(
            Duration::from_secs(2),
            Some(Duration::from_secs(2)),
            ScheduledEvent::HealthTest,
        );
        scheduler.shutdown();
        assert!(scheduler.is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
