//! Task queue manager.
//!
//! Holds the ordered list of pending tasks. All mutations run under one
//! lock and end in a single commit: expired tasks are purged, the pending
//! notification is reissued (or cancelled when the queue is empty) and the
//! queue is saved. Listeners hear about removed tasks only after the lock is
//! released.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::notify::{NotificationSink, PENDING_NOTIFICATION_ID, PendingNotification};
use super::ordered::{ordered_insert, task_order};
use super::store::QueueStore;
use super::task::{PendingTask, RunMode, TaskOutcome, TaskOutcomeListener};
use crate::clock::SharedClock;
use crate::{Error, Result};

/// What an `add` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    /// The task of the family that is queued afterwards.
    pub kept: Uuid,
    /// Whether the new task entered the queue.
    pub inserted: bool,
    /// Family members removed in favour of `kept`.
    pub superseded: Vec<Uuid>,
}

impl AddOutcome {
    pub fn modified(&self) -> bool {
        self.inserted || !self.superseded.is_empty()
    }
}

type Departures = Vec<(PendingTask, TaskOutcome)>;

pub struct TaskQueueManager {
    tasks: Mutex<Vec<PendingTask>>,
    sink: Arc<dyn NotificationSink>,
    store: QueueStore,
    clock: SharedClock,
    listeners: DashMap<String, Arc<dyn TaskOutcomeListener>>,
}

impl TaskQueueManager {
    pub fn new(sink: Arc<dyn NotificationSink>, store: QueueStore, clock: SharedClock) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            sink,
            store,
            clock,
            listeners: DashMap::new(),
        }
    }

    /// Receive outcomes for tasks of `family_id`.
    pub fn register_listener(
        &self,
        family_id: impl Into<String>,
        listener: Arc<dyn TaskOutcomeListener>,
    ) {
        self.listeners.insert(family_id.into(), listener);
    }

    pub fn unregister_listener(&self, family_id: &str) {
        self.listeners.remove(family_id);
    }

    /// Restore the saved queue and reissue the notification.
    pub async fn load(&self) -> Result<usize> {
        let mut loaded = self.store.load().await?;
        loaded.sort_by(task_order);

        let (count, expired) = {
            let mut tasks = self.tasks.lock().await;
            *tasks = loaded;
            let expired = self.commit(&mut tasks, false).await;
            (tasks.len(), expired)
        };

        info!(count, "Loaded pending tasks");
        self.dispatch(expired).await;
        Ok(count)
    }

    /// Queue `task` according to `mode`.
    pub async fn add(&self, task: PendingTask, mode: RunMode) -> Result<AddOutcome> {
        let (outcome, departures) = {
            let mut tasks = self.tasks.lock().await;
            let (outcome, superseded) = match mode {
                RunMode::Multiple => Self::add_multiple(&mut tasks, task),
                RunMode::SingleKeepOldest | RunMode::SingleKeepNewest => {
                    Self::add_single(&mut tasks, task, mode)?
                }
            };

            let mut departures: Departures = superseded
                .into_iter()
                .map(|t| (t, TaskOutcome::Superseded))
                .collect();

            if outcome.modified() {
                let expired = self.commit(&mut tasks, outcome.inserted).await;
                departures.extend(expired);
            }
            (outcome, departures)
        };

        debug!(
            task_id = %outcome.kept,
            mode = %mode,
            inserted = outcome.inserted,
            superseded = outcome.superseded.len(),
            "Task queue add"
        );
        self.dispatch(departures).await;
        Ok(outcome)
    }

    fn add_multiple(
        tasks: &mut Vec<PendingTask>,
        task: PendingTask,
    ) -> (AddOutcome, Vec<PendingTask>) {
        let kept = task.id;
        let inserted = if tasks.iter().any(|t| t.id == task.id) {
            false
        } else {
            ordered_insert(tasks, task, task_order);
            true
        };

        (
            AddOutcome {
                kept,
                inserted,
                superseded: Vec::new(),
            },
            Vec::new(),
        )
    }

    fn add_single(
        tasks: &mut Vec<PendingTask>,
        task: PendingTask,
        mode: RunMode,
    ) -> Result<(AddOutcome, Vec<PendingTask>)> {
        // The new task is always a candidate, so there is always a keeper.
        let keeper = {
            let candidates = tasks
                .iter()
                .filter(|t| t.family_id == task.family_id)
                .chain(std::iter::once(&task));
            match mode {
                RunMode::SingleKeepOldest => candidates.min_by(|a, b| task_order(a, b)),
                _ => candidates.max_by(|a, b| task_order(a, b)),
            }
            .map(|t| t.id)
        };
        let kept = keeper.ok_or_else(|| {
            Error::QueueInvariant(format!("no task of family {} survived", task.family_id))
        })?;

        let (superseded, remaining): (Vec<_>, Vec<_>) = std::mem::take(tasks)
            .into_iter()
            .partition(|t| t.family_id == task.family_id && t.id != kept);
        *tasks = remaining;

        let inserted = kept == task.id && !tasks.iter().any(|t| t.id == kept);
        if inserted {
            ordered_insert(tasks, task, task_order);
        }

        Ok((
            AddOutcome {
                kept,
                inserted,
                superseded: superseded.iter().map(|t| t.id).collect(),
            },
            superseded,
        ))
    }

    /// Remove every task matching `predicate`. Returns whether any was removed.
    pub async fn remove_all<F>(&self, predicate: F) -> bool
    where
        F: Fn(&PendingTask) -> bool + Send,
    {
        self.remove_with(predicate, None).await > 0
    }

    pub async fn remove_family(&self, family_id: &str) -> bool {
        self.remove_all(|t| t.family_id == family_id).await
    }

    /// Remove all tasks belonging to a plan.
    pub async fn remove_plan(&self, plan_id: &str) -> bool {
        self.remove_all(|t| t.plan_id == plan_id).await
    }

    /// The user completed a task.
    pub async fn complete(&self, task_id: Uuid) -> bool {
        self.remove_with(|t| t.id == task_id, Some(TaskOutcome::Completed))
            .await
            > 0
    }

    /// The user dismissed a task.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        self.remove_with(|t| t.id == task_id, Some(TaskOutcome::Cancelled))
            .await
            > 0
    }

    pub async fn clear(&self) -> bool {
        self.remove_all(|_| true).await
    }

    async fn remove_with<F>(&self, predicate: F, outcome: Option<TaskOutcome>) -> usize
    where
        F: Fn(&PendingTask) -> bool + Send,
    {
        let (removed_count, departures) = {
            let mut tasks = self.tasks.lock().await;
            let (removed, remaining): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *tasks).into_iter().partition(|t| predicate(t));
            *tasks = remaining;

            if removed.is_empty() {
                return 0;
            }

            let removed_count = removed.len();
            let mut departures: Departures = match outcome {
                Some(outcome) => removed.into_iter().map(|t| (t, outcome)).collect(),
                None => Vec::new(),
            };
            departures.extend(self.commit(&mut tasks, false).await);
            (removed_count, departures)
        };

        debug!(count = removed_count, "Removed pending tasks");
        self.dispatch(departures).await;
        removed_count
    }

    /// Drop expired tasks. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let expired = {
            let mut tasks = self.tasks.lock().await;
            if !tasks.iter().any(|t| t.is_expired(now)) {
                return 0;
            }
            self.commit(&mut tasks, false).await
        };

        let count = expired.len();
        if count > 0 {
            info!(count, "Purged expired tasks");
        }
        self.dispatch(expired).await;
        count
    }

    /// Purge, renotify and persist. Runs with the queue lock held.
    async fn commit(&self, tasks: &mut Vec<PendingTask>, alert: bool) -> Departures {
        let now = self.clock.now();
        let (expired, live): (Vec<_>, Vec<_>) =
            std::mem::take(tasks).into_iter().partition(|t| t.is_expired(now));
        *tasks = live;

        self.renotify(tasks, alert).await;

        if let Err(e) = self.store.save(tasks).await {
            warn!(error = %e, "Failed to persist task queue");
        }

        expired
            .into_iter()
            .map(|t| (t, TaskOutcome::Expired))
            .collect()
    }

    async fn renotify(&self, tasks: &[PendingTask], alert: bool) {
        let result = match PendingNotification::for_tasks(tasks, alert) {
            Some(notification) => self.sink.issue(notification).await,
            None => self.sink.cancel(PENDING_NOTIFICATION_ID).await,
        };

        if let Err(e) = result {
            warn!(error = %e, "Failed to update pending task notification");
        }
    }

    /// Tell listeners about departed tasks. Each task is reported once.
    async fn dispatch(&self, departures: Departures) {
        let mut seen = HashSet::new();
        for (task, outcome) in departures {
            if !seen.insert(task.id) {
                continue;
            }
            let listener = self
                .listeners
                .get(&task.family_id)
                .map(|entry| Arc::clone(entry.value()));
            if let Some(listener) = listener {
                listener.on_outcome(&task, outcome).await;
            }
        }
    }

    /// Queued tasks that have not expired yet. Expired tasks stay in the
    /// queue until the next purge but are never reported here.
    pub async fn snapshot(&self) -> Vec<PendingTask> {
        let now = self.clock.now();
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| !t.is_expired(now))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| !t.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn next_expiration(&self) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.tasks
            .lock()
            .await
            .iter()
            .filter_map(|t| t.expires_at)
            .filter(|&expires_at| expires_at > now)
            .min()
    }
}
