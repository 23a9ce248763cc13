//! Adapter that periodically asks the user to do something.
//!
//! Each tick queues a [`PendingTask`] in the task queue under the source's
//! family, using the configured run mode and expiry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::periodic::PeriodicWorker;
use crate::clock::SharedClock;
use crate::component::{Component, ComponentResult, HealthReport};
use crate::error::ComponentError;
use crate::queue::{PendingTask, RunMode, TaskQueueManager};

/// What each prompt looks like in the queue.
#[derive(Debug, Clone)]
pub struct PromptSettings {
    pub title: String,
    pub run_mode: RunMode,
    pub expires_after: Option<chrono::Duration>,
    pub priority: i32,
}

pub struct PromptSource {
    name: String,
    plan_id: String,
    enabled: bool,
    settings: PromptSettings,
    queue: Arc<TaskQueueManager>,
    clock: SharedClock,
    issued: Arc<AtomicU64>,
    worker: PeriodicWorker,
}

impl PromptSource {
    pub fn new(
        name: impl Into<String>,
        plan_id: impl Into<String>,
        interval: Duration,
        settings: PromptSettings,
        queue: Arc<TaskQueueManager>,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            plan_id: plan_id.into(),
            enabled: true,
            settings,
            queue,
            worker: PeriodicWorker::new(interval, Arc::clone(&clock)),
            clock,
            issued: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Family shared by every task this source queues.
    pub fn family_id(&self) -> String {
        format!("{}/{}", self.plan_id, self.name)
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Component for PromptSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    async fn start(&self) -> ComponentResult<()> {
        let queue = Arc::clone(&self.queue);
        let clock = Arc::clone(&self.clock);
        let issued = Arc::clone(&self.issued);
        let settings = self.settings.clone();
        let family_id = self.family_id();
        let plan_id = self.plan_id.clone();

        self.worker.start(&self.name, move || {
            let queue = Arc::clone(&queue);
            let issued = Arc::clone(&issued);
            let mode = settings.run_mode;

            let now = clock.now();
            let mut task = PendingTask::new(
                family_id.clone(),
                plan_id.clone(),
                settings.title.clone(),
                now,
            )
            .with_priority(settings.priority);
            if let Some(expires_at) = settings
                .expires_after
                .and_then(|ttl| now.checked_add_signed(ttl))
            {
                task = task.with_expiration(expires_at);
            }

            async move {
                let outcome = queue.add(task, mode).await.map_err(ComponentError::from)?;
                if outcome.inserted {
                    issued.fetch_add(1, Ordering::SeqCst);
                }
                debug!(task_id = %outcome.kept, inserted = outcome.inserted, "Prompt queued");
                Ok::<_, ComponentError>(())
            }
        });
        Ok(())
    }

    async fn stop(&self) -> ComponentResult<()> {
        self.worker.stop().await;
        Ok(())
    }

    async fn test_health(&self) -> ComponentResult<HealthReport> {
        Ok(self
            .worker
            .check()
            .with_diagnostic("issued", self.issued().to_string()))
    }
}
