//! Adapter that writes a heartbeat sample on a fixed interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::periodic::PeriodicWorker;
use crate::clock::SharedClock;
use crate::component::{Component, ComponentResult, HealthReport, LocalStore, Record};
use crate::error::ComponentError;

pub struct HeartbeatSource {
    name: String,
    plan_id: String,
    enabled: bool,
    local_store: Arc<dyn LocalStore>,
    clock: SharedClock,
    beats: Arc<AtomicU64>,
    worker: PeriodicWorker,
}

impl HeartbeatSource {
    pub fn new(
        name: impl Into<String>,
        plan_id: impl Into<String>,
        interval: Duration,
        local_store: Arc<dyn LocalStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            plan_id: plan_id.into(),
            enabled: true,
            local_store,
            worker: PeriodicWorker::new(interval, Arc::clone(&clock)),
            clock,
            beats: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Heartbeats written since creation.
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Component for HeartbeatSource {
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
        let store = Arc::clone(&self.local_store);
        let clock = Arc::clone(&self.clock);
        let beats = Arc::clone(&self.beats);
        let plan_id = self.plan_id.clone();
        let source = self.name.clone();

        self.worker.start(&self.name, move || {
            let store = Arc::clone(&store);
            let beats = Arc::clone(&beats);
            let record = Record::sample(
                plan_id.clone(),
                source.clone(),
                clock.now(),
                serde_json::json!({ "beat": beats.load(Ordering::SeqCst) + 1 }),
            );
            async move {
                store.write_record(record).await?;
                beats.fetch_add(1, Ordering::SeqCst);
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
            .with_diagnostic("beats", self.beats().to_string()))
    }
}
