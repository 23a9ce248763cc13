//! Orchestrator context.
//!
//! Owns the plan registry, the scheduler, the health monitor and the task
//! queue, and routes scheduler firings to them. Constructed once in `main`
//! and shared behind an `Arc`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::OrchestratorConfig;
use crate::health::{HealthMonitor, HealthTestOrigin, PlanHealthReport};
use crate::plan::{
    CollectionPlan, PlanContext, PlanController, PlanRegistry, PlanRunState, PlanStatus,
    RunStateStore, SequenceReport, StartOutcome,
};
use crate::queue::{NotificationSink, QueueStore, TaskQueueManager};
use crate::scheduler::{
    Firing, ScheduleEntry, ScheduleHandle, ScheduledEvent, SchedulerAnomaly, TaskScheduler,
    TokioScheduler,
};
use crate::utils::fs;
use crate::Result;

/// Services the orchestrator is built from.
pub struct OrchestratorParts {
    pub clock: SharedClock,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub queue: Arc<TaskQueueManager>,
    pub run_states: Arc<RunStateStore>,
}

/// Push token as last requested, and whether the fan-out still owes a retry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTokenState {
    pub token: Option<String>,
    pub pending_refresh: bool,
}

/// What one health-test firing did.
#[derive(Debug, Default)]
pub struct SupervisionReport {
    pub plans: Vec<PlanHealthReport>,
    pub anomalies: Vec<SchedulerAnomaly>,
    /// Orphaned or duplicate scheduler entries that were cancelled.
    pub cancelled_entries: usize,
    pub purged_tasks: usize,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    clock: SharedClock,
    scheduler: Arc<dyn TaskScheduler>,
    registry: PlanRegistry,
    queue: Arc<TaskQueueManager>,
    monitor: HealthMonitor,
    run_states: Arc<RunStateStore>,
    health_handle: Mutex<Option<ScheduleHandle>>,
    push_token: Mutex<PushTokenState>,
    cancellation_token: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, parts: OrchestratorParts) -> Self {
        let monitor = HealthMonitor::new(
            Arc::clone(&parts.clock),
            config.component_test_timeout,
            config.component_restart_timeout,
            config.restart_tracker.clone(),
        );

        Self {
            config,
            clock: parts.clock,
            scheduler: parts.scheduler,
            registry: PlanRegistry::new(),
            queue: parts.queue,
            monitor,
            run_states: parts.run_states,
            health_handle: Mutex::new(None),
            push_token: Mutex::new(PushTokenState::default()),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Build an orchestrator backed by the on-disk stores under `data_dir`.
    ///
    /// Returns the receiver the scheduler delivers firings on; pass it to
    /// [`run`](Self::run).
    pub async fn bootstrap(
        config: OrchestratorConfig,
        clock: SharedClock,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Firing>)> {
        fs::ensure_dir_all(&config.data_dir).await?;

        let (scheduler, firings) = TokioScheduler::new(Arc::clone(&clock));
        let run_states = Arc::new(RunStateStore::load(config.run_state_path()).await?);
        let queue = Arc::new(TaskQueueManager::new(
            sink,
            QueueStore::new(config.queue_path()),
            Arc::clone(&clock),
        ));
        queue.load().await?;

        let push_token = fs::read_json_optional::<PushTokenState>(&config.push_token_path())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Discarding unreadable push token state");
                None
            })
            .unwrap_or_default();

        let orchestrator = Self::new(
            config,
            OrchestratorParts {
                clock,
                scheduler: Arc::new(scheduler),
                queue,
                run_states,
            },
        );
        *orchestrator.push_token.lock() = push_token;

        Ok((Arc::new(orchestrator), firings))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueueManager> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.scheduler
    }

    pub fn registry(&self) -> &PlanRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    fn plan_context(&self) -> PlanContext {
        PlanContext {
            scheduler: Arc::clone(&self.scheduler),
            run_states: Arc::clone(&self.run_states),
            clock: Arc::clone(&self.clock),
            health_test_interval: self.config.health_test_interval,
        }
    }

    // ---- plans ----

    /// Register a plan. It starts out stopped.
    pub fn add_plan(&self, plan: CollectionPlan) -> Result<Arc<PlanController>> {
        let controller = Arc::new(PlanController::new(plan, self.plan_context()));
        self.registry.register(Arc::clone(&controller))?;
        info!(plan_id = %controller.id(), name = %controller.name(), "Plan registered");
        Ok(controller)
    }

    pub fn plan(&self, id: &str) -> Result<Arc<PlanController>> {
        self.registry.require(id)
    }

    pub async fn start_plan(&self, id: &str, immediate: bool) -> Result<StartOutcome> {
        let plan = self.registry.require(id)?;
        let outcome = plan.start(immediate).await?;

        if matches!(outcome, StartOutcome::Started(_)) {
            self.send_push_token_to(&plan).await;
        }
        Ok(outcome)
    }

    pub async fn stop_plan(&self, id: &str) -> Result<SequenceReport> {
        let plan = self.registry.require(id)?;
        Ok(plan.stop().await)
    }

    pub async fn pause_plan(&self, id: &str) -> Result<SequenceReport> {
        self.registry.require(id)?.pause().await
    }

    pub async fn resume_plan(&self, id: &str) -> Result<SequenceReport> {
        self.registry.require(id)?.resume().await
    }

    /// Stop and forget a plan, dropping its storage and queued tasks.
    pub async fn delete_plan(&self, id: &str) -> Result<()> {
        let plan = self.registry.require(id)?;
        self.registry.unregister(id);
        plan.delete().await;

        self.monitor.forget_plan(id);
        self.queue.remove_plan(id).await;
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<PlanStatus> {
        Ok(self.registry.require(id)?.status())
    }

    pub fn statuses(&self) -> Vec<PlanStatus> {
        self.registry.all().iter().map(|p| p.status()).collect()
    }

    /// Bring back plans that were running or paused when the process exited.
    ///
    /// Returns how many plans were restored.
    pub async fn restore(&self) -> usize {
        let mut restored = 0;

        for (id, run_state) in self.run_states.snapshot().await {
            let Some(plan) = self.registry.get(&id) else {
                warn!(plan_id = %id, "Run state for unknown plan, discarding");
                if let Err(e) = self.run_states.set(&id, None).await {
                    warn!(plan_id = %id, error = %e, "Failed to discard run state");
                }
                continue;
            };

            if let Err(e) = plan.start(true).await {
                warn!(plan_id = %id, error = %e.user_message(), "Failed to restore plan");
                continue;
            }
            self.send_push_token_to(&plan).await;

            if run_state == PlanRunState::Paused
                && let Err(e) = plan.pause().await
            {
                warn!(plan_id = %id, error = %e, "Failed to re-pause restored plan");
            }

            info!(plan_id = %id, state = ?run_state, "Plan restored");
            restored += 1;
        }

        restored
    }

    // ---- supervision ----

    /// Register the recurring health test. Calling it again is a no-op.
    pub fn start_supervision(&self) -> ScheduleHandle {
        let mut handle = self.health_handle.lock();
        if let Some(existing) = handle.as_ref()
            && self.scheduler.contains(existing)
        {
            return existing.clone();
        }

        let interval = self.config.health_test_interval;
        let registered = self
            .scheduler
            .schedule(interval, Some(interval), ScheduledEvent::HealthTest);
        info!(interval_secs = interval.as_secs(), "Health supervision started");
        *handle = Some(registered.clone());
        registered
    }

    /// Dispatch firings until shutdown or until the scheduler goes away.
    pub async fn run(self: Arc<Self>, mut firings: mpsc::UnboundedReceiver<Firing>) {
        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    debug!("Orchestrator run loop shutting down");
                    break;
                }
                firing = firings.recv() => {
                    match firing {
                        Some(firing) => {
                            let this = Arc::clone(&self);
                            tokio::spawn(async move {
                                this.dispatch(firing).await;
                            });
                        }
                        None => {
                            warn!("Scheduler channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Route one firing to its handler.
    pub async fn dispatch(&self, firing: Firing) {
        let late_by = firing.fired_at - firing.scheduled_for;
        debug!(
            handle = %firing.handle,
            event = %firing.event,
            late_ms = late_by.num_milliseconds(),
            "Dispatching firing"
        );

        match &firing.event {
            ScheduledEvent::HealthTest => {
                if !self.owns_health_handle(&firing.handle) {
                    debug!(handle = %firing.handle, "Cancelling surplus health test entry");
                    self.scheduler.cancel(&firing.handle);
                    return;
                }
                self.on_health_test().await;
            }
            ScheduledEvent::StartPlan(id) => {
                let Some(plan) = self.registry.get(id) else {
                    debug!(plan_id = %id, "Scheduled start for unknown plan");
                    self.scheduler.cancel(&firing.handle);
                    return;
                };
                match plan.handle_scheduled_start(&firing.handle).await {
                    Ok(Some(_)) => self.send_push_token_to(&plan).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(plan_id = %id, error = %e.user_message(), "Scheduled start failed");
                    }
                }
            }
            ScheduledEvent::StopPlan(id) => {
                let Some(plan) = self.registry.get(id) else {
                    debug!(plan_id = %id, "Scheduled stop for unknown plan");
                    self.scheduler.cancel(&firing.handle);
                    return;
                };
                plan.handle_scheduled_stop(&firing.handle).await;
            }
        }
    }

    fn owns_health_handle(&self, handle: &ScheduleHandle) -> bool {
        self.health_handle.lock().as_ref() == Some(handle)
    }

    /// One supervision pass: test running plans, check the scheduler, purge
    /// expired tasks and retry a pending push token.
    pub async fn on_health_test(&self) -> SupervisionReport {
        let running = self.registry.running();
        let plans = self
            .monitor
            .test_plans(&running, HealthTestOrigin::System)
            .await;

        let anomalies = self
            .scheduler
            .inspect(self.clock.now(), self.config.schedule_tolerance);
        for anomaly in &anomalies {
            warn!(anomaly = %anomaly, "Scheduler anomaly");
        }

        let cancelled_entries = self.cancel_orphaned_entries();
        let purged_tasks = self.queue.purge_expired().await;
        self.retry_push_token().await;

        let restarts = self.monitor.restart_summary();
        debug!(
            plans = plans.len(),
            degraded_components = restarts.degraded,
            restart_attempts = restarts.attempts,
            anomalies = anomalies.len(),
            cancelled_entries,
            purged_tasks,
            "Health test pass complete"
        );

        SupervisionReport {
            plans,
            anomalies,
            cancelled_entries,
            purged_tasks,
        }
    }

    /// Cancel entries nothing owns any more. Plans busy with an operation
    /// are skipped until the next pass.
    fn cancel_orphaned_entries(&self) -> usize {
        let health = self.health_handle.lock().clone();
        let orphaned: Vec<ScheduleEntry> = self
            .scheduler
            .entries()
            .into_iter()
            .filter(|entry| self.is_orphaned(entry, health.as_ref()))
            .collect();

        let mut cancelled = 0;
        for entry in orphaned {
            if self.scheduler.cancel(&entry.handle) {
                info!(
                    handle = %entry.handle,
                    event = %entry.event,
                    "Cancelled orphaned schedule entry"
                );
                cancelled += 1;
            }
        }
        cancelled
    }

    fn is_orphaned(&self, entry: &ScheduleEntry, health: Option<&ScheduleHandle>) -> bool {
        let Some(plan_id) = entry.event.plan_id() else {
            return health != Some(&entry.handle);
        };
        let Some(plan) = self.registry.get(plan_id) else {
            return true;
        };

        let owned = match plan.try_lock_operations() {
            Some(_guard) => plan.owns_handle(&entry.handle),
            None => true,
        };
        !owned
    }

    /// Test one plan on request. Repairs like the recurring test but never
    /// counts toward participation.
    pub async fn test_plan_health(
        &self,
        id: &str,
        origin: HealthTestOrigin,
    ) -> Result<Option<PlanHealthReport>> {
        let plan = self.registry.require(id)?;
        Ok(self.monitor.test_plan(&plan, origin).await)
    }

    // ---- push token ----

    pub fn push_token_state(&self) -> PushTokenState {
        self.push_token.lock().clone()
    }

    /// Set or clear the push token and hand it to every running plan's
    /// remote store. Returns `false` if any store failed; the next health
    /// test retries.
    pub async fn update_push_token(&self, token: Option<String>) -> bool {
        {
            let mut state = self.push_token.lock();
            state.token = token;
            state.pending_refresh = true;
        }
        self.refresh_push_token().await
    }

    async fn retry_push_token(&self) {
        let pending = self.push_token.lock().pending_refresh;
        if pending {
            debug!("Retrying push token refresh");
            self.refresh_push_token().await;
        }
    }

    async fn refresh_push_token(&self) -> bool {
        let token = self.push_token.lock().token.clone();

        let mut ok = true;
        for plan in self.registry.running() {
            ok &= push_token_to(&plan, token.as_deref()).await;
        }

        self.push_token.lock().pending_refresh = !ok;
        self.persist_push_token().await;
        ok
    }

    /// Give a freshly started plan the current token.
    async fn send_push_token_to(&self, plan: &PlanController) {
        let token = self.push_token.lock().token.clone();
        let Some(token) = token else {
            return;
        };

        if !push_token_to(plan, Some(&token)).await {
            self.push_token.lock().pending_refresh = true;
            self.persist_push_token().await;
        }
    }

    async fn persist_push_token(&self) {
        let state = self.push_token.lock().clone();
        if let Err(e) = fs::write_json_atomic(&self.config.push_token_path(), &state).await {
            warn!(error = %e, "Failed to persist push token state");
        }
    }

    // ---- shutdown ----

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Stop the run loop and every plan. Run states are kept so
    /// [`restore`](Self::restore) can bring the plans back.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.cancellation_token.cancel();

        let health = self.health_handle.lock().take();
        if let Some(handle) = health {
            self.scheduler.cancel(&handle);
        }

        for plan in self.registry.all() {
            plan.halt().await;
        }

        info!("Orchestrator shut down");
    }
}

async fn push_token_to(plan: &PlanController, token: Option<&str>) -> bool {
    let remote = plan.remote_store();
    let result = match token {
        Some(token) => remote.send_push_token(token).await,
        None => remote.delete_push_token().await,
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(
                plan_id = %plan.id(),
                component = %remote.name(),
                error = %e,
                "Failed to refresh push token"
            );
            false
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("plans", &self.registry.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
