//! Lifecycle controller for a single collection plan.
//!
//! Start order is local store, remote store, then adapters. Stop runs the
//! other way round: adapters, remote store, local store. Every operation that
//! changes the plan's state holds the plan's operation lock for its full
//! duration, so a scheduled stop cannot interleave with a manual one.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::definition::CollectionPlan;
use super::state::{PlanState, StartStage};
use super::store::{PlanRunState, RunStateStore};
use crate::clock::{SharedClock, to_std_saturating};
use crate::component::{
    ComponentResult, ComponentSlot, HealthStatus, LocalStore, RemoteStore, plan_participation,
};
use crate::scheduler::{ScheduleHandle, ScheduledEvent, TaskScheduler};
use crate::utils::fs;
use crate::{Error, Result};

/// Shared services a controller needs.
#[derive(Clone)]
pub struct PlanContext {
    pub scheduler: Arc<dyn TaskScheduler>,
    pub run_states: Arc<RunStateStore>,
    pub clock: SharedClock,
    /// Used to turn participation counts into rates.
    pub health_test_interval: Duration,
}

/// Which part of the plan a sequence step acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTarget {
    LocalStore,
    RemoteStore,
    Adapter,
}

/// Result of a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub target: StepTarget,
    pub name: String,
    pub status: StepStatus,
}

impl StepOutcome {
    fn new(target: StepTarget, name: &str, status: StepStatus) -> Self {
        Self {
            target,
            name: name.to_string(),
            status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == StepStatus::Ok
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, StepStatus::Failed(_))
    }
}

/// Ordered outcomes of a start, resume, pause or stop sequence.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SequenceReport {
    pub steps: Vec<StepOutcome>,
    adapter_phase_complete: bool,
}

impl SequenceReport {
    fn push(&mut self, outcome: StepOutcome) {
        self.steps.push(outcome);
    }

    /// Number of adapters that started in this sequence.
    pub fn started_adapters(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.target == StepTarget::Adapter && s.is_ok())
            .count()
    }

    /// Names of adapters whose step failed.
    pub fn failed_adapters(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.target == StepTarget::Adapter && s.is_failed())
            .map(|s| s.name.as_str())
            .collect()
    }

    /// The stage that makes this start attempt fatal, if any.
    pub fn fatal_stage(&self) -> Option<StartStage> {
        for step in &self.steps {
            match (step.target, &step.status) {
                (StepTarget::LocalStore, StepStatus::Failed(_)) => {
                    return Some(StartStage::LocalStore);
                }
                (StepTarget::RemoteStore, StepStatus::Failed(_)) => {
                    return Some(StartStage::RemoteStore);
                }
                _ => {}
            }
        }

        if self.adapter_phase_complete && self.started_adapters() == 0 {
            return Some(StartStage::Components);
        }
        None
    }

    fn failure_message(&self, stage: StartStage) -> String {
        let target = match stage {
            StartStage::LocalStore => StepTarget::LocalStore,
            StartStage::RemoteStore => StepTarget::RemoteStore,
            StartStage::Components => {
                let failed = self.failed_adapters();
                return if failed.is_empty() {
                    "no enabled components".to_string()
                } else {
                    format!("all components failed to start: {}", failed.join(", "))
                };
            }
        };

        self.steps
            .iter()
            .find_map(|s| match &s.status {
                StepStatus::Failed(e) if s.target == target => Some(format!("{}: {}", s.name, e)),
                _ => None,
            })
            .unwrap_or_default()
    }
}

/// What a start request did.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(SequenceReport),
    Resumed(SequenceReport),
    Scheduled { at: DateTime<Utc> },
    AlreadyRunning,
}

/// Snapshot of one component for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub name: String,
    pub enabled: bool,
    pub running: bool,
    pub session_disabled: bool,
    pub health: HealthStatus,
    pub participation: Option<f64>,
}

/// Snapshot of a plan for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStatus {
    pub id: String,
    pub name: String,
    pub state: PlanState,
    pub scheduled_start_at: Option<DateTime<Utc>>,
    pub scheduled_stop_at: Option<DateTime<Utc>>,
    pub last_health_test: Option<DateTime<Utc>>,
    pub participation: f64,
    pub components: Vec<ComponentStatus>,
}

impl PlanStatus {
    /// Components whose restarts keep failing.
    pub fn degraded_components(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|c| c.health == HealthStatus::Degraded)
            .map(|c| c.name.as_str())
            .collect()
    }
}

#[derive(Debug, Default)]
struct ScheduleSlots {
    start: Option<ScheduleHandle>,
    stop: Option<ScheduleHandle>,
}

async fn run_step<F>(target: StepTarget, name: &str, op: F) -> StepOutcome
where
    F: Future<Output = ComponentResult<()>>,
{
    match op.await {
        Ok(()) => StepOutcome::new(target, name, StepStatus::Ok),
        Err(e) => StepOutcome::new(target, name, StepStatus::Failed(e.to_string())),
    }
}

/// Owns one plan's state machine.
pub struct PlanController {
    plan: CollectionPlan,
    adapters: Vec<ComponentSlot>,
    state: RwLock<PlanState>,
    operations: tokio::sync::Mutex<()>,
    schedule: Mutex<ScheduleSlots>,
    component_health: Mutex<BTreeMap<String, HealthStatus>>,
    last_health_test: Mutex<Option<DateTime<Utc>>>,
    /// Set once by `delete`; the controller accepts no further transitions.
    deleted: AtomicBool,
    ctx: PlanContext,
}

impl PlanController {
    pub fn new(plan: CollectionPlan, ctx: PlanContext) -> Self {
        let adapters = plan
            .adapters
            .iter()
            .map(|adapter| ComponentSlot::new(Arc::clone(adapter), plan.participation_horizon))
            .collect();

        Self {
            plan,
            adapters,
            state: RwLock::new(PlanState::Stopped),
            operations: tokio::sync::Mutex::new(()),
            schedule: Mutex::new(ScheduleSlots::default()),
            component_health: Mutex::new(BTreeMap::new()),
            last_health_test: Mutex::new(None),
            deleted: AtomicBool::new(false),
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.plan.id
    }

    pub fn name(&self) -> &str {
        &self.plan.name
    }

    pub fn plan(&self) -> &CollectionPlan {
        &self.plan
    }

    pub fn state(&self) -> PlanState {
        *self.state.read()
    }

    pub fn adapters(&self) -> &[ComponentSlot] {
        &self.adapters
    }

    pub fn local_store(&self) -> &Arc<dyn LocalStore> {
        &self.plan.local_store
    }

    pub fn remote_store(&self) -> &Arc<dyn RemoteStore> {
        &self.plan.remote_store
    }

    pub(crate) fn clock(&self) -> &SharedClock {
        &self.ctx.clock
    }

    pub(crate) fn health_test_interval(&self) -> Duration {
        self.ctx.health_test_interval
    }

    /// Acquire the plan's operation lock.
    pub(crate) async fn lock_operations(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.operations.lock().await
    }

    /// Acquire the operation lock only if no operation is in progress.
    pub(crate) fn try_lock_operations(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.operations.try_lock().ok()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Callers hold the operation lock, so `delete` cannot slip in between.
    fn ensure_not_deleted(&self) -> Result<()> {
        if self.is_deleted() {
            debug!(plan_id = %self.plan.id, "Refusing operation on deleted plan");
            return Err(Error::PlanNotFound(self.plan.id.clone()));
        }
        Ok(())
    }

    fn set_state(&self, target: PlanState) -> Result<()> {
        let mut state = self.state.write();
        *state = state.transition_to(target)?;
        Ok(())
    }

    /// Cleanup paths must always land in the target state.
    fn set_state_or_force(&self, target: PlanState) {
        let mut state = self.state.write();
        if !state.can_transition_to(target) {
            warn!(plan_id = %self.plan.id, from = %*state, to = %target, "Forcing plan state");
        }
        *state = target;
    }

    async fn persist_run_state(&self, state: Option<PlanRunState>) {
        if let Err(e) = self.ctx.run_states.set(&self.plan.id, state).await {
            warn!(plan_id = %self.plan.id, error = %e, "Failed to persist plan run state");
        }
    }

    // ---- scheduling ----

    pub fn scheduled_start_at(&self) -> Option<DateTime<Utc>> {
        let slots = self.schedule.lock();
        slots
            .start
            .as_ref()
            .and_then(|h| self.ctx.scheduler.next_execution(h))
    }

    pub fn scheduled_stop_at(&self) -> Option<DateTime<Utc>> {
        let slots = self.schedule.lock();
        slots
            .stop
            .as_ref()
            .and_then(|h| self.ctx.scheduler.next_execution(h))
    }

    /// Whether `handle` is one of this plan's pending schedule handles.
    pub fn owns_handle(&self, handle: &ScheduleHandle) -> bool {
        let slots = self.schedule.lock();
        slots.start.as_ref() == Some(handle) || slots.stop.as_ref() == Some(handle)
    }

    fn schedule_event(&self, delay: chrono::Duration, event: ScheduledEvent) -> ScheduleHandle {
        self.ctx
            .scheduler
            .schedule(to_std_saturating(delay), None, event)
    }

    fn schedule_start_locked(&self, delay: chrono::Duration) -> Result<DateTime<Utc>> {
        if self.state() != PlanState::ScheduledStart {
            self.set_state(PlanState::ScheduledStart)?;
        }

        let at = self.ctx.clock.now() + delay;
        let handle = self.schedule_event(delay, ScheduledEvent::StartPlan(self.plan.id.clone()));
        let previous = self.schedule.lock().start.replace(handle);
        if let Some(previous) = previous {
            self.ctx.scheduler.cancel(&previous);
        }

        info!(plan_id = %self.plan.id, start_at = %at, "Plan start scheduled");
        self.ensure_stop_scheduled();
        Ok(at)
    }

    /// Register the scheduled stop if the plan has one and none is pending.
    fn ensure_stop_scheduled(&self) {
        let now = self.ctx.clock.now();
        let Some(delay) = self.plan.schedule.stop_delay(now) else {
            return;
        };

        let mut slots = self.schedule.lock();
        if slots
            .stop
            .as_ref()
            .is_some_and(|h| self.ctx.scheduler.contains(h))
        {
            return;
        }

        let event = ScheduledEvent::StopPlan(self.plan.id.clone());
        slots.stop = Some(self.schedule_event(delay, event));
        info!(plan_id = %self.plan.id, stop_at = %(now + delay), "Plan stop scheduled");
    }

    fn cancel_start_handle(&self) {
        let start = self.schedule.lock().start.take();
        if let Some(handle) = start {
            self.ctx.scheduler.cancel(&handle);
        }
    }

    fn cancel_schedules(&self) {
        let (start, stop) = {
            let mut slots = self.schedule.lock();
            (slots.start.take(), slots.stop.take())
        };
        for handle in [start, stop].into_iter().flatten() {
            self.ctx.scheduler.cancel(&handle);
        }
    }

    /// Cancel a pending start together with the stop registered alongside it.
    pub async fn cancel_scheduled_start(&self) -> bool {
        let _guard = self.operations.lock().await;
        if self.state() != PlanState::ScheduledStart {
            return false;
        }

        self.cancel_schedules();
        self.set_state_or_force(PlanState::Stopped);
        self.persist_run_state(None).await;
        info!(plan_id = %self.plan.id, "Scheduled start cancelled");
        true
    }

    /// Cancel a pending stop, leaving the plan running.
    pub async fn cancel_scheduled_stop(&self) -> bool {
        let _guard = self.operations.lock().await;
        let stop = self.schedule.lock().stop.take();
        match stop {
            Some(handle) => {
                self.ctx.scheduler.cancel(&handle);
                info!(plan_id = %self.plan.id, "Scheduled stop cancelled");
                true
            }
            None => false,
        }
    }

    // ---- start ----

    /// Start the plan.
    ///
    /// Unless `immediate` is set or the plan starts immediately, a start time
    /// in the future registers a scheduled start instead.
    pub async fn start(&self, immediate: bool) -> Result<StartOutcome> {
        let _guard = self.operations.lock().await;
        self.ensure_not_deleted()?;

        match self.state() {
            PlanState::Running | PlanState::Starting => {
                debug!(plan_id = %self.plan.id, "Plan already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            PlanState::Paused => return self.resume_locked().await.map(StartOutcome::Resumed),
            PlanState::ScheduledStart => {
                if !immediate && let Some(at) = self.scheduled_start_at() {
                    return Ok(StartOutcome::Scheduled { at });
                }
                self.cancel_start_handle();
            }
            PlanState::Stopped | PlanState::Stopping => {}
        }

        let now = self.ctx.clock.now();
        if let Some(delay) = self.plan.schedule.start_delay(now, immediate) {
            let at = self.schedule_start_locked(delay)?;
            return Ok(StartOutcome::Scheduled { at });
        }

        self.start_sequence_locked().await.map(StartOutcome::Started)
    }

    async fn start_sequence_locked(&self) -> Result<SequenceReport> {
        self.set_state(PlanState::Starting)?;
        info!(plan_id = %self.plan.id, name = %self.plan.name, "Starting plan");

        let mut report = SequenceReport::default();

        let local = &self.plan.local_store;
        report.push(run_step(StepTarget::LocalStore, local.name(), local.start()).await);
        if let Some(stage) = report.fatal_stage() {
            return Err(self.abort_start_locked(stage, &report).await);
        }

        let remote = &self.plan.remote_store;
        report.push(run_step(StepTarget::RemoteStore, remote.name(), remote.start()).await);
        if let Some(stage) = report.fatal_stage() {
            return Err(self.abort_start_locked(stage, &report).await);
        }

        self.start_adapters(&mut report).await;
        if let Some(stage) = report.fatal_stage() {
            return Err(self.abort_start_locked(stage, &report).await);
        }

        self.mark_running(&report).await;
        Ok(report)
    }

    async fn start_adapters(&self, report: &mut SequenceReport) {
        for slot in &self.adapters {
            slot.set_session_disabled(false);
            let component = slot.component();

            if !component.is_enabled() {
                report.push(StepOutcome::new(
                    StepTarget::Adapter,
                    component.name(),
                    StepStatus::Skipped,
                ));
                continue;
            }

            if component.is_running() {
                report.push(StepOutcome::new(
                    StepTarget::Adapter,
                    component.name(),
                    StepStatus::Ok,
                ));
                continue;
            }

            let outcome = run_step(StepTarget::Adapter, component.name(), component.start()).await;
            if let StepStatus::Failed(e) = &outcome.status {
                warn!(
                    plan_id = %self.plan.id,
                    component = %component.name(),
                    error = %e,
                    "Component failed to start, disabled for this session"
                );
                slot.set_session_disabled(true);
            }
            report.push(outcome);
        }

        report.adapter_phase_complete = true;
    }

    async fn mark_running(&self, report: &SequenceReport) {
        self.set_state_or_force(PlanState::Running);
        self.persist_run_state(Some(PlanRunState::Running)).await;
        self.ensure_stop_scheduled();

        let failed = report.failed_adapters();
        if failed.is_empty() {
            info!(
                plan_id = %self.plan.id,
                adapters = report.started_adapters(),
                "Plan running"
            );
        } else {
            info!(
                plan_id = %self.plan.id,
                adapters = report.started_adapters(),
                disabled = ?failed,
                "Plan running with disabled components"
            );
        }
    }

    async fn abort_start_locked(&self, stage: StartStage, report: &SequenceReport) -> Error {
        let message = report.failure_message(stage);
        warn!(
            plan_id = %self.plan.id,
            stage = %stage,
            error = %message,
            "Plan failed to start, rolling back"
        );

        self.teardown_locked().await;
        Error::StartFailed { stage, message }
    }

    // ---- stop ----

    /// Stop the plan. Never fails; a stopped plan is left untouched.
    pub async fn stop(&self) -> SequenceReport {
        let _guard = self.operations.lock().await;
        self.teardown_locked().await
    }

    /// Stop for process shutdown.
    ///
    /// Same as [`stop`](Self::stop) except the persisted run state is kept,
    /// so the plan is resumed on relaunch.
    pub async fn halt(&self) -> SequenceReport {
        let _guard = self.operations.lock().await;
        self.teardown_inner(false).await
    }

    async fn teardown_locked(&self) -> SequenceReport {
        self.teardown_inner(true).await
    }

    async fn teardown_inner(&self, forget_run_state: bool) -> SequenceReport {
        let mut report = SequenceReport::default();

        match self.state() {
            PlanState::Stopped => return report,
            PlanState::ScheduledStart => {
                self.cancel_schedules();
                self.set_state_or_force(PlanState::Stopped);
                if forget_run_state {
                    self.persist_run_state(None).await;
                }
                info!(plan_id = %self.plan.id, "Scheduled start cancelled by stop");
                return report;
            }
            _ => {}
        }

        self.cancel_schedules();
        self.set_state_or_force(PlanState::Stopping);
        info!(plan_id = %self.plan.id, "Stopping plan");

        self.stop_running_adapters(&mut report).await;

        let remote = &self.plan.remote_store;
        if remote.is_running() {
            let outcome = run_step(StepTarget::RemoteStore, remote.name(), remote.stop()).await;
            self.log_stop_failure(&outcome);
            report.push(outcome);
        }

        let local = &self.plan.local_store;
        if local.is_running() {
            let outcome = run_step(StepTarget::LocalStore, local.name(), local.stop()).await;
            self.log_stop_failure(&outcome);
            report.push(outcome);
        }

        for slot in &self.adapters {
            slot.set_session_disabled(false);
        }

        if forget_run_state {
            self.persist_run_state(None).await;
        }
        self.set_state_or_force(PlanState::Stopped);
        info!(plan_id = %self.plan.id, "Plan stopped");
        report
    }

    async fn stop_running_adapters(&self, report: &mut SequenceReport) {
        for slot in &self.adapters {
            let component = slot.component();
            if !component.is_running() {
                continue;
            }
            let outcome = run_step(StepTarget::Adapter, component.name(), component.stop()).await;
            self.log_stop_failure(&outcome);
            report.push(outcome);
        }
    }

    fn log_stop_failure(&self, outcome: &StepOutcome) {
        if let StepStatus::Failed(e) = &outcome.status {
            warn!(
                plan_id = %self.plan.id,
                component = %outcome.name,
                error = %e,
                "Failed to stop component"
            );
        }
    }

    // ---- pause / resume ----

    /// Stop the adapters but keep both stores alive.
    pub async fn pause(&self) -> Result<SequenceReport> {
        let _guard = self.operations.lock().await;
        self.ensure_not_deleted()?;

        if self.state() == PlanState::Paused {
            return Ok(SequenceReport::default());
        }
        self.set_state(PlanState::Paused)?;

        let mut report = SequenceReport::default();
        self.stop_running_adapters(&mut report).await;
        self.persist_run_state(Some(PlanRunState::Paused)).await;

        info!(plan_id = %self.plan.id, "Plan paused");
        Ok(report)
    }

    /// Restart the adapters of a paused plan.
    pub async fn resume(&self) -> Result<SequenceReport> {
        let _guard = self.operations.lock().await;
        self.ensure_not_deleted()?;
        if self.state() == PlanState::Running {
            return Ok(SequenceReport::default());
        }
        self.resume_locked().await
    }

    async fn resume_locked(&self) -> Result<SequenceReport> {
        self.set_state(PlanState::Starting)?;
        info!(plan_id = %self.plan.id, "Resuming plan");

        let mut report = SequenceReport::default();
        self.start_adapters(&mut report).await;
        if let Some(stage) = report.fatal_stage() {
            return Err(self.abort_start_locked(stage, &report).await);
        }

        self.mark_running(&report).await;
        Ok(report)
    }

    // ---- scheduled firings ----

    /// Handle a scheduled-start firing.
    ///
    /// Stale handles are ignored. A firing that arrives before the start
    /// time is re-registered for the remaining delay.
    pub async fn handle_scheduled_start(
        &self,
        handle: &ScheduleHandle,
    ) -> Result<Option<SequenceReport>> {
        let _guard = self.operations.lock().await;
        self.ensure_not_deleted()?;

        {
            let mut slots = self.schedule.lock();
            if slots.start.as_ref() != Some(handle) {
                debug!(plan_id = %self.plan.id, handle = %handle, "Ignoring stale scheduled start");
                return Ok(None);
            }
            slots.start = None;
        }

        if self.state() != PlanState::ScheduledStart {
            return Ok(None);
        }

        let now = self.ctx.clock.now();
        if let Some(delay) = self.plan.schedule.start_delay(now, false) {
            debug!(plan_id = %self.plan.id, "Scheduled start fired early, rescheduling");
            let handle =
                self.schedule_event(delay, ScheduledEvent::StartPlan(self.plan.id.clone()));
            self.schedule.lock().start = Some(handle);
            return Ok(None);
        }

        self.start_sequence_locked().await.map(Some)
    }

    /// Handle a scheduled-stop firing, with the same stale and early checks.
    pub async fn handle_scheduled_stop(&self, handle: &ScheduleHandle) -> Option<SequenceReport> {
        let _guard = self.operations.lock().await;
        if self.is_deleted() {
            return None;
        }

        {
            let mut slots = self.schedule.lock();
            if slots.stop.as_ref() != Some(handle) {
                debug!(plan_id = %self.plan.id, handle = %handle, "Ignoring stale scheduled stop");
                return None;
            }
            slots.stop = None;
        }

        let now = self.ctx.clock.now();
        if let Some(delay) = self.plan.schedule.stop_delay(now)
            && delay > chrono::Duration::zero()
        {
            debug!(plan_id = %self.plan.id, "Scheduled stop fired early, rescheduling");
            let handle = self.schedule_event(delay, ScheduledEvent::StopPlan(self.plan.id.clone()));
            self.schedule.lock().stop = Some(handle);
            return None;
        }

        if self.state() == PlanState::Stopped {
            return None;
        }

        info!(plan_id = %self.plan.id, "Scheduled stop reached");
        Some(self.teardown_locked().await)
    }

    // ---- delete ----

    /// Stop the plan if needed, forget its run state and remove its storage.
    ///
    /// Terminal: operations waiting on the lock fail with
    /// `Error::PlanNotFound` once this returns.
    pub async fn delete(&self) {
        let _guard = self.operations.lock().await;
        if self.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown_locked().await;
        self.persist_run_state(None).await;

        if let Some(dir) = &self.plan.storage_dir {
            match fs::remove_dir_all_if_exists(dir).await {
                Ok(()) => debug!(
                    plan_id = %self.plan.id,
                    dir = %dir.display(),
                    "Removed plan storage"
                ),
                Err(e) => warn!(
                    plan_id = %self.plan.id,
                    error = %e,
                    "Failed to remove plan storage directory"
                ),
            }
        }

        info!(plan_id = %self.plan.id, "Plan deleted");
    }

    // ---- health bookkeeping ----

    pub(crate) fn set_component_health(&self, component: &str, status: HealthStatus) {
        self.component_health
            .lock()
            .insert(component.to_string(), status);
    }

    pub fn component_health(&self, component: &str) -> HealthStatus {
        self.component_health
            .lock()
            .get(component)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn mark_health_tested(&self, at: DateTime<Utc>) {
        *self.last_health_test.lock() = Some(at);
    }

    /// Per-adapter participation rates (adapters disabled by configuration omitted).
    pub fn participation_rates(&self, now: DateTime<Utc>) -> BTreeMap<String, f64> {
        self.adapters
            .iter()
            .filter_map(|slot| {
                slot.participation_rate(now, self.ctx.health_test_interval)
                    .map(|rate| (slot.name().to_string(), rate))
            })
            .collect()
    }

    /// Plan-level participation: mean adapter rate, or 1 with no reporting adapters.
    pub fn participation(&self, now: DateTime<Utc>) -> f64 {
        plan_participation(
            self.adapters
                .iter()
                .map(|slot| slot.participation_rate(now, self.ctx.health_test_interval)),
        )
    }

    pub fn status(&self) -> PlanStatus {
        let now = self.ctx.clock.now();
        let health = self.component_health.lock().clone();
        let health_of = |name: &str| health.get(name).copied().unwrap_or_default();

        let mut components = Vec::with_capacity(self.adapters.len() + 2);
        let local = &self.plan.local_store;
        components.push(ComponentStatus {
            name: local.name().to_string(),
            enabled: local.is_enabled(),
            running: local.is_running(),
            session_disabled: false,
            health: health_of(local.name()),
            participation: None,
        });
        let remote = &self.plan.remote_store;
        components.push(ComponentStatus {
            name: remote.name().to_string(),
            enabled: remote.is_enabled(),
            running: remote.is_running(),
            session_disabled: false,
            health: health_of(remote.name()),
            participation: None,
        });
        for slot in &self.adapters {
            let component = slot.component();
            components.push(ComponentStatus {
                name: component.name().to_string(),
                enabled: component.is_enabled(),
                running: component.is_running(),
                session_disabled: slot.is_session_disabled(),
                health: health_of(component.name()),
                participation: slot.participation_rate(now, self.ctx.health_test_interval),
            });
        }

        PlanStatus {
            id: self.plan.id.clone(),
            name: self.plan.name.clone(),
            state: self.state(),
            scheduled_start_at: self.scheduled_start_at(),
            scheduled_stop_at: self.scheduled_stop_at(),
            last_health_test: *self.last_health_test.lock(),
            participation: self.participation(now),
            components,
        }
    }
}

impl std::fmt::Debug for PlanController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanController")
            .field("id", &self.plan.id)
            .field("state", &self.state())
            .finish()
    }
}
