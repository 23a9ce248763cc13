//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use fieldkeep::clock::{Clock, ManualClock};
use fieldkeep::config::OrchestratorConfig;
use fieldkeep::orchestrator::OrchestratorParts;
use fieldkeep::plan::{CollectionPlan, PlanController, RunStateStore};
use fieldkeep::queue::{QueueStore, TaskQueueManager};
use fieldkeep::scheduler::{Firing, ScheduleHandle, ScheduledEvent, TaskScheduler, TokioScheduler};
use fieldkeep::testing::{EventLog, MockComponent, RecordingSink};
use fieldkeep::Orchestrator;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Fixed starting point for the manual clock.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// An orchestrator wired to a manual clock and recording test doubles.
pub struct Harness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub log: Arc<EventLog>,
    pub sink: Arc<RecordingSink>,
    pub scheduler: Arc<TokioScheduler>,
    pub firings: mpsc::UnboundedReceiver<Firing>,
    pub run_states: Arc<RunStateStore>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn test_config(dir: &TempDir) -> OrchestratorConfig {
    OrchestratorConfig {
        data_dir: dir.path().join("data"),
        log_dir: dir.path().join("logs"),
        plans_dir: dir.path().join("plans"),
        health_test_interval: Duration::from_secs(60 * 60),
        component_test_timeout: Duration::from_secs(5),
        component_restart_timeout: Duration::from_secs(10),
        ..OrchestratorConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(TempDir::new().expect("Failed to create temp dir"), None)
}

/// Build a harness in `dir`, optionally over an existing run-state store.
pub fn harness_with(dir: TempDir, run_states: Option<Arc<RunStateStore>>) -> Harness {
    fieldkeep::testing::init_tracing();

    let config = test_config(&dir);
    let clock = Arc::new(ManualClock::new(t0()));
    let (scheduler, firings) = TokioScheduler::new(clock.clone());
    let scheduler = Arc::new(scheduler);
    let sink = Arc::new(RecordingSink::default());
    let run_states = run_states.unwrap_or_else(|| Arc::new(RunStateStore::in_memory()));
    let queue = Arc::new(TaskQueueManager::new(
        sink.clone(),
        QueueStore::in_memory(),
        clock.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        OrchestratorParts {
            clock: clock.clone(),
            scheduler: scheduler.clone(),
            queue,
            run_states: Arc::clone(&run_states),
        },
    ));

    Harness {
        dir,
        clock,
        log: EventLog::new(),
        sink,
        scheduler,
        firings,
        run_states,
        orchestrator,
    }
}

/// Mocks backing one plan.
pub struct MockPlan {
    pub local: Arc<MockComponent>,
    pub remote: Arc<MockComponent>,
    pub adapters: Vec<Arc<MockComponent>>,
}

impl MockPlan {
    pub fn adapter(&self, name: &str) -> &Arc<MockComponent> {
        self.adapters
            .iter()
            .find(|a| fieldkeep::component::Component::name(a.as_ref()) == name)
            .expect("no such adapter")
    }

    pub fn running_adapters(&self) -> usize {
        self.adapters
            .iter()
            .filter(|a| fieldkeep::component::Component::is_running(a.as_ref()))
            .count()
    }
}

/// A plan whose components are mocks. Component names are prefixed with
/// the plan id so several plans can share one event log.
pub fn mock_plan(id: &str, adapters: &[&str], log: &Arc<EventLog>) -> (CollectionPlan, MockPlan) {
    let local = MockComponent::new(format!("{}.local", id), log.clone());
    let remote = MockComponent::new(format!("{}.remote", id), log.clone());
    let adapters: Vec<_> = adapters
        .iter()
        .map(|name| MockComponent::new(format!("{}.{}", id, name), log.clone()))
        .collect();

    let mut plan = CollectionPlan::new(id, format!("Plan {}", id), local.clone(), remote.clone());
    for adapter in &adapters {
        plan = plan.with_adapter(adapter.clone());
    }

    (
        plan,
        MockPlan {
            local,
            remote,
            adapters,
        },
    )
}

impl Harness {
    /// Register a mock plan.
    pub fn add_mock_plan(&self, id: &str, adapters: &[&str]) -> (Arc<PlanController>, MockPlan) {
        let (plan, mocks) = mock_plan(id, adapters, &self.log);
        let controller = self
            .orchestrator
            .add_plan(plan)
            .expect("Failed to register plan");
        (controller, mocks)
    }

    /// Build the firing for a live scheduler entry.
    pub fn firing(&self, handle: &ScheduleHandle) -> Firing {
        let entry = self
            .scheduler
            .entries()
            .into_iter()
            .find(|e| &e.handle == handle)
            .expect("no such schedule entry");
        Firing {
            handle: entry.handle,
            event: entry.event,
            scheduled_for: entry.next_execution.unwrap_or_else(|| self.clock.now()),
            fired_at: self.clock.now(),
        }
    }

    /// Handles of live entries carrying `event`.
    pub fn handles_for(&self, event: &ScheduledEvent) -> Vec<ScheduleHandle> {
        self.scheduler
            .entries()
            .into_iter()
            .filter(|e| &e.event == event)
            .map(|e| e.handle)
            .collect()
    }

    /// The entry for `event` that `plan` currently owns.
    pub fn owned_handle(&self, plan: &PlanController, event: &ScheduledEvent) -> ScheduleHandle {
        self.handles_for(event)
            .into_iter()
            .find(|h| plan.owns_handle(h))
            .expect("plan owns no such entry")
    }
}
