//! Health monitor.
//!
//! Tests every running plan: local store, remote store, then each active
//! adapter. A failing component is restarted in place. Errors, timeouts and
//! panics are contained per component and per plan so one broken plan never
//! stops supervision of the others.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::restart_tracker::{RestartTracker, RestartTrackerConfig};
use crate::clock::SharedClock;
use crate::component::{Component, HealthReport, HealthStatus, Record};
use crate::plan::{PlanController, PlanState};

/// Who asked for a health test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTestOrigin {
    /// The recurring health-test firing. Counts toward participation.
    System,
    /// An operator request. Repairs but never counts toward participation.
    User,
}

/// Result of testing one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum CheckOutcome {
    Healthy,
    /// The test failed and the component restarted.
    Restarted(String),
    /// The test failed and so did the restart.
    RestartFailed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentCheck {
    pub name: String,
    pub outcome: CheckOutcome,
    pub diagnostics: BTreeMap<String, String>,
}

impl ComponentCheck {
    pub fn is_healthy(&self) -> bool {
        self.outcome == CheckOutcome::Healthy
    }
}

/// Result of testing one plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanHealthReport {
    pub plan_id: String,
    pub origin: HealthTestOrigin,
    pub tested_at: DateTime<Utc>,
    pub checks: Vec<ComponentCheck>,
    pub participation: f64,
}

impl PlanHealthReport {
    pub fn check(&self, name: &str) -> Option<&ComponentCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn restarted(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| !c.is_healthy())
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Render a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "<non-string panic payload>".to_string()
}

pub struct HealthMonitor {
    clock: SharedClock,
    component_test_timeout: Duration,
    component_restart_timeout: Duration,
    restart_tracker: Mutex<RestartTracker>,
}

impl HealthMonitor {
    pub fn new(
        clock: SharedClock,
        component_test_timeout: Duration,
        component_restart_timeout: Duration,
        restart_tracker: RestartTrackerConfig,
    ) -> Self {
        Self {
            clock,
            component_test_timeout,
            component_restart_timeout,
            restart_tracker: Mutex::new(RestartTracker::with_config(restart_tracker)),
        }
    }

    /// Test several plans concurrently.
    ///
    /// Plans that are not running are skipped. A panic inside one plan's test
    /// is logged and that plan is left out of the result.
    pub async fn test_plans(
        &self,
        plans: &[Arc<PlanController>],
        origin: HealthTestOrigin,
    ) -> Vec<PlanHealthReport> {
        let tests = plans.iter().map(|plan| async move {
            match AssertUnwindSafe(self.test_plan(plan, origin))
                .catch_unwind()
                .await
            {
                Ok(report) => report,
                Err(panic) => {
                    error!(
                        plan_id = %plan.id(),
                        panic = %panic_message(panic.as_ref()),
                        "Plan health test panicked"
                    );
                    None
                }
            }
        });

        join_all(tests).await.into_iter().flatten().collect()
    }

    /// Test a single plan under its operation lock.
    ///
    /// Returns `None` when the plan is not running.
    pub async fn test_plan(
        &self,
        plan: &PlanController,
        origin: HealthTestOrigin,
    ) -> Option<PlanHealthReport> {
        let _guard = plan.lock_operations().await;
        if plan.state() != PlanState::Running {
            debug!(plan_id = %plan.id(), state = %plan.state(), "Skipping health test");
            return None;
        }

        let now = self.clock.now();
        let mut checks = Vec::with_capacity(plan.adapters().len() + 2);

        checks.push(self.check_component(plan, plan.local_store().as_ref()).await);
        checks.push(self.check_component(plan, plan.remote_store().as_ref()).await);

        for slot in plan.adapters() {
            if !slot.is_active() {
                continue;
            }

            let check = self.check_component(plan, slot.component().as_ref()).await;
            if check.is_healthy() && origin == HealthTestOrigin::System {
                slot.record_success(now);
            }
            checks.push(check);
        }

        let participation = plan.participation(now);
        if origin == HealthTestOrigin::System {
            self.write_participation_report(plan, now, participation).await;
        }
        plan.mark_health_tested(now);

        let report = PlanHealthReport {
            plan_id: plan.id().to_string(),
            origin,
            tested_at: now,
            checks,
            participation,
        };

        let restarted = report.restarted();
        if restarted.is_empty() {
            debug!(plan_id = %plan.id(), participation, "Plan healthy");
        } else {
            info!(
                plan_id = %plan.id(),
                restarted = ?restarted,
                "Plan health test repaired components"
            );
        }

        Some(report)
    }

    async fn check_component<C>(&self, plan: &PlanController, component: &C) -> ComponentCheck
    where
        C: Component + ?Sized,
    {
        let name = component.name().to_string();
        let key = format!("{}/{}", plan.id(), name);

        let (failure, diagnostics) = match self.run_test(component).await {
            Ok(report) if !report.needs_restart => (None, report.diagnostics),
            Ok(report) => {
                let reason = report
                    .diagnostics
                    .get("reason")
                    .cloned()
                    .unwrap_or_else(|| "component requested restart".to_string());
                (Some(reason), report.diagnostics)
            }
            Err(reason) => (Some(reason), BTreeMap::new()),
        };

        let Some(reason) = failure else {
            self.restart_tracker.lock().clear_failures(&key);
            plan.set_component_health(&name, HealthStatus::Healthy);
            return ComponentCheck {
                name,
                outcome: CheckOutcome::Healthy,
                diagnostics,
            };
        };

        warn!(
            plan_id = %plan.id(),
            component = %name,
            reason = %reason,
            "Health test failed, restarting"
        );
        let outcome = self.restart(plan, component, &key).await;

        ComponentCheck {
            name,
            outcome: match outcome {
                Ok(()) => CheckOutcome::Restarted(reason),
                Err(e) => CheckOutcome::RestartFailed(e),
            },
            diagnostics,
        }
    }

    async fn run_test<C>(&self, component: &C) -> Result<HealthReport, String>
    where
        C: Component + ?Sized,
    {
        let test = AssertUnwindSafe(component.test_health()).catch_unwind();
        match tokio::time::timeout(self.component_test_timeout, test).await {
            Err(_) => Err(format!(
                "health test timed out after {}s",
                self.component_test_timeout.as_secs()
            )),
            Ok(Err(panic)) => Err(format!(
                "health test panicked: {}",
                panic_message(panic.as_ref())
            )),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Ok(Ok(report))) => Ok(report),
        }
    }

    async fn restart<C>(
        &self,
        plan: &PlanController,
        component: &C,
        key: &str,
    ) -> Result<(), String>
    where
        C: Component + ?Sized,
    {
        self.restart_tracker.lock().record_restart(key);

        // A hung restart must not hold the plan lock forever.
        let restart = AssertUnwindSafe(component.restart()).catch_unwind();
        let result = match tokio::time::timeout(self.component_restart_timeout, restart).await {
            Err(_) => Err(format!(
                "restart timed out after {}s",
                self.component_restart_timeout.as_secs()
            )),
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(panic)) => Err(format!("restart panicked: {}", panic_message(panic.as_ref()))),
        };

        match &result {
            Ok(()) => {
                info!(plan_id = %plan.id(), component = %component.name(), "Component restarted");
                plan.set_component_health(component.name(), HealthStatus::Unhealthy);
            }
            Err(e) => {
                error!(
                    plan_id = %plan.id(),
                    component = %component.name(),
                    error = %e,
                    "Component restart failed"
                );
                let degraded = self.restart_tracker.lock().record_failure(key);
                plan.set_component_health(
                    component.name(),
                    if degraded {
                        HealthStatus::Degraded
                    } else {
                        HealthStatus::Unhealthy
                    },
                );
            }
        }

        result
    }

    async fn write_participation_report(
        &self,
        plan: &PlanController,
        now: DateTime<Utc>,
        participation: f64,
    ) {
        let local = plan.local_store();
        if !local.is_running() {
            return;
        }

        let rates = plan.participation_rates(now);
        let record = Record::participation_report(plan.id(), now, &rates, participation);
        if let Err(e) = local.write_record(record).await {
            warn!(plan_id = %plan.id(), error = %e, "Failed to write participation report");
        }
    }

    /// Forget restart history of a deleted plan.
    pub fn forget_plan(&self, plan_id: &str) {
        self.restart_tracker
            .lock()
            .remove_prefix(&format!("{}/", plan_id));
    }

    pub fn restart_summary(&self) -> super::RestartSummary {
        self.restart_tracker.lock().summary()
    }
}
