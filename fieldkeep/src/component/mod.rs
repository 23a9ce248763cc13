//! Components supervised by a plan.
//!
//! Everything a plan starts, stops and health-tests is a [`Component`]:
//! data adapters as well as the two storage pipelines. Storage pipelines add
//! record writes on top (see [`storage`]).

pub mod participation;
mod slot;
pub mod storage;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ComponentError;

pub use participation::{ParticipationTracker, plan_participation};
pub use slot::ComponentSlot;
pub use storage::{LocalStore, Record, RecordKind, RemoteStore};

/// Result type for component operations.
pub type ComponentResult<T> = std::result::Result<T, ComponentError>;

/// Outcome of a component health test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// The component asks to be restarted.
    pub needs_restart: bool,
    /// Free-form key/value diagnostics.
    pub diagnostics: BTreeMap<String, String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn restart(reason: impl Into<String>) -> Self {
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert("reason".to_string(), reason.into());
        Self {
            needs_restart: true,
            diagnostics,
        }
    }

    pub fn with_diagnostic(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.diagnostics.insert(key.into(), value.into());
        self
    }
}

/// Health status of a component as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Last health test passed.
    Healthy,
    /// Restarts keep failing.
    Degraded,
    /// Last health test failed.
    Unhealthy,
    /// Not tested yet.
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A startable, stoppable and health-testable unit of a plan.
#[async_trait]
pub trait Component: Send + Sync {
    /// Stable name, unique within a plan.
    fn name(&self) -> &str;

    /// Disabled components are skipped by start and by health tests.
    fn is_enabled(&self) -> bool {
        true
    }

    fn is_running(&self) -> bool;

    async fn start(&self) -> ComponentResult<()>;

    async fn stop(&self) -> ComponentResult<()>;

    /// Stop then start. A failed stop does not prevent the start attempt.
    async fn restart(&self) -> ComponentResult<()> {
        if let Err(e) = self.stop().await {
            debug!(component = %self.name(), error = %e, "Stop before restart failed");
        }
        self.start().await
    }

    /// Probe the component. An `Err` is treated like a report asking for restart.
    async fn test_health(&self) -> ComponentResult<HealthReport>;
}
