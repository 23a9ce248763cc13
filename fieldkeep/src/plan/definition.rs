//! Collection plan definition.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::component::{Component, LocalStore, RemoteStore};

/// Default participation horizon (one day).
pub const DEFAULT_PARTICIPATION_HORIZON_SECS: i64 = 24 * 60 * 60;

/// When a plan starts and stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSchedule {
    /// Start as soon as asked, ignoring `start_at`.
    #[serde(default = "default_true")]
    pub start_immediately: bool,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_at: Option<DateTime<Utc>>,
    /// Ignore `stop_at` and run until stopped.
    #[serde(default = "default_true")]
    pub continue_indefinitely: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PlanSchedule {
    fn default() -> Self {
        Self {
            start_immediately: true,
            start_at: None,
            stop_at: None,
            continue_indefinitely: true,
        }
    }
}

impl PlanSchedule {
    /// A schedule that starts at `start_at`.
    pub fn starting_at(start_at: DateTime<Utc>) -> Self {
        Self {
            start_immediately: false,
            start_at: Some(start_at),
            ..Self::default()
        }
    }

    /// Stop at `stop_at` instead of running indefinitely.
    pub fn with_stop_at(mut self, stop_at: DateTime<Utc>) -> Self {
        self.stop_at = Some(stop_at);
        self.continue_indefinitely = false;
        self
    }

    /// Remaining time until a deferred start, or `None` to start now.
    pub fn start_delay(&self, now: DateTime<Utc>, immediate: bool) -> Option<chrono::Duration> {
        if immediate || self.start_immediately {
            return None;
        }
        self.start_at
            .filter(|start_at| *start_at > now)
            .map(|start_at| start_at - now)
    }

    /// Time until the scheduled stop, if the plan has one. Clamped to zero.
    pub fn stop_delay(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        if self.continue_indefinitely {
            return None;
        }
        self.stop_at
            .map(|stop_at| (stop_at - now).max(chrono::Duration::zero()))
    }
}

/// A configured data-collection campaign.
#[derive(Clone)]
pub struct CollectionPlan {
    pub id: String,
    pub name: String,
    pub schedule: PlanSchedule,
    pub participation_horizon: chrono::Duration,
    /// Directory owned by this plan; removed on delete.
    pub storage_dir: Option<PathBuf>,
    pub local_store: Arc<dyn LocalStore>,
    pub remote_store: Arc<dyn RemoteStore>,
    pub adapters: Vec<Arc<dyn Component>>,
}

impl CollectionPlan {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        local_store: Arc<dyn LocalStore>,
        remote_store: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            schedule: PlanSchedule::default(),
            participation_horizon: chrono::Duration::seconds(DEFAULT_PARTICIPATION_HORIZON_SECS),
            storage_dir: None,
            local_store,
            remote_store,
            adapters: Vec::new(),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn Component>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_schedule(mut self, schedule: PlanSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_participation_horizon(mut self, horizon: chrono::Duration) -> Self {
        self.participation_horizon = horizon;
        self
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }
}

impl std::fmt::Debug for CollectionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionPlan")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("adapters", &self.adapters.len())
            .finish()
    }
}
