//! Built-in components and plan definitions.
//!
//! Plans are described by JSON files in the plans directory and turned into
//! [`CollectionPlan`]s by [`build_plan`].

mod directory_remote;
mod heartbeat;
mod jsonl_store;
mod periodic;
mod prompt;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::component::{Component, LocalStore};
use crate::plan::{CollectionPlan, DEFAULT_PARTICIPATION_HORIZON_SECS, PlanSchedule};
use crate::queue::{RunMode, TaskQueueManager};
use crate::utils::fs;
use crate::{Error, Result};

pub use directory_remote::DirectoryRemoteStore;
pub use heartbeat::HeartbeatSource;
pub use jsonl_store::JsonlLocalStore;
pub use prompt::{PromptSettings, PromptSource};

const LOCAL_STORE_NAME: &str = "local-store";
const REMOTE_STORE_NAME: &str = "remote-store";

fn default_true() -> bool {
    true
}

fn default_horizon_secs() -> u64 {
    DEFAULT_PARTICIPATION_HORIZON_SECS as u64
}

fn default_run_mode() -> RunMode {
    RunMode::Multiple
}

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// One adapter in a plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterDefinition {
    Heartbeat {
        name: String,
        interval_secs: u64,
        #[serde(default = "default_true")]
        enabled: bool,
    },
    Prompt {
        name: String,
        title: String,
        interval_secs: u64,
        #[serde(default = "default_run_mode")]
        run_mode: RunMode,
        #[serde(default)]
        expires_after_secs: Option<u64>,
        #[serde(default)]
        priority: i32,
        #[serde(default = "default_true")]
        enabled: bool,
    },
}

impl AdapterDefinition {
    pub fn name(&self) -> &str {
        match self {
            Self::Heartbeat { name, .. } | Self::Prompt { name, .. } => name,
        }
    }

    fn interval_secs(&self) -> u64 {
        match self {
            Self::Heartbeat { interval_secs, .. } | Self::Prompt { interval_secs, .. } => {
                *interval_secs
            }
        }
    }
}

/// A plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub schedule: PlanSchedule,
    #[serde(default = "default_horizon_secs")]
    pub participation_horizon_secs: u64,
    /// Where the remote store exports to. Defaults to `outbox/` in the plan's
    /// storage directory.
    #[serde(default)]
    pub remote_dir: Option<PathBuf>,
    #[serde(default)]
    pub adapters: Vec<AdapterDefinition>,
    /// Start the plan when the daemon launches.
    #[serde(default = "default_true")]
    pub autostart: bool,
}

impl PlanDefinition {
    /// Reject definitions that cannot produce a usable plan.
    pub fn validate(&self) -> Result<()> {
        let valid_id = !self.id.is_empty()
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_id {
            return Err(Error::config(format!(
                "plan id '{}' must be non-empty and use only letters, digits, '-' or '_'",
                self.id
            )));
        }

        if self.participation_horizon_secs == 0 {
            return Err(Error::config(format!(
                "plan '{}': participation horizon must be positive",
                self.id
            )));
        }

        let mut names = HashSet::from([LOCAL_STORE_NAME, REMOTE_STORE_NAME]);
        for adapter in &self.adapters {
            if !names.insert(adapter.name()) {
                return Err(Error::config(format!(
                    "plan '{}': duplicate component name '{}'",
                    self.id,
                    adapter.name()
                )));
            }
            if adapter.interval_secs() == 0 {
                return Err(Error::config(format!(
                    "plan '{}': component '{}' needs a positive interval",
                    self.id,
                    adapter.name()
                )));
            }
        }

        Ok(())
    }
}

/// Directory holding everything a plan writes locally.
pub fn plan_storage_dir(data_dir: &Path, plan_id: &str) -> PathBuf {
    data_dir.join("plans").join(plan_id)
}

/// Turn a definition into a runnable plan.
pub fn build_plan(
    definition: &PlanDefinition,
    data_dir: &Path,
    queue: &Arc<TaskQueueManager>,
    clock: &SharedClock,
) -> Result<CollectionPlan> {
    definition.validate()?;

    let storage_dir = plan_storage_dir(data_dir, &definition.id);
    let local_store = Arc::new(JsonlLocalStore::new(
        LOCAL_STORE_NAME,
        storage_dir.join("records.jsonl"),
    ));
    let remote_dir = definition
        .remote_dir
        .clone()
        .unwrap_or_else(|| storage_dir.join("outbox"));
    let remote_store = Arc::new(DirectoryRemoteStore::new(REMOTE_STORE_NAME, remote_dir));

    let local: Arc<dyn LocalStore> = local_store;
    let horizon = seconds(definition.participation_horizon_secs);

    let mut plan = CollectionPlan::new(
        definition.id.clone(),
        definition.name.clone(),
        Arc::clone(&local),
        remote_store,
    )
    .with_schedule(definition.schedule.clone())
    .with_participation_horizon(horizon)
    .with_storage_dir(storage_dir);

    for adapter in &definition.adapters {
        let component: Arc<dyn Component> = match adapter {
            AdapterDefinition::Heartbeat {
                name,
                interval_secs,
                enabled,
            } => Arc::new(
                HeartbeatSource::new(
                    name.clone(),
                    definition.id.clone(),
                    Duration::from_secs(*interval_secs),
                    Arc::clone(&local),
                    Arc::clone(clock),
                )
                .with_enabled(*enabled),
            ),
            AdapterDefinition::Prompt {
                name,
                title,
                interval_secs,
                run_mode,
                expires_after_secs,
                priority,
                enabled,
            } => {
                let settings = PromptSettings {
                    title: title.clone(),
                    run_mode: *run_mode,
                    expires_after: expires_after_secs.map(seconds),
                    priority: *priority,
                };
                Arc::new(
                    PromptSource::new(
                        name.clone(),
                        definition.id.clone(),
                        Duration::from_secs(*interval_secs),
                        settings,
                        Arc::clone(queue),
                        Arc::clone(clock),
                    )
                    .with_enabled(*enabled),
                )
            }
        };
        plan = plan.with_adapter(component);
    }

    Ok(plan)
}

/// Read every `*.json` plan file in `dir`, in file name order.
///
/// A missing directory yields no plans. Files that fail to parse are logged
/// and skipped.
pub async fn load_definitions(dir: &Path) -> Result<Vec<PlanDefinition>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "No plans directory");
            return Ok(Vec::new());
        }
        Err(e) => return Err(fs::io_error("reading directory", dir, e)),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| fs::io_error("reading directory", dir, e))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut definitions = Vec::with_capacity(paths.len());
    for path in paths {
        match fs::read_json_optional::<PlanDefinition>(&path).await {
            Ok(Some(definition)) => definitions.push(definition),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable plan file"),
        }
    }

    Ok(definitions)
}
