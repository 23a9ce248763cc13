//! Persisted run state of plans.
//!
//! Remembers which plans were running or paused so they can be resumed when
//! the process is relaunched. A stopped plan has no entry.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::Result;
use crate::utils::fs;

/// Last known run state of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRunState {
    Running,
    Paused,
}

/// JSON-backed map of plan id to run state.
pub struct RunStateStore {
    path: Option<PathBuf>,
    states: Mutex<BTreeMap<String, PlanRunState>>,
}

impl RunStateStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            states: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load the store from `path`.
    ///
    /// A corrupt file is logged and replaced with an empty map on the next
    /// write rather than blocking startup.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let states = match fs::read_json_optional::<BTreeMap<String, PlanRunState>>(&path).await {
            Ok(states) => states.unwrap_or_default(),
            Err(crate::Error::Serialization(e)) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable run state file");
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };

        debug!(path = %path.display(), plans = states.len(), "Loaded plan run states");

        Ok(Self {
            path: Some(path),
            states: Mutex::new(states),
        })
    }

    pub async fn get(&self, plan_id: &str) -> Option<PlanRunState> {
        self.states.lock().await.get(plan_id).copied()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, PlanRunState> {
        self.states.lock().await.clone()
    }

    /// Record a plan's run state; `None` clears it.
    pub async fn set(&self, plan_id: &str, state: Option<PlanRunState>) -> Result<()> {
        let mut states = self.states.lock().await;
        let changed = match state {
            Some(state) => states.insert(plan_id.to_string(), state) != Some(state),
            None => states.remove(plan_id).is_some(),
        };

        if !changed {
            return Ok(());
        }

        if let Some(path) = &self.path {
            fs::write_json_atomic(path, &*states).await?;
        }
        Ok(())
    }
}
