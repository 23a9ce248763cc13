//! Persisted task queue.

use std::path::PathBuf;

use tracing::warn;

use super::PendingTask;
use crate::Result;
use crate::utils::fs;

/// JSON file holding the queued tasks.
#[derive(Debug, Clone, Default)]
pub struct QueueStore {
    path: Option<PathBuf>,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A store that keeps nothing.
    pub fn in_memory() -> Self {
        Self { path: None }
    }

    /// Read the saved queue. An unreadable file yields an empty queue.
    pub async fn load(&self) -> Result<Vec<PendingTask>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };

        match fs::read_json_optional::<Vec<PendingTask>>(path).await {
            Ok(tasks) => Ok(tasks.unwrap_or_default()),
            Err(crate::Error::Serialization(e)) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable task queue");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, tasks: &[PendingTask]) -> Result<()> {
        match &self.path {
            Some(path) => fs::write_json_atomic(path, tasks).await,
            None => Ok(()),
        }
    }
}
