//! Remote store that exports records into a directory.
//!
//! Each record becomes `<dir>/<plan_id>/<record_id>.json`. The push token is
//! kept next to them in `push_token.json`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::component::{Component, ComponentResult, HealthReport, Record, RemoteStore};
use crate::error::ComponentError;
use crate::utils::fs;

const PUSH_TOKEN_FILE: &str = "push_token.json";

#[derive(Debug, Serialize, Deserialize)]
struct StoredPushToken {
    token: String,
    updated_at: chrono::DateTime<chrono::Utc>,
}

pub struct DirectoryRemoteStore {
    name: String,
    dir: PathBuf,
    running: AtomicBool,
}

impl DirectoryRemoteStore {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            running: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn push_token_path(&self) -> PathBuf {
        self.dir.join(PUSH_TOKEN_FILE)
    }

    /// Token currently stored, if any.
    pub async fn stored_push_token(&self) -> ComponentResult<Option<String>> {
        let stored = fs::read_json_optional::<StoredPushToken>(&self.push_token_path()).await?;
        Ok(stored.map(|s| s.token))
    }

    fn ensure_running(&self) -> ComponentResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ComponentError::new(format!("{} is not running", self.name)))
        }
    }
}

#[async_trait]
impl Component for DirectoryRemoteStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> ComponentResult<()> {
        fs::ensure_dir_all(&self.dir).await?;
        self.running.store(true, Ordering::SeqCst);
        info!(component = %self.name, dir = %self.dir.display(), "Remote store ready");
        Ok(())
    }

    async fn stop(&self) -> ComponentResult<()> {
        self.running.store(false, Ordering::SeqCst);
        debug!(component = %self.name, "Remote store stopped");
        Ok(())
    }

    async fn test_health(&self) -> ComponentResult<HealthReport> {
        if !self.is_running() {
            return Ok(HealthReport::restart("store is stopped"));
        }

        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(HealthReport::healthy()),
            Ok(_) => Ok(HealthReport::restart("export path is not a directory")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(HealthReport::restart("export directory disappeared"))
            }
            Err(e) => Err(ComponentError::transient(e.to_string())),
        }
    }
}

#[async_trait]
impl RemoteStore for DirectoryRemoteStore {
    async fn write_record(&self, record: Record) -> ComponentResult<()> {
        self.ensure_running()?;
        let path = self
            .dir
            .join(&record.plan_id)
            .join(format!("{}.json", record.id));
        fs::write_json_atomic(&path, &record).await?;
        Ok(())
    }

    async fn send_push_token(&self, token: &str) -> ComponentResult<()> {
        self.ensure_running()?;
        let stored = StoredPushToken {
            token: token.to_string(),
            updated_at: chrono::Utc::now(),
        };
        fs::write_json_atomic(&self.push_token_path(), &stored).await?;
        debug!(component = %self.name, "Push token stored");
        Ok(())
    }

    async fn delete_push_token(&self) -> ComponentResult<()> {
        self.ensure_running()?;
        let path = self.push_token_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(fs::io_error("removing", &path, e).into()),
        }
    }
}
