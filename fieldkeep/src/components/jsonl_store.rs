//! Local store backed by an append-only JSON-lines file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::component::{Component, ComponentResult, HealthReport, LocalStore, Record};
use crate::error::ComponentError;
use crate::utils::fs;

pub struct JsonlLocalStore {
    name: String,
    path: PathBuf,
    file: Mutex<Option<File>>,
    running: AtomicBool,
}

impl JsonlLocalStore {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            file: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl Component for JsonlLocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> ComponentResult<()> {
        let mut file = self.file.lock().await;
        if file.is_some() {
            return Ok(());
        }

        fs::ensure_parent_dir(&self.path).await?;
        let opened = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| fs::io_error("opening", &self.path, e))?;

        *file = Some(opened);
        self.set_running(true);
        info!(component = %self.name, path = %self.path.display(), "Local store opened");
        Ok(())
    }

    async fn stop(&self) -> ComponentResult<()> {
        let mut file = self.file.lock().await;
        self.set_running(false);
        if let Some(mut f) = file.take() {
            f.flush()
                .await
                .map_err(|e| fs::io_error("flushing", &self.path, e))?;
        }
        debug!(component = %self.name, "Local store closed");
        Ok(())
    }

    async fn test_health(&self) -> ComponentResult<HealthReport> {
        if !self.is_running() {
            return Ok(HealthReport::restart("store is closed"));
        }

        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                Ok(HealthReport::healthy().with_diagnostic("bytes", meta.len().to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(HealthReport::restart("record file disappeared"))
            }
            Err(e) => Err(ComponentError::transient(e.to_string())),
        }
    }
}

#[async_trait]
impl LocalStore for JsonlLocalStore {
    async fn write_record(&self, record: Record) -> ComponentResult<()> {
        let mut line = serde_json::to_string(&record).map_err(crate::Error::from)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        let Some(f) = file.as_mut() else {
            return Err(ComponentError::new(format!("{} is not running", self.name)));
        };
        f.write_all(line.as_bytes())
            .await
            .map_err(|e| fs::io_error("appending", &self.path, e))?;
        Ok(())
    }
}
