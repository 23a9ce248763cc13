//! Tracing setup: console output plus a daily rolling file in the log
//! directory, pruned after a retention period.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::OrchestratorConfig;
use crate::utils::fs;
use crate::{Error, Result};

/// Filter used when neither `FIELDKEEP_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "fieldkeep=info";

/// File name prefix of the rolling log files (`fieldkeep.log.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "fieldkeep.log";

const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Line format of the log file. The console is always plain text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(Error::config(format!("unknown log format: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Keeps the file writer alive. Dropping it flushes and closes the log file.
pub struct LogHandle {
    log_dir: PathBuf,
    retention_days: u32,
    _guard: WorkerGuard,
}

impl LogHandle {
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Prune old log files now and then once a day until `cancel_token` fires.
    pub fn start_retention_cleanup(&self, cancel_token: CancellationToken) {
        let log_dir = self.log_dir.clone();
        let retention_days = self.retention_days;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let today = Local::now().date_naive();
                        if let Err(e) = prune_logs(&log_dir, today, retention_days).await {
                            warn!(error = %e, "Log retention pass failed");
                        }
                    }
                }
            }
        });
    }
}

fn rolled_file_date(file_name: &str) -> Option<NaiveDate> {
    let suffix = file_name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}

/// Remove rolled log files dated more than `retention_days` before `today`.
async fn prune_logs(log_dir: &Path, today: NaiveDate, retention_days: u32) -> Result<usize> {
    let cutoff = today - chrono::Days::new(u64::from(retention_days));

    let mut entries = tokio::fs::read_dir(log_dir)
        .await
        .map_err(|e| fs::io_error("reading directory", log_dir, e))?;

    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| fs::io_error("reading directory", log_dir, e))?
    {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(rolled_file_date)
            .is_some_and(|date| date < cutoff);
        if !expired {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Could not remove old log file"),
        }
    }

    if removed > 0 {
        info!(removed, retention_days, "Pruned old log files");
    }
    Ok(removed)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("FIELDKEEP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber.
///
/// Keep the returned handle for the lifetime of the process or buffered file
/// lines are lost.
pub fn init_logging(config: &OrchestratorConfig) -> Result<LogHandle> {
    fs::ensure_dir_all_sync_with_op("creating log directory", &config.log_dir)?;

    let appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = match config.log_format {
        LogFormat::Text => fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_timer(LocalTimer)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_timer(LocalTimer)
            .with_current_span(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_timer(LocalTimer))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to install log subscriber: {}", e)))?;

    Ok(LogHandle {
        log_dir: config.log_dir.clone(),
        retention_days: config.log_retention_days,
        _guard: guard,
    })
}
