//! Process-wide panic hook.
//!
//! A component that panics during a health test is caught and restarted, so
//! the process keeps going, but the panic is still worth keeping. Every panic
//! is logged through `tracing` and appended as one JSON line to
//! `panics.jsonl` in the log directory. The direct write does not depend on
//! the non-blocking log writer having flushed.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::PanicHookInfo;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File in the log directory that collects panic records.
pub const PANIC_LOG_FILE: &str = "panics.jsonl";

/// One captured panic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanicRecord {
    pub at: DateTime<Utc>,
    pub thread: String,
    pub location: Option<String>,
    pub message: String,
    /// Present when backtraces are enabled (`RUST_BACKTRACE`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl PanicRecord {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let message = info
            .payload()
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());

        let backtrace = Backtrace::capture();
        let backtrace =
            (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());

        Self {
            at: Utc::now(),
            thread: std::thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
            location: info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column())),
            message,
            backtrace,
        }
    }
}

/// Install the hook. The previously installed hook still runs afterwards.
pub fn install(log_dir: impl AsRef<Path>) {
    let path = log_dir.as_ref().join(PANIC_LOG_FILE);
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        // A panic inside the hook would abort the process.
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = PanicRecord::capture(info);
            tracing::error!(
                target: "fieldkeep::panic",
                thread = %record.thread,
                location = record.location.as_deref().unwrap_or("<unknown>"),
                "Panic: {}",
                record.message
            );
            let _ = append_record(&path, &record);
        }));

        previous(info);
    }));
}

fn append_record(path: &Path, record: &PanicRecord) -> std::io::Result<()> {
    let line = serde_json::to_string(record)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    file.flush()
}
