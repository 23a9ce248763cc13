//! Orchestrator configuration.
//!
//! Values come from the process environment (optionally seeded from a `.env`
//! file by the binary) and fall back to defaults tuned for the build profile.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::health::RestartTrackerConfig;
use crate::logging::LogFormat;

/// Health-test cadence for debug builds.
pub const DEBUG_HEALTH_TEST_INTERVAL: Duration = Duration::from_secs(30);

/// Health-test cadence for release builds.
pub const RELEASE_HEALTH_TEST_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Upper bound on a single component health test.
pub const DEFAULT_COMPONENT_TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single component restart.
pub const DEFAULT_COMPONENT_RESTART_TIMEOUT: Duration = Duration::from_secs(60);

/// How late a scheduled firing may be before the scheduler self-test flags it.
pub const DEFAULT_SCHEDULE_TOLERANCE: Duration = Duration::from_secs(60);

/// Days of rolled log files to keep.
pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 7;

/// Returns the health-test interval for the current build profile.
pub fn default_health_test_interval() -> Duration {
    if cfg!(debug_assertions) {
        DEBUG_HEALTH_TEST_INTERVAL
    } else {
        RELEASE_HEALTH_TEST_INTERVAL
    }
}

/// Runtime configuration for the orchestrator and its binary.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root directory for persisted run state and the task queue.
    pub data_dir: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    pub log_format: LogFormat,
    pub log_retention_days: u32,
    /// Directory scanned for plan definition files.
    pub plans_dir: PathBuf,
    /// Interval between health-test firings.
    pub health_test_interval: Duration,
    /// Timeout applied to each component health test.
    pub component_test_timeout: Duration,
    /// Timeout applied to each restart issued by the health monitor.
    pub component_restart_timeout: Duration,
    /// Allowed lateness before a scheduled entry is reported by the self-test.
    pub schedule_tolerance: Duration,
    /// Restart-failure tracking used to flag degraded components.
    pub restart_tracker: RestartTrackerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
            log_format: LogFormat::default(),
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
            plans_dir: PathBuf::from("plans"),
            health_test_interval: default_health_test_interval(),
            component_test_timeout: DEFAULT_COMPONENT_TEST_TIMEOUT,
            component_restart_timeout: DEFAULT_COMPONENT_RESTART_TIMEOUT,
            schedule_tolerance: DEFAULT_SCHEDULE_TOLERANCE,
            restart_tracker: RestartTrackerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unparseable or zero durations are ignored so a typo cannot disable
    /// the health loop.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("FIELDKEEP_DATA_DIR")
            && !dir.trim().is_empty()
        {
            config.data_dir = PathBuf::from(dir.trim());
        }

        if let Some(dir) = lookup("FIELDKEEP_LOG_DIR")
            && !dir.trim().is_empty()
        {
            config.log_dir = PathBuf::from(dir.trim());
        }

        if let Some(raw) = lookup("FIELDKEEP_LOG_FORMAT") {
            match raw.parse() {
                Ok(format) => config.log_format = format,
                Err(e) => warn!(error = %e, "Ignoring FIELDKEEP_LOG_FORMAT"),
            }
        }

        if let Some(days) = lookup("FIELDKEEP_LOG_RETENTION_DAYS")
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .filter(|days| *days > 0)
        {
            config.log_retention_days = days;
        }

        if let Some(dir) = lookup("FIELDKEEP_PLANS_DIR")
            && !dir.trim().is_empty()
        {
            config.plans_dir = PathBuf::from(dir.trim());
        }

        if let Some(secs) = parse_secs(&lookup, "FIELDKEEP_HEALTH_TEST_INTERVAL_SECS") {
            config.health_test_interval = secs;
        }

        if let Some(secs) = parse_secs(&lookup, "FIELDKEEP_COMPONENT_TEST_TIMEOUT_SECS") {
            config.component_test_timeout = secs;
        }

        if let Some(secs) = parse_secs(&lookup, "FIELDKEEP_COMPONENT_RESTART_TIMEOUT_SECS") {
            config.component_restart_timeout = secs;
        }

        if let Some(secs) = parse_secs(&lookup, "FIELDKEEP_SCHEDULE_TOLERANCE_SECS") {
            config.schedule_tolerance = secs;
        }

        config
    }

    /// Path of the persisted plan run-state file.
    pub fn run_state_path(&self) -> PathBuf {
        self.data_dir.join("run_states.json")
    }

    /// Path of the persisted task queue.
    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("pending_tasks.json")
    }

    /// Path of the persisted push token.
    pub fn push_token_path(&self) -> PathBuf {
        self.data_dir.join("push_token.json")
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(secs) => Some(Duration::from_secs(secs)),
    }
}
