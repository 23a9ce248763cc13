//! Failed-restart bookkeeping.
//!
//! Every failed health test triggers a restart. When restarts of the same
//! component keep failing, the component is reported as degraded so it shows
//! up in the plan status instead of being retried silently forever.
//! Failures age out after `window`; a passing health test wipes them.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_FAILURE_THRESHOLD: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartTrackerConfig {
    /// How long a failed restart counts against a component.
    pub window: Duration,
    /// Failed restarts within `window` that make a component degraded.
    pub degraded_after: usize,
}

impl Default for RestartTrackerConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_FAILURE_WINDOW,
            degraded_after: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

#[derive(Debug, Default)]
struct ComponentRestarts {
    /// Oldest first.
    failed: VecDeque<Instant>,
    attempts: u64,
}

impl ComponentRestarts {
    fn expire(&mut self, now: Instant, window: Duration) {
        while self
            .failed
            .front()
            .is_some_and(|&at| now.saturating_duration_since(at) >= window)
        {
            self.failed.pop_front();
        }
    }

    fn live_failures(&self, now: Instant, window: Duration) -> usize {
        self.failed
            .iter()
            .rev()
            .take_while(|&&at| now.saturating_duration_since(at) < window)
            .count()
    }
}

/// Per-component restart outcomes, keyed by `plan_id/component`.
#[derive(Debug, Default)]
pub struct RestartTracker {
    components: HashMap<String, ComponentRestarts>,
    config: RestartTrackerConfig,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RestartTrackerConfig) -> Self {
        Self {
            components: HashMap::new(),
            config,
        }
    }

    pub fn record_restart(&mut self, key: &str) {
        self.components.entry(key.to_owned()).or_default().attempts += 1;
    }

    /// Returns `true` once the component counts as degraded.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.config.window;
        let restarts = self.components.entry(key.to_owned()).or_default();
        restarts.expire(now, window);
        restarts.failed.push_back(now);

        let failures = restarts.failed.len();
        if failures < self.config.degraded_after {
            debug!(component = %key, failures, "Restart failed");
            return false;
        }

        warn!(
            component = %key,
            failures,
            window_secs = window.as_secs(),
            "Restarts keep failing, component degraded"
        );
        true
    }

    pub fn recent_failures(&self, key: &str) -> usize {
        self.components.get(key).map_or(0, |restarts| {
            restarts.live_failures(Instant::now(), self.config.window)
        })
    }

    pub fn is_degraded(&self, key: &str) -> bool {
        self.recent_failures(key) >= self.config.degraded_after
    }

    pub fn total_restarts(&self, key: &str) -> u64 {
        self.components.get(key).map_or(0, |restarts| restarts.attempts)
    }

    pub fn clear_failures(&mut self, key: &str) {
        let Some(restarts) = self.components.get_mut(key) else {
            return;
        };
        if !restarts.failed.is_empty() {
            debug!(component = %key, "Component healthy again, restart failures cleared");
            restarts.failed.clear();
        }
    }

    /// Forget every component under `prefix`.
    pub fn remove_prefix(&mut self, prefix: &str) {
        self.components.retain(|key, _| !key.starts_with(prefix));
    }

    pub fn summary(&self) -> RestartSummary {
        let now = Instant::now();
        let mut summary = RestartSummary {
            components: self.components.len(),
            ..RestartSummary::default()
        };
        for restarts in self.components.values() {
            summary.attempts += restarts.attempts;
            if restarts.live_failures(now, self.config.window) >= self.config.degraded_after {
                summary.degraded += 1;
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartSummary {
    /// Components that were ever restarted or failed.
    pub components: usize,
    pub degraded: usize,
    pub attempts: u64,
}
