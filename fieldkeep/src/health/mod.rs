//! Periodic health supervision of running plans.

mod monitor;
mod restart_tracker;

pub use monitor::{
    CheckOutcome, ComponentCheck, HealthMonitor, HealthTestOrigin, PlanHealthReport,
};
pub(crate) use monitor::panic_message;
pub use restart_tracker::{
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_FAILURE_WINDOW, RestartSummary, RestartTracker,
    RestartTrackerConfig,
};
