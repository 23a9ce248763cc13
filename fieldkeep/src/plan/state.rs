//! Plan state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle state of a collection plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanState {
    /// Nothing is running.
    #[default]
    Stopped,
    /// A start is registered with the scheduler.
    ScheduledStart,
    /// The start sequence is in progress.
    Starting,
    /// Stores and at least one adapter are running.
    Running,
    /// Adapters are stopped, stores are kept alive.
    Paused,
    /// The stop sequence is in progress.
    Stopping,
}

impl PlanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::ScheduledStart => "SCHEDULED_START",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopping => "STOPPING",
        }
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: PlanState) -> bool {
        use PlanState::*;

        matches!(
            (self, target),
            (Stopped, ScheduledStart | Starting)
                | (ScheduledStart, Starting | Stopped)
                | (Starting, Running | Stopping)
                | (Running, Paused | Stopping)
                | (Paused, Starting | Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: PlanState) -> Result<PlanState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for PlanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The step of the start sequence that failed fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStage {
    LocalStore,
    RemoteStore,
    Components,
}

impl StartStage {
    /// Operator-facing message for a failed start.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::LocalStore => "Local data store failed to start.",
            Self::RemoteStore => "Remote data store failed to start.",
            Self::Components => "No data sources could be started.",
        }
    }
}

impl std::fmt::Display for StartStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalStore => write!(f, "local store"),
            Self::RemoteStore => write!(f, "remote store"),
            Self::Components => write!(f, "components"),
        }
    }
}
