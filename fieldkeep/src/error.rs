//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::plan::StartStage;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Plan failed to start at {stage}: {message}")]
    StartFailed { stage: StartStage, message: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Plan already registered: {0}")]
    PlanExists(String),

    #[error("Component {component} failed: {source}")]
    Component {
        component: String,
        #[source]
        source: ComponentError,
    },

    #[error("Task queue invariant violated: {0}")]
    QueueInvariant(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error while {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn component(component: impl Into<String>, source: ComponentError) -> Self {
        Self::Component {
            component: component.into(),
            source,
        }
    }

    /// The short message shown to an operator when a start attempt fails.
    pub fn user_message(&self) -> String {
        match self {
            Self::StartFailed { stage, .. } => stage.user_message().to_string(),
            other => other.to_string(),
        }
    }
}

/// Error raised by a component operation.
///
/// `transient` marks failures that are expected to clear on their own
/// (a busy device, a flaky network path) as opposed to misconfiguration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ComponentError {
    pub message: String,
    pub transient: bool,
}

impl ComponentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }
}

impl From<std::io::Error> for ComponentError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<Error> for ComponentError {
    fn from(err: Error) -> Self {
        Self::new(err.to_string())
    }
}
