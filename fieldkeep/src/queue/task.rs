//! Pending task definitions.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// An interactive task waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTask {
    pub id: Uuid,
    /// Tasks produced by the same source share a family.
    pub family_id: String,
    pub plan_id: String,
    pub title: String,
    /// Ordering key.
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Higher runs first among tasks created at the same instant.
    #[serde(default)]
    pub priority: i32,
}

impl PendingTask {
    pub fn new(
        family_id: impl Into<String>,
        plan_id: impl Into<String>,
        title: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            family_id: family_id.into(),
            plan_id: plan_id.into(),
            title: title.into(),
            created_at,
            expires_at: None,
            priority: 0,
        }
    }

    pub fn with_expiration(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// A task whose expiration is at or before `now` is expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// How a new task interacts with queued tasks of its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Every task is queued.
    Multiple,
    /// At most one task per family; the earliest one wins.
    SingleKeepOldest,
    /// At most one task per family; the latest one wins.
    SingleKeepNewest,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Multiple => "multiple",
            Self::SingleKeepOldest => "single_keep_oldest",
            Self::SingleKeepNewest => "single_keep_newest",
        }
    }
}

impl FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multiple" => Ok(Self::Multiple),
            "single_keep_oldest" => Ok(Self::SingleKeepOldest),
            "single_keep_newest" => Ok(Self::SingleKeepNewest),
            other => Err(Error::config(format!("unknown run mode: {}", other))),
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Expired,
    /// Dropped in favour of another task of the same family.
    Superseded,
}

/// Receives outcomes for the tasks of a family.
///
/// Called after the queue lock is released, so implementations may use the
/// queue again.
#[async_trait]
pub trait TaskOutcomeListener: Send + Sync {
    async fn on_outcome(&self, task: &PendingTask, outcome: TaskOutcome);
}
