//! Storage pipelines.
//!
//! Every plan has exactly one local store (durable on-device buffer) and one
//! remote store (upload target). Both are components; the remote one also
//! carries the device push token.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Component, ComponentResult};

/// Kind of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Data produced by an adapter.
    Sample,
    /// Periodic participation summary written by the health monitor.
    ParticipationReport,
}

/// A single record handed to a storage pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub plan_id: String,
    pub source: String,
    pub kind: RecordKind,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Record {
    pub fn sample(
        plan_id: impl Into<String>,
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id: plan_id.into(),
            source: source.into(),
            kind: RecordKind::Sample,
            timestamp,
            payload,
        }
    }

    /// Participation summary for a plan.
    ///
    /// `per_component` holds the rate of every adapter that reports one;
    /// `overall` is the plan-level average.
    pub fn participation_report(
        plan_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        per_component: &BTreeMap<String, f64>,
        overall: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id: plan_id.into(),
            source: "health_monitor".to_string(),
            kind: RecordKind::ParticipationReport,
            timestamp,
            payload: serde_json::json!({
                "participation": overall,
                "components": per_component,
            }),
        }
    }
}

/// On-device store.
#[async_trait]
pub trait LocalStore: Component {
    async fn write_record(&self, record: Record) -> ComponentResult<()>;
}

/// Remote upload target.
#[async_trait]
pub trait RemoteStore: Component {
    async fn write_record(&self, record: Record) -> ComponentResult<()>;

    /// Register the device push token with the backend.
    async fn send_push_token(&self, token: &str) -> ComponentResult<()>;

    /// Remove the device push token from the backend.
    async fn delete_push_token(&self) -> ComponentResult<()>;
}
