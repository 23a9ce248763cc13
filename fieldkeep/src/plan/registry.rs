//! Registry of live plan controllers.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::PlanState;
use super::lifecycle::PlanController;
use crate::{Error, Result};

/// At most one controller per plan id.
#[derive(Default)]
pub struct PlanRegistry {
    plans: DashMap<String, Arc<PlanController>>,
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, controller: Arc<PlanController>) -> Result<()> {
        let id = controller.id().to_string();
        match self.plans.entry(id.clone()) {
            Entry::Occupied(_) => Err(Error::PlanExists(id)),
            Entry::Vacant(entry) => {
                entry.insert(controller);
                debug!(plan_id = %id, "Registered plan");
                Ok(())
            }
        }
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<PlanController>> {
        let removed = self.plans.remove(id).map(|(_, controller)| controller);
        if removed.is_some() {
            debug!(plan_id = %id, "Unregistered plan");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<PlanController>> {
        self.plans.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn require(&self, id: &str) -> Result<Arc<PlanController>> {
        self.get(id).ok_or_else(|| Error::PlanNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plans.contains_key(id)
    }

    /// Snapshot of all controllers, ordered by id.
    pub fn all(&self) -> Vec<Arc<PlanController>> {
        let mut plans: Vec<_> = self
            .plans
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        plans.sort_by(|a, b| a.id().cmp(b.id()));
        plans
    }

    /// Controllers currently in `Running`.
    pub fn running(&self) -> Vec<Arc<PlanController>> {
        self.all()
            .into_iter()
            .filter(|c| c.state() == PlanState::Running)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
