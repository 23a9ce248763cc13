use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Component, ParticipationTracker};

/// An adapter as held by its plan.
///
/// The slot carries the per-session bookkeeping the orchestrator keeps about
/// the adapter; the adapter itself is never replaced.
pub struct ComponentSlot {
    component: Arc<dyn Component>,
    session_disabled: AtomicBool,
    participation: Mutex<ParticipationTracker>,
}

impl ComponentSlot {
    pub fn new(component: Arc<dyn Component>, horizon: chrono::Duration) -> Self {
        Self {
            component,
            session_disabled: AtomicBool::new(false),
            participation: Mutex::new(ParticipationTracker::new(horizon)),
        }
    }

    pub fn component(&self) -> &Arc<dyn Component> {
        &self.component
    }

    pub fn name(&self) -> &str {
        self.component.name()
    }

    /// Set when the adapter failed to start during the current session.
    pub fn is_session_disabled(&self) -> bool {
        self.session_disabled.load(Ordering::Acquire)
    }

    pub fn set_session_disabled(&self, disabled: bool) {
        self.session_disabled.store(disabled, Ordering::Release);
    }

    /// Enabled by configuration and not disabled for this session.
    pub fn is_active(&self) -> bool {
        self.component.is_enabled() && !self.is_session_disabled()
    }

    pub fn record_success(&self, now: DateTime<Utc>) {
        self.participation.lock().record_success(now);
    }

    pub fn participation_count(&self, now: DateTime<Utc>) -> usize {
        self.participation.lock().successes_within(now)
    }

    pub fn participation_snapshot(&self) -> ParticipationTracker {
        self.participation.lock().clone()
    }

    /// Participation rate, or `None` for adapters disabled by configuration.
    pub fn participation_rate(&self, now: DateTime<Utc>, test_interval: Duration) -> Option<f64> {
        if !self.component.is_enabled() {
            return None;
        }
        Some(self.participation.lock().rate(now, test_interval))
    }
}

impl std::fmt::Debug for ComponentSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentSlot")
            .field("name", &self.component.name())
            .field("session_disabled", &self.is_session_disabled())
            .finish()
    }
}
