//! Background loop shared by the built-in sources.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::component::{ComponentResult, HealthReport};

/// Ticks missed before the loop counts as stalled.
const STALL_TICKS: u32 = 3;

struct RunningLoop {
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

/// A cancellable tick loop with liveness tracking.
pub(crate) struct PeriodicWorker {
    interval: Duration,
    clock: SharedClock,
    running: Mutex<Option<RunningLoop>>,
    last_tick: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl PeriodicWorker {
    pub fn new(interval: Duration, clock: SharedClock) -> Self {
        Self {
            interval,
            clock,
            running: Mutex::new(None),
            last_tick: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        *self.last_tick.lock()
    }

    /// Spawn the loop. The first tick runs immediately. A running loop is
    /// left alone.
    pub fn start<F, Fut>(&self, name: &str, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ComponentResult<()>> + Send,
    {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        let interval = self.interval;
        let clock = Arc::clone(&self.clock);
        let last_tick = Arc::clone(&self.last_tick);
        let name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match tick().await {
                            Ok(()) => *last_tick.lock() = Some(clock.now()),
                            Err(e) => warn!(component = %name, error = %e, "Tick failed"),
                        }
                    }
                }
            }

            debug!(component = %name, "Loop stopped");
        });

        *running = Some(RunningLoop {
            cancellation_token,
            handle,
            started_at: self.clock.now(),
        });
    }

    /// Cancel the loop and wait for it to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancellation_token.cancel();
            let _ = running.handle.await;
        }
    }

    /// Healthy while the loop is alive and has ticked recently.
    pub fn check(&self) -> HealthReport {
        let started_at = match self.running.lock().as_ref() {
            Some(r) if !r.handle.is_finished() => r.started_at,
            _ => return HealthReport::restart("loop is not running"),
        };

        let now = self.clock.now();
        let last = self.last_tick().filter(|t| *t >= started_at).unwrap_or(started_at);
        let allowed = chrono::Duration::from_std(self.interval * STALL_TICKS)
            .unwrap_or(chrono::Duration::MAX);

        if now - last > allowed {
            return HealthReport::restart("loop stalled")
                .with_diagnostic("last_tick", last.to_rfc3339());
        }

        let report = HealthReport::healthy();
        match self.last_tick() {
            Some(t) => report.with_diagnostic("last_tick", t.to_rfc3339()),
            None => report,
        }
    }
}
