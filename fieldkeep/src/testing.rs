//! Test doubles shared by unit and integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::Result;
use crate::component::{
    Component, ComponentResult, HealthReport, LocalStore, Record, RemoteStore,
};
use crate::error::ComponentError;
use crate::queue::{
    NotificationSink, PendingNotification, PendingTask, TaskOutcome, TaskOutcomeListener,
};

/// Initialize tracing for tests.
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Ordered log of component calls, shared between mocks.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Events that end with `:{action}`, in order.
    pub fn with_action(&self, action: &str) -> Vec<String> {
        let suffix = format!(":{}", action);
        self.events
            .lock()
            .iter()
            .filter(|e| e.ends_with(&suffix))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Scriptable component that also works as either storage pipeline.
pub struct MockComponent {
    name: String,
    log: Arc<EventLog>,
    enabled: AtomicBool,
    running: AtomicBool,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    fail_restart: AtomicBool,
    needs_restart: AtomicBool,
    fail_test: AtomicBool,
    panic_on_test: AtomicBool,
    hang_on_test: AtomicBool,
    hang_on_restart: AtomicBool,
    stop_delay_ms: AtomicU64,
    fail_push_token: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    restart_calls: AtomicUsize,
    test_calls: AtomicUsize,
    records: Mutex<Vec<Record>>,
    push_token: Mutex<Option<String>>,
}

impl MockComponent {
    pub fn new(name: impl Into<String>, log: Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            log,
            enabled: AtomicBool::new(true),
            running: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_restart: AtomicBool::new(false),
            needs_restart: AtomicBool::new(false),
            fail_test: AtomicBool::new(false),
            panic_on_test: AtomicBool::new(false),
            hang_on_test: AtomicBool::new(false),
            hang_on_restart: AtomicBool::new(false),
            stop_delay_ms: AtomicU64::new(0),
            fail_push_token: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            restart_calls: AtomicUsize::new(0),
            test_calls: AtomicUsize::new(0),
            records: Mutex::new(Vec::new()),
            push_token: Mutex::new(None),
        })
    }

    pub fn set_enabled(&self, value: bool) {
        self.enabled.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, value: bool) {
        self.fail_start.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_stop(&self, value: bool) {
        self.fail_stop.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_restart(&self, value: bool) {
        self.fail_restart.store(value, Ordering::SeqCst);
    }

    /// Next health test asks for a restart; a successful restart clears it.
    pub fn set_needs_restart(&self, value: bool) {
        self.needs_restart.store(value, Ordering::SeqCst);
    }

    /// Health test returns an error.
    pub fn set_fail_test(&self, value: bool) {
        self.fail_test.store(value, Ordering::SeqCst);
    }

    pub fn set_panic_on_test(&self, value: bool) {
        self.panic_on_test.store(value, Ordering::SeqCst);
    }

    pub fn set_hang_on_test(&self, value: bool) {
        self.hang_on_test.store(value, Ordering::SeqCst);
    }

    /// `restart()` never returns.
    pub fn set_hang_on_restart(&self, value: bool) {
        self.hang_on_restart.store(value, Ordering::SeqCst);
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.stop_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn set_fail_push_token(&self, value: bool) {
        self.fail_push_token.store(value, Ordering::SeqCst);
    }

    /// Simulate a silent crash.
    pub fn crash(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn restart_calls(&self) -> usize {
        self.restart_calls.load(Ordering::SeqCst)
    }

    pub fn test_calls(&self) -> usize {
        self.test_calls.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn push_token(&self) -> Option<String> {
        self.push_token.lock().clone()
    }

    fn log(&self, action: &str) {
        self.log.push(format!("{}:{}", self.name, action));
    }

    fn store_record(&self, record: Record) -> ComponentResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ComponentError::new(format!("{} is not running", self.name)));
        }
        self.records.lock().push(record);
        Ok(())
    }
}

#[async_trait]
impl Component for MockComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> ComponentResult<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.log("start");
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ComponentError::new(format!("{} refused to start", self.name)));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> ComponentResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.log("stop");
        let delay = self.stop_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.running.store(false, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ComponentError::new(format!("{} failed to stop", self.name)));
        }
        Ok(())
    }

    async fn restart(&self) -> ComponentResult<()> {
        self.restart_calls.fetch_add(1, Ordering::SeqCst);
        self.log("restart");
        if self.hang_on_restart.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_restart.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
            return Err(ComponentError::new(format!("{} failed to restart", self.name)));
        }
        self.needs_restart.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn test_health(&self) -> ComponentResult<HealthReport> {
        self.test_calls.fetch_add(1, Ordering::SeqCst);
        self.log("test");

        if self.panic_on_test.load(Ordering::SeqCst) {
            panic!("{} exploded during health test", self.name);
        }
        if self.hang_on_test.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
        }
        if self.fail_test.load(Ordering::SeqCst) {
            return Err(ComponentError::transient(format!("{} did not answer", self.name)));
        }
        if self.needs_restart.load(Ordering::SeqCst) {
            return Ok(HealthReport::restart("stalled"));
        }
        if !self.is_running() {
            return Ok(HealthReport::restart("not running"));
        }
        Ok(HealthReport::healthy())
    }
}

#[async_trait]
impl LocalStore for MockComponent {
    async fn write_record(&self, record: Record) -> ComponentResult<()> {
        self.store_record(record)
    }
}

#[async_trait]
impl RemoteStore for MockComponent {
    async fn write_record(&self, record: Record) -> ComponentResult<()> {
        self.store_record(record)
    }

    async fn send_push_token(&self, token: &str) -> ComponentResult<()> {
        self.log("push_token");
        if self.fail_push_token.load(Ordering::SeqCst) {
            return Err(ComponentError::transient("backend unreachable"));
        }
        *self.push_token.lock() = Some(token.to_string());
        Ok(())
    }

    async fn delete_push_token(&self) -> ComponentResult<()> {
        self.log("delete_push_token");
        *self.push_token.lock() = None;
        Ok(())
    }
}

/// Sink that records every call.
#[derive(Debug, Default)]
pub struct RecordingSink {
    issued: Mutex<Vec<PendingNotification>>,
    cancelled: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn issued(&self) -> Vec<PendingNotification> {
        self.issued.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    /// Issues plus cancels.
    pub fn update_count(&self) -> usize {
        self.issued.lock().len() + self.cancelled.lock().len()
    }

    pub fn last_count(&self) -> Option<usize> {
        self.issued.lock().last().map(|n| n.count)
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn issue(&self, notification: PendingNotification) -> Result<()> {
        self.issued.lock().push(notification);
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        self.cancelled.lock().push(id.to_string());
        Ok(())
    }
}

/// Listener that records task outcomes.
#[derive(Debug, Default)]
pub struct RecordingListener {
    outcomes: Mutex<Vec<(PendingTask, TaskOutcome)>>,
}

impl RecordingListener {
    pub fn outcomes(&self) -> Vec<(PendingTask, TaskOutcome)> {
        self.outcomes.lock().clone()
    }
}

#[async_trait]
impl TaskOutcomeListener for RecordingListener {
    async fn on_outcome(&self, task: &PendingTask, outcome: TaskOutcome) {
        self.outcomes.lock().push((task.clone(), outcome));
    }
}
