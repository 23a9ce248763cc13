//! Pending interactive tasks.

mod manager;
pub mod notify;
pub mod ordered;
mod store;
mod task;

pub use manager::{AddOutcome, TaskQueueManager};
pub use notify::{
    LogNotificationSink, NotificationSink, PENDING_NOTIFICATION_ID, PendingNotification,
};
pub use ordered::{insertion_index, ordered_insert, task_order};
pub use store::QueueStore;
pub use task::{PendingTask, RunMode, TaskOutcome, TaskOutcomeListener};
