//! Collection plans and their lifecycle.

mod definition;
pub mod lifecycle;
mod registry;
mod state;
mod store;

pub use definition::{CollectionPlan, DEFAULT_PARTICIPATION_HORIZON_SECS, PlanSchedule};
pub use lifecycle::{
    ComponentStatus, PlanContext, PlanController, PlanStatus, SequenceReport, StartOutcome,
    StepOutcome, StepStatus, StepTarget,
};
pub use registry::PlanRegistry;
pub use state::{PlanState, StartStage};
pub use store::{PlanRunState, RunStateStore};
