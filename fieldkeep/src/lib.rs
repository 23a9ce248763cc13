//! fieldkeep library crate.
//!
//! Lifecycle control and health supervision for collection plans, plus the
//! pending task queue. The daemon in `main.rs` wires these together; the
//! modules are public for integration testing.

pub mod clock;
pub mod component;
pub mod components;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod orchestrator;
pub mod panic_hook;
pub mod plan;
pub mod queue;
pub mod scheduler;
pub mod testing;
pub mod utils;

pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
