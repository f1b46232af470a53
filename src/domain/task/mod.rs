//! Task Subsystem
//!
//! Task model, output buffering, store, enqueuer, runner and the group
//! builder.

pub mod buffer;
pub mod enqueuer;
pub mod group;
pub mod model;
pub mod runner;
pub mod store;
#[allow(clippy::module_inception)]
pub mod task;

pub use buffer::{OutputBuffer, OutputReader};
pub use enqueuer::Enqueuer;
pub use group::{GroupEvent, GroupId, TaskGroup};
pub use model::{Dependencies, Hook, ModuleId, TaskHooks, TaskId, TaskSpec, TaskState};
pub use runner::{Runner, RunnerConfig};
pub use store::{ListFilter, TaskStore};
pub use task::{Task, TaskEvent};
