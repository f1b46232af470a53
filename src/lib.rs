//! Opsdeck
//!
//! Task core of an operator console that drives an infrastructure-as-code
//! binary (terraform, tofu, terragrunt) across many on-disk modules and
//! workspaces. It provides:
//! - a process-per-task execution engine with a staged lifecycle
//! - a pending -> queued enqueuer honouring per-owner blocking and task
//!   dependencies
//! - a queued -> running runner honouring a global parallelism bound and
//!   a single exclusive slot
//! - fan-out output buffers serving any number of independent readers
//! - a group builder materialising tasks over a module dependency graph

pub mod app;
pub mod domain;
pub mod error;

pub use error::{OpsdeckError, Result};
