//! Opsdeck Error Types
//!
//! Centralized error handling using thiserror for type-safe errors.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::task::model::{TaskId, TaskState};

/// Top-level error type for opsdeck
#[derive(Error, Debug)]
pub enum OpsdeckError {
    #[error("task error: {0}")]
    Task(#[from] TaskError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("task group error: {0}")]
    Group(#[from] GroupError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Task lifecycle errors
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("{id} failed to spawn: {reason}")]
    SpawnFailed { id: TaskId, reason: String },

    #[error("{id} failed: {reason}")]
    Failed { id: TaskId, reason: String },

    #[error("task dependency failed")]
    DependencyFailed,

    #[error("{id} was canceled")]
    Canceled { id: TaskId },

    #[error("task spec has an empty command")]
    EmptyCommand,

    #[error("invalid task state transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },
}

/// Task store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{id} not found")]
    TaskNotFound { id: TaskId },

    #[error("task group '{id}' not found")]
    GroupNotFound { id: Uuid },

    #[error("{id} is not in a terminal state")]
    NotTerminal { id: TaskId },

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Task group construction errors
#[derive(Error, Debug)]
pub enum GroupError {
    #[error("failed to create any tasks")]
    NoTasksCreated,

    #[error("module dependency cycle involving '{module}'")]
    DependencyCycle { module: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for opsdeck operations
pub type Result<T> = std::result::Result<T, OpsdeckError>;

/// Result type alias for task operations
pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for group operations
pub type GroupResult<T> = std::result::Result<T, GroupError>;

/// Result type alias for config operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
