//! Task Model
//!
//! Identifiers, lifecycle states, specs and lifecycle hooks for the task
//! subsystem.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::owner::Owner;
use crate::domain::task::task::Task;

/// Module identifier used by the group builder for dependency ordering.
pub type ModuleId = String;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Task identifier: opaque, stable, and sortable by creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Created, waiting for the enqueuer's admission gate
    Pending,
    /// Admitted, waiting for a runner slot
    Queued,
    /// Child process is alive
    Running,
    /// Child process exited cleanly
    Exited,
    /// Spawn failure or non-zero exit
    Errored,
    /// Canceled before or during execution
    Canceled,
}

impl TaskState {
    /// Check if the state is terminal; terminal tasks never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Exited | TaskState::Errored | TaskState::Canceled
        )
    }

    /// Queued or running; active tasks hold their owner's blocking claim.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Running)
    }

    /// Whether the state machine permits moving to `to`.
    ///
    /// Queued -> Errored covers spawn failure, which terminates a task that
    /// never reached running.
    #[must_use]
    pub fn can_transition_to(&self, to: TaskState) -> bool {
        matches!(
            (self, to),
            (TaskState::Pending, TaskState::Queued)
                | (TaskState::Pending, TaskState::Canceled)
                | (TaskState::Queued, TaskState::Running)
                | (TaskState::Queued, TaskState::Errored)
                | (TaskState::Queued, TaskState::Canceled)
                | (TaskState::Running, TaskState::Exited)
                | (TaskState::Running, TaskState::Errored)
                | (TaskState::Running, TaskState::Canceled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Queued => write!(f, "queued"),
            TaskState::Running => write!(f, "running"),
            TaskState::Exited => write!(f, "exited"),
            TaskState::Errored => write!(f, "errored"),
            TaskState::Canceled => write!(f, "canceled"),
        }
    }
}

/// Module-level dependency declaration carried on a spec; resolved to
/// task-level edges by the group builder.
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    pub module_ids: Vec<ModuleId>,
}

/// A lifecycle hook; receives the task after the transition completes.
pub type Hook = Arc<dyn Fn(&Task) + Send + Sync>;

/// Optional lifecycle callbacks, invoked outside any task lock.
#[derive(Clone, Default)]
pub struct TaskHooks {
    pub after_create: Option<Hook>,
    pub after_queued: Option<Hook>,
    pub after_running: Option<Hook>,
    pub after_exited: Option<Hook>,
    pub after_errored: Option<Hook>,
    pub after_canceled: Option<Hook>,
    /// Runs after any terminal transition.
    pub after_finish: Option<Hook>,
    /// Runs only when the child process exited cleanly.
    pub after_cli_success: Option<Hook>,
}

impl fmt::Debug for TaskHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = |hook: &Option<Hook>| if hook.is_some() { "set" } else { "unset" };
        f.debug_struct("TaskHooks")
            .field("after_create", &set(&self.after_create))
            .field("after_queued", &set(&self.after_queued))
            .field("after_running", &set(&self.after_running))
            .field("after_exited", &set(&self.after_exited))
            .field("after_errored", &set(&self.after_errored))
            .field("after_canceled", &set(&self.after_canceled))
            .field("after_finish", &set(&self.after_finish))
            .field("after_cli_success", &set(&self.after_cli_success))
            .finish()
    }
}

/// Declarative description from which a task is constructed.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Program and sub-commands, e.g. `["terraform", "plan"]`
    pub command: Vec<String>,
    /// Extra arguments appended after the command
    pub args: Vec<String>,
    /// Environment entries merged over the ambient environment
    pub env: Vec<(String, String)>,
    /// Working directory for the child process
    pub path: PathBuf,
    /// Owning entity for blocking scope
    pub parent: Arc<Owner>,
    /// Module the task operates on, used for group dependency ordering
    pub module: Option<ModuleId>,
    /// Module-level dependencies, consumed by the group builder
    pub dependencies: Option<Dependencies>,
    /// Direct task dependencies; the task runs only once all have exited
    pub depends_on: Vec<TaskId>,
    /// While active, blocks sibling tasks under the same owner
    pub blocking: bool,
    /// Globally at most one such task may run
    pub exclusive: bool,
    /// Bypass the parallelism bound at scheduling time
    pub immediate: bool,
    /// Creator intends to synchronise on completion
    pub wait: bool,
    /// Output is JSON; a rendering hint with no semantic effect
    pub json: bool,
    /// Human-readable label
    pub description: Option<String>,
    /// Lifecycle callbacks
    pub hooks: TaskHooks,
}

impl TaskSpec {
    /// Create a spec for `command`, rooted at the current directory under a
    /// fresh global owner.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            args: Vec::new(),
            env: Vec::new(),
            path: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            parent: Owner::global(),
            module: None,
            dependencies: None,
            depends_on: Vec::new(),
            blocking: false,
            exclusive: false,
            immediate: false,
            wait: false,
            json: false,
            description: None,
            hooks: TaskHooks::default(),
        }
    }

    /// Builder: set extra arguments
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: add an environment entry
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Builder: set the working directory
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Builder: set the owning entity
    #[must_use]
    pub fn with_parent(mut self, parent: Arc<Owner>) -> Self {
        self.parent = parent;
        self
    }

    /// Builder: set the module this task operates on
    #[must_use]
    pub fn with_module(mut self, module: impl Into<ModuleId>) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Builder: declare module-level dependencies
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, module_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ModuleId>,
    {
        self.dependencies = Some(Dependencies {
            module_ids: module_ids.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Builder: set direct task dependencies
    #[must_use]
    pub fn with_depends_on(mut self, ids: Vec<TaskId>) -> Self {
        self.depends_on = ids;
        self
    }

    /// Builder: block siblings under the same owner while active
    #[must_use]
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Builder: globally singleton while running
    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Builder: bypass the parallelism bound
    #[must_use]
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Builder: creator synchronises on completion
    #[must_use]
    pub fn wait(mut self) -> Self {
        self.wait = true;
        self
    }

    /// Builder: mark the output as JSON
    #[must_use]
    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Builder: set the UI label
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder: set lifecycle callbacks
    #[must_use]
    pub fn with_hooks(mut self, hooks: TaskHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_sort_by_creation_order() {
        let first = TaskId::next();
        let second = TaskId::next();
        let third = TaskId::next();
        assert!(first < second);
        assert!(second < third);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Exited.is_terminal());
        assert!(TaskState::Errored.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn test_transition_table() {
        use TaskState::*;

        assert!(Pending.can_transition_to(Queued));
        assert!(Pending.can_transition_to(Canceled));
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Errored));
        assert!(Queued.can_transition_to(Canceled));
        assert!(Running.can_transition_to(Exited));
        assert!(Running.can_transition_to(Errored));
        assert!(Running.can_transition_to(Canceled));

        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Exited));
        assert!(!Queued.can_transition_to(Exited));
        assert!(!Exited.can_transition_to(Running));
        assert!(!Canceled.can_transition_to(Queued));
        assert!(!Errored.can_transition_to(Exited));
    }

    #[test]
    fn test_spec_builder() {
        let spec = TaskSpec::new(["terraform", "plan"])
            .with_args(["-input=false"])
            .with_env("TF_IN_AUTOMATION", "1")
            .with_path("/tmp")
            .with_module("vpc")
            .with_dependencies(["network"])
            .blocking()
            .json()
            .with_description("plan vpc");

        assert_eq!(spec.command, vec!["terraform", "plan"]);
        assert_eq!(spec.args, vec!["-input=false"]);
        assert_eq!(
            spec.env,
            vec![("TF_IN_AUTOMATION".to_string(), "1".to_string())]
        );
        assert_eq!(spec.module.as_deref(), Some("vpc"));
        assert!(spec.blocking);
        assert!(!spec.exclusive);
        assert!(spec.json);
        assert_eq!(
            spec.dependencies.unwrap().module_ids,
            vec!["network".to_string()]
        );
    }
}
