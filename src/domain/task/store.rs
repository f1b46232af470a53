//! Task Store
//!
//! In-memory table of tasks and task groups, and the sole owner of both
//! for their lifetime. Every state-affecting operation publishes exactly
//! one typed event; late subscribers do not receive historical events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::domain::event::{Broker, EventKind};
use crate::domain::task::group::{build_group, GroupEvent, GroupId, TaskGroup};
use crate::domain::task::model::{TaskId, TaskSpec, TaskState};
use crate::domain::task::task::{Task, TaskEvent};
use crate::error::{GroupError, GroupResult, StoreError, StoreResult, TaskError};

const LOCK: &str = "store lock poisoned";

/// Conjunctive task filter for [`TaskStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Match tasks with this working directory
    pub path: Option<PathBuf>,
    /// Match tasks in any of these states; empty matches all states
    pub states: Vec<TaskState>,
    /// Match only blocking tasks
    pub blocking: bool,
    /// Match only exclusive tasks
    pub exclusive: bool,
    /// Sort newest-first by last update instead of oldest-first
    pub newest_first: bool,
}

impl ListFilter {
    fn matches(&self, task: &Task) -> bool {
        if let Some(path) = &self.path {
            if task.path() != path {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&task.state()) {
            return false;
        }
        if self.blocking && !task.is_blocking() {
            return false;
        }
        if self.exclusive && !task.is_exclusive() {
            return false;
        }
        true
    }
}

/// In-memory table of tasks and groups with typed change events.
pub struct TaskStore {
    tasks: Mutex<HashMap<TaskId, Arc<Task>>>,
    groups: Mutex<HashMap<GroupId, Arc<TaskGroup>>>,
    task_events: Arc<Broker<TaskEvent>>,
    group_events: Arc<Broker<GroupEvent>>,
}

impl TaskStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            task_events: Arc::new(Broker::new()),
            group_events: Arc::new(Broker::new()),
        })
    }

    /// Subscribe to task events.
    pub fn subscribe(&self) -> UnboundedReceiver<TaskEvent> {
        self.task_events.subscribe()
    }

    /// Subscribe to group events.
    pub fn subscribe_groups(&self) -> UnboundedReceiver<GroupEvent> {
        self.group_events.subscribe()
    }

    /// Create a task in the pending state and publish its create event.
    pub fn create(&self, spec: TaskSpec) -> StoreResult<Arc<Task>> {
        if spec.command.is_empty() {
            return Err(TaskError::EmptyCommand.into());
        }
        let task = Task::new(spec, Arc::clone(&self.task_events));
        self.tasks
            .lock()
            .expect(LOCK)
            .insert(task.id(), Arc::clone(&task));
        self.task_events
            .publish(TaskEvent::new(EventKind::Created, Arc::clone(&task)));
        task.fire_after_create();
        debug!(task = %task.id(), command = %task.full_command(), "task created");
        Ok(task)
    }

    /// Create a batch of tasks under one command label, wiring module
    /// dependencies into task dependencies. With `reverse` set, tasks on
    /// a dependency module wait for tasks on the modules that depend on
    /// it (destroy-style ordering).
    ///
    /// The group is registered and its create event published even when
    /// no task could be created; that case additionally returns an error.
    pub fn create_group(
        &self,
        command: &str,
        reverse: bool,
        specs: Vec<TaskSpec>,
    ) -> GroupResult<Arc<TaskGroup>> {
        let group = Arc::new(build_group(self, command, reverse, specs)?);
        self.groups
            .lock()
            .expect(LOCK)
            .insert(group.id(), Arc::clone(&group));
        self.group_events
            .publish(GroupEvent::new(EventKind::Created, Arc::clone(&group)));
        debug!(group = %group.id(), command = %group.command(), tasks = group.tasks().len(), "task group created");
        if group.tasks().is_empty() {
            return Err(GroupError::NoTasksCreated);
        }
        Ok(group)
    }

    /// Transition a pending task to queued.
    pub fn enqueue(&self, id: TaskId) -> StoreResult<Arc<Task>> {
        let task = self.get(id)?;
        task.enqueue()?;
        Ok(task)
    }

    /// Request cancellation of a task.
    pub fn cancel(&self, id: TaskId) -> StoreResult<Arc<Task>> {
        let task = self.get(id)?;
        task.cancel();
        Ok(task)
    }

    /// Remove a task from the table. Refused while the task is live.
    pub fn delete(&self, id: TaskId) -> StoreResult<()> {
        let task = {
            let mut tasks = self.tasks.lock().expect(LOCK);
            let task = tasks
                .get(&id)
                .ok_or(StoreError::TaskNotFound { id })?;
            if !task.state().is_terminal() {
                return Err(StoreError::NotTerminal { id });
            }
            let task = Arc::clone(task);
            tasks.remove(&id);
            task
        };
        self.task_events
            .publish(TaskEvent::new(EventKind::Deleted, task));
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> StoreResult<Arc<Task>> {
        self.tasks
            .lock()
            .expect(LOCK)
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound { id })
    }

    pub fn get_group(&self, id: GroupId) -> StoreResult<Arc<TaskGroup>> {
        self.groups
            .lock()
            .expect(LOCK)
            .get(&id)
            .cloned()
            .ok_or(StoreError::GroupNotFound { id })
    }

    /// A consistent snapshot of tasks matching `filter`, sorted by last
    /// update with task id as tiebreak.
    pub fn list(&self, filter: &ListFilter) -> Vec<Arc<Task>> {
        let mut tasks: Vec<Arc<Task>> = {
            let table = self.tasks.lock().expect(LOCK);
            table
                .values()
                .filter(|task| filter.matches(task))
                .cloned()
                .collect()
        };
        // cache keys so concurrent transitions cannot skew the comparator
        tasks.sort_by_cached_key(|task| (task.updated_at(), task.id()));
        if filter.newest_first {
            tasks.reverse();
        }
        tasks
    }

    /// All groups, oldest first.
    pub fn list_groups(&self) -> Vec<Arc<TaskGroup>> {
        let mut groups: Vec<Arc<TaskGroup>> = self
            .groups
            .lock()
            .expect(LOCK)
            .values()
            .cloned()
            .collect();
        groups.sort_by_key(|group| group.created_at());
        groups
    }

    /// Number of tasks currently in the table.
    #[must_use]
    pub fn counter(&self) -> usize {
        self.tasks.lock().expect(LOCK).len()
    }

    /// Close every event subscription.
    pub fn shutdown(&self) {
        self.task_events.shutdown();
        self.group_events.shutdown();
    }
}
