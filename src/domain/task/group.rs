//! Task Groups
//!
//! A batch of tasks created together from one command label. Specs that
//! carry a module id are arranged into a module-level dependency graph;
//! tasks are then created in topological order (optionally reversed, for
//! destroy-style operations) with task dependencies wired to the tasks
//! of neighbouring modules.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::warn;
use uuid::Uuid;

use crate::domain::event::Event;
use crate::domain::task::model::{ModuleId, TaskId, TaskSpec, TaskState};
use crate::domain::task::store::TaskStore;
use crate::domain::task::task::Task;
use crate::error::{GroupError, GroupResult};

/// Task group identifier
pub type GroupId = Uuid;

/// Events published for group mutations.
pub type GroupEvent = Event<Arc<TaskGroup>>;

/// A batch of tasks created together.
pub struct TaskGroup {
    id: GroupId,
    command: String,
    created_at: DateTime<Utc>,
    tasks: Vec<Arc<Task>>,
    create_errors: Vec<String>,
}

impl TaskGroup {
    #[must_use]
    pub fn id(&self) -> GroupId {
        self.id
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Tasks successfully created, in creation order.
    #[must_use]
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    /// Errors for specs that could not be turned into tasks.
    #[must_use]
    pub fn create_errors(&self) -> &[String] {
        &self.create_errors
    }

    /// Whether the group contains the given task.
    #[must_use]
    pub fn includes(&self, id: TaskId) -> bool {
        self.tasks.iter().any(|task| task.id() == id)
    }

    /// Number of member tasks in a terminal state.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.count(TaskState::is_terminal)
    }

    #[must_use]
    pub fn exited(&self) -> usize {
        self.count(|state| *state == TaskState::Exited)
    }

    #[must_use]
    pub fn errored(&self) -> usize {
        self.count(|state| *state == TaskState::Errored)
    }

    #[must_use]
    pub fn canceled(&self) -> usize {
        self.count(|state| *state == TaskState::Canceled)
    }

    fn count(&self, pred: impl Fn(&TaskState) -> bool) -> usize {
        self.tasks
            .iter()
            .filter(|task| pred(&task.state()))
            .count()
    }

    /// One-line result summary for the UI.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} successful; {} errored; {} canceled; {} uncreated",
            self.exited(),
            self.errored(),
            self.canceled(),
            self.create_errors.len()
        )
    }

    /// True when any counter other than exited is non-zero.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.errored() > 0 || self.canceled() > 0 || !self.create_errors.is_empty()
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("tasks", &self.tasks.len())
            .field("create_errors", &self.create_errors.len())
            .finish()
    }
}

/// Build a group from `specs`, creating tasks through the store.
///
/// Specs without a module id are created first, in input order. The
/// remaining specs are bucketed per module; buckets become nodes of a
/// dependency graph whose edges follow the declared module dependencies
/// (dependencies outside the batch are ignored). Nodes are visited in
/// topological order, dependencies first, so that each spec's task
/// dependencies can point at the tasks already created for neighbouring
/// modules. With `reverse` the order flips and each task instead waits
/// for the tasks of the modules depending on its own.
pub(crate) fn build_group(
    store: &TaskStore,
    command: &str,
    reverse: bool,
    specs: Vec<TaskSpec>,
) -> GroupResult<TaskGroup> {
    let mut group = TaskGroup {
        id: Uuid::new_v4(),
        command: command.to_string(),
        created_at: Utc::now(),
        tasks: Vec::new(),
        create_errors: Vec::new(),
    };

    let mut independent: Vec<TaskSpec> = Vec::new();
    let mut buckets: HashMap<ModuleId, Vec<TaskSpec>> = HashMap::new();
    let mut declared_deps: HashMap<ModuleId, Vec<ModuleId>> = HashMap::new();
    let mut module_order: Vec<ModuleId> = Vec::new();

    for spec in specs {
        let Some(module) = spec.module.clone() else {
            independent.push(spec);
            continue;
        };
        if !buckets.contains_key(&module) {
            module_order.push(module.clone());
        }
        if let Some(dependencies) = &spec.dependencies {
            let deps = declared_deps.entry(module.clone()).or_default();
            for dep in &dependencies.module_ids {
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
        }
        buckets.entry(module).or_default().push(spec);
    }

    // module graph: an edge runs from a dependency to its dependent
    let mut graph: DiGraph<ModuleId, ()> = DiGraph::new();
    let mut index: HashMap<ModuleId, NodeIndex> = HashMap::new();
    for module in &module_order {
        index.insert(module.clone(), graph.add_node(module.clone()));
    }
    for module in &module_order {
        let Some(deps) = declared_deps.get(module) else {
            continue;
        };
        for dep in deps {
            if let (Some(&from), Some(&to)) = (index.get(dep), index.get(module)) {
                graph.add_edge(from, to, ());
            }
        }
    }

    let mut order = toposort(&graph, None).map_err(|cycle| GroupError::DependencyCycle {
        module: graph[cycle.node_id()].clone(),
    })?;
    if reverse {
        order.reverse();
    }

    for spec in independent {
        create_into(store, &mut group, spec);
    }

    // forward: wait on the tasks of dependency modules (incoming edges);
    // reverse: wait on the tasks of dependent modules (outgoing edges)
    let direction = if reverse {
        Direction::Outgoing
    } else {
        Direction::Incoming
    };

    let mut created: HashMap<ModuleId, Vec<TaskId>> = HashMap::new();
    for node in order {
        let module = graph[node].clone();
        let mut depends_on: Vec<TaskId> = Vec::new();
        for neighbour in graph.neighbors_directed(node, direction) {
            if let Some(ids) = created.get(&graph[neighbour]) {
                depends_on.extend(ids.iter().copied());
            }
        }

        let mut ids = Vec::new();
        for mut spec in buckets.remove(&module).unwrap_or_default() {
            spec.depends_on = depends_on.clone();
            if let Some(id) = create_into(store, &mut group, spec) {
                ids.push(id);
            }
        }
        created.insert(module, ids);
    }

    Ok(group)
}

fn create_into(store: &TaskStore, group: &mut TaskGroup, spec: TaskSpec) -> Option<TaskId> {
    match store.create(spec) {
        Ok(task) => {
            let id = task.id();
            group.tasks.push(task);
            Some(id)
        }
        Err(err) => {
            warn!(group = %group.id, error = %err, "failed to create group task");
            group.create_errors.push(err.to_string());
            None
        }
    }
}
