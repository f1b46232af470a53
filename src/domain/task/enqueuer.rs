//! Enqueuer
//!
//! The pending -> queued admission gate. On every task event it
//! re-evaluates the pending set: a task is promoted once no ancestor
//! owner is claimed by an active blocking task and every dependency has
//! exited. A task whose dependency ended canceled or errored can never
//! run; it is canceled with a diagnostic written to its output buffer.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;
use uuid::Uuid;

use crate::domain::task::model::TaskState;
use crate::domain::task::store::{ListFilter, TaskStore};
use crate::domain::task::task::{Task, TaskEvent};
use crate::error::TaskError;

enum DependencyStatus {
    /// All dependencies exited
    Ready,
    /// At least one dependency is still pending, queued or running
    Waiting,
    /// At least one dependency ended canceled or errored, or was deleted
    Failed,
}

/// Promotes pending tasks to queued as owners unblock and dependencies
/// complete.
pub struct Enqueuer {
    store: Arc<TaskStore>,
}

impl Enqueuer {
    #[must_use]
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }

    /// Consume task events, running one promotion pass per event.
    pub async fn run(self, mut events: UnboundedReceiver<TaskEvent>) {
        self.pass();
        while let Some(_event) = events.recv().await {
            self.pass();
        }
    }

    /// One promotion pass over a store snapshot.
    pub fn pass(&self) {
        for task in self.enqueuable() {
            if let Err(err) = self.store.enqueue(task.id()) {
                warn!(task = %task.id(), error = %err, "failed to enqueue task");
            }
        }
    }

    fn enqueuable(&self) -> Vec<Arc<Task>> {
        let active = self.store.list(&ListFilter {
            states: vec![TaskState::Queued, TaskState::Running],
            ..ListFilter::default()
        });
        let mut blocked: HashSet<Uuid> = active
            .iter()
            .filter(|task| task.is_blocking())
            .map(|task| task.parent().id())
            .collect();

        let pending = self.store.list(&ListFilter {
            states: vec![TaskState::Pending],
            ..ListFilter::default()
        });

        let mut promoted = Vec::new();
        for task in pending {
            // immediate tasks skip the ancestor blocking check
            if !task.is_immediate()
                && task
                    .parent()
                    .ancestor_ids()
                    .iter()
                    .any(|id| blocked.contains(id))
            {
                continue;
            }

            match self.dependency_status(&task) {
                DependencyStatus::Waiting => continue,
                DependencyStatus::Failed => {
                    task.write_output(format!("{}\n", TaskError::DependencyFailed).as_bytes());
                    task.cancel();
                    continue;
                }
                DependencyStatus::Ready => {}
            }

            // claim the owner so only one blocking task is released per pass
            if task.is_blocking() {
                blocked.insert(task.parent().id());
            }
            promoted.push(task);
        }
        promoted
    }

    fn dependency_status(&self, task: &Arc<Task>) -> DependencyStatus {
        for dep_id in task.depends_on() {
            let Ok(dep) = self.store.get(*dep_id) else {
                // a deleted dependency can never exit
                return DependencyStatus::Failed;
            };
            match dep.state() {
                TaskState::Exited => {}
                TaskState::Canceled | TaskState::Errored => return DependencyStatus::Failed,
                _ => return DependencyStatus::Waiting,
            }
        }
        DependencyStatus::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::owner::{Owner, OwnerKind};
    use crate::domain::task::model::TaskSpec;

    fn spec() -> TaskSpec {
        TaskSpec::new(["sh", "-c", "true"])
    }

    fn enqueuer(store: &Arc<TaskStore>) -> Enqueuer {
        Enqueuer::new(Arc::clone(store))
    }

    #[test]
    fn test_promotes_pending_tasks_fifo() {
        let store = TaskStore::new();
        let first = store.create(spec()).unwrap();
        let second = store.create(spec()).unwrap();

        enqueuer(&store).pass();
        assert_eq!(first.state(), TaskState::Queued);
        assert_eq!(second.state(), TaskState::Queued);
    }

    #[test]
    fn test_one_blocking_task_per_owner_per_pass() {
        let store = TaskStore::new();
        let root = Owner::global();
        let module = Owner::child(&root, OwnerKind::Module);

        let first = store
            .create(spec().with_parent(Arc::clone(&module)).blocking())
            .unwrap();
        let second = store
            .create(spec().with_parent(Arc::clone(&module)).blocking())
            .unwrap();

        let enqueuer = enqueuer(&store);
        enqueuer.pass();
        assert_eq!(first.state(), TaskState::Queued);
        assert_eq!(second.state(), TaskState::Pending);

        // still blocked while the first is active
        enqueuer.pass();
        assert_eq!(second.state(), TaskState::Pending);

        first.cancel();
        enqueuer.pass();
        assert_eq!(second.state(), TaskState::Queued);
    }

    #[test]
    fn test_blocking_claim_covers_descendant_owners() {
        let store = TaskStore::new();
        let root = Owner::global();
        let module = Owner::child(&root, OwnerKind::Module);
        let workspace = Owner::child(&module, OwnerKind::Workspace);

        let blocker = store
            .create(spec().with_parent(Arc::clone(&module)).blocking())
            .unwrap();
        let nested = store
            .create(spec().with_parent(Arc::clone(&workspace)))
            .unwrap();

        let enqueuer = enqueuer(&store);
        enqueuer.pass();
        assert_eq!(blocker.state(), TaskState::Queued);
        assert_eq!(nested.state(), TaskState::Pending);
    }

    #[test]
    fn test_immediate_bypasses_blocking() {
        let store = TaskStore::new();
        let root = Owner::global();
        let module = Owner::child(&root, OwnerKind::Module);

        let blocker = store
            .create(spec().with_parent(Arc::clone(&module)).blocking())
            .unwrap();
        let urgent = store
            .create(spec().with_parent(Arc::clone(&module)).immediate())
            .unwrap();

        let enqueuer = enqueuer(&store);
        enqueuer.pass();
        enqueuer.pass();
        assert_eq!(blocker.state(), TaskState::Queued);
        assert_eq!(urgent.state(), TaskState::Queued);
    }

    #[test]
    fn test_waits_for_nonterminal_dependency() {
        let store = TaskStore::new();
        let dep = store.create(spec()).unwrap();
        let task = store
            .create(spec().with_depends_on(vec![dep.id()]))
            .unwrap();

        let enqueuer = enqueuer(&store);
        enqueuer.pass();
        assert_eq!(dep.state(), TaskState::Queued);
        assert_eq!(task.state(), TaskState::Pending);
    }

    #[test]
    fn test_failed_dependency_cancels_task() {
        let store = TaskStore::new();
        let dep = store.create(spec()).unwrap();
        let task = store
            .create(spec().with_depends_on(vec![dep.id()]))
            .unwrap();

        dep.cancel();
        enqueuer(&store).pass();

        assert_eq!(task.state(), TaskState::Canceled);
        let output = String::from_utf8(task.output()).unwrap();
        assert!(output.contains("task dependency failed"));
    }

    #[test]
    fn test_deleted_dependency_counts_as_failed() {
        let store = TaskStore::new();
        let dep = store.create(spec()).unwrap();
        let task = store
            .create(spec().with_depends_on(vec![dep.id()]))
            .unwrap();

        dep.cancel();
        store.delete(dep.id()).unwrap();
        enqueuer(&store).pass();

        assert_eq!(task.state(), TaskState::Canceled);
    }
}
