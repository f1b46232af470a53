//! Runner
//!
//! The queued -> running admission scheduler. On every task event it
//! walks the queued set oldest-first, honouring a global parallelism
//! bound and a single global exclusive slot. Immediate tasks bypass the
//! parallelism bound but never exclusivity.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::task::model::TaskState;
use crate::domain::task::store::{ListFilter, TaskStore};
use crate::domain::task::task::TaskEvent;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of concurrently running tasks
    pub max_parallelism: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 2 * num_cpus::get(),
        }
    }
}

/// Starts queued tasks as capacity frees up.
pub struct Runner {
    store: Arc<TaskStore>,
    config: RunnerConfig,
}

impl Runner {
    #[must_use]
    pub fn new(store: Arc<TaskStore>, config: RunnerConfig) -> Self {
        Self { store, config }
    }

    /// Consume task events, running one admission pass per event. When
    /// `shutdown` flips, no new tasks are started; running tasks are
    /// canceled and awaited, while pending and queued tasks are left in
    /// place.
    pub async fn run(
        self,
        mut events: UnboundedReceiver<TaskEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.pass();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(_event) => self.pass(),
                    None => return,
                },
            }
        }
        self.drain().await;
    }

    /// One admission pass over a store snapshot.
    pub fn pass(&self) {
        let running = self.store.list(&ListFilter {
            states: vec![TaskState::Running],
            ..ListFilter::default()
        });
        let mut avail = self.config.max_parallelism as i64 - running.len() as i64;
        let mut exclusive_taken = running.iter().any(|task| task.is_exclusive());

        let queued = self.store.list(&ListFilter {
            states: vec![TaskState::Queued],
            ..ListFilter::default()
        });

        for task in queued {
            if task.is_exclusive() {
                if exclusive_taken {
                    continue;
                }
                // an immediate exclusive task still consumes the slot
                exclusive_taken = true;
                avail -= 1;
            } else if task.is_immediate() {
                // bypasses the parallelism bound; avail may go negative
            } else {
                if avail <= 0 {
                    continue;
                }
                avail -= 1;
            }

            if let Err(err) = task.start() {
                warn!(task = %task.id(), error = %err, "failed to start task");
            }
        }
    }

    /// Cancel every running task and await termination.
    async fn drain(&self) {
        let running = self.store.list(&ListFilter {
            states: vec![TaskState::Running],
            ..ListFilter::default()
        });
        for task in &running {
            task.cancel();
        }
        for task in &running {
            let _ = task.wait().await;
        }
        debug!(count = running.len(), "runner drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::model::TaskSpec;

    fn sleeping() -> TaskSpec {
        TaskSpec::new(["sh", "-c", "sleep 30"])
    }

    fn runner(store: &Arc<TaskStore>, max_parallelism: usize) -> Runner {
        Runner::new(Arc::clone(store), RunnerConfig { max_parallelism })
    }

    #[tokio::test]
    async fn test_pass_honours_parallelism_bound() {
        let store = TaskStore::new();
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let task = store.create(sleeping()).unwrap();
            store.enqueue(task.id()).unwrap();
            tasks.push(task);
        }

        runner(&store, 2).pass();

        let running: Vec<_> = tasks
            .iter()
            .filter(|task| task.state() == TaskState::Running)
            .collect();
        assert_eq!(running.len(), 2);
        // oldest first
        assert_eq!(running[0].id(), tasks[0].id());
        assert_eq!(running[1].id(), tasks[1].id());

        for task in &tasks {
            task.cancel();
        }
    }

    #[tokio::test]
    async fn test_single_exclusive_slot() {
        let store = TaskStore::new();
        let first = store.create(sleeping().exclusive()).unwrap();
        let second = store.create(sleeping().exclusive()).unwrap();
        store.enqueue(first.id()).unwrap();
        store.enqueue(second.id()).unwrap();

        let runner = runner(&store, 8);
        runner.pass();
        assert_eq!(first.state(), TaskState::Running);
        assert_eq!(second.state(), TaskState::Queued);

        first.cancel();
        first.wait().await.unwrap_err();
        runner.pass();
        assert_eq!(second.state(), TaskState::Running);

        second.cancel();
    }

    #[tokio::test]
    async fn test_immediate_bypasses_parallelism_bound() {
        let store = TaskStore::new();
        let normal = store.create(sleeping()).unwrap();
        let urgent = store.create(sleeping().immediate()).unwrap();
        store.enqueue(normal.id()).unwrap();
        store.enqueue(urgent.id()).unwrap();

        runner(&store, 0).pass();
        assert_eq!(normal.state(), TaskState::Queued);
        assert_eq!(urgent.state(), TaskState::Running);

        urgent.cancel();
    }

    #[tokio::test]
    async fn test_spawn_failure_does_not_abort_pass() {
        let store = TaskStore::new();
        let broken = store
            .create(TaskSpec::new(["/nonexistent/opsdeck-test-binary"]))
            .unwrap();
        let healthy = store.create(TaskSpec::new(["sh", "-c", "true"])).unwrap();
        store.enqueue(broken.id()).unwrap();
        store.enqueue(healthy.id()).unwrap();

        runner(&store, 4).pass();
        assert_eq!(broken.state(), TaskState::Errored);
        healthy.wait().await.unwrap();
    }
}
