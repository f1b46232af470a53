//! Task
//!
//! One invocation of the external binary, tracked through a lifecycle
//! state machine from creation to termination. State inspection and
//! mutation are serialised by a per-task mutex; the update event is
//! published after the state field is written and before the lock is
//! released, and lifecycle hooks run outside any lock.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::event::{Broker, Event, EventKind};
use crate::domain::owner::Owner;
use crate::domain::task::buffer::{OutputBuffer, OutputReader};
use crate::domain::task::model::{Hook, ModuleId, TaskHooks, TaskId, TaskSpec, TaskState};
use crate::error::{TaskError, TaskResult};

/// Events published for task mutations.
pub type TaskEvent = Event<Arc<Task>>;

const LOCK: &str = "task lock poisoned";

#[derive(Debug)]
struct Runtime {
    state: TaskState,
    updated_at: DateTime<Utc>,
    error: Option<String>,
    cancel_requested: bool,
    child_pid: Option<u32>,
}

/// One external-process invocation.
pub struct Task {
    id: TaskId,
    command: Vec<String>,
    args: Vec<String>,
    env: Vec<(String, String)>,
    path: PathBuf,
    description: Option<String>,
    json: bool,
    parent: Arc<Owner>,
    module: Option<ModuleId>,
    depends_on: Vec<TaskId>,
    blocking: bool,
    exclusive: bool,
    immediate: bool,
    wait_requested: bool,
    created_at: DateTime<Utc>,
    runtime: Mutex<Runtime>,
    buffer: OutputBuffer,
    hooks: TaskHooks,
    events: Arc<Broker<TaskEvent>>,
    /// Flipped once, after the terminal hooks have run.
    finished: watch::Sender<bool>,
}

impl Task {
    pub(crate) fn new(spec: TaskSpec, events: Arc<Broker<TaskEvent>>) -> Arc<Self> {
        let now = Utc::now();
        let (finished, _) = watch::channel(false);
        Arc::new(Self {
            id: TaskId::next(),
            command: spec.command,
            args: spec.args,
            env: spec.env,
            path: spec.path,
            description: spec.description,
            json: spec.json,
            parent: spec.parent,
            module: spec.module,
            depends_on: spec.depends_on,
            blocking: spec.blocking,
            exclusive: spec.exclusive,
            immediate: spec.immediate,
            wait_requested: spec.wait,
            created_at: now,
            runtime: Mutex::new(Runtime {
                state: TaskState::Pending,
                updated_at: now,
                error: None,
                cancel_requested: false,
                child_pid: None,
            }),
            buffer: OutputBuffer::new(),
            hooks: spec.hooks,
            events,
            finished,
        })
    }

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn command(&self) -> &[String] {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    #[must_use]
    pub fn is_json(&self) -> bool {
        self.json
    }

    #[must_use]
    pub fn parent(&self) -> &Arc<Owner> {
        &self.parent
    }

    #[must_use]
    pub fn module(&self) -> Option<&ModuleId> {
        self.module.as_ref()
    }

    #[must_use]
    pub fn depends_on(&self) -> &[TaskId] {
        &self.depends_on
    }

    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    #[must_use]
    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    #[must_use]
    pub fn wait_requested(&self) -> bool {
        self.wait_requested
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.runtime.lock().expect(LOCK).updated_at
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.runtime.lock().expect(LOCK).state
    }

    /// The terminal error message, if the task errored.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.runtime.lock().expect(LOCK).error.clone()
    }

    /// Full command line for display.
    #[must_use]
    pub fn full_command(&self) -> String {
        self.command
            .iter()
            .chain(self.args.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// A reader view over the task's output, replaying from the start.
    #[must_use]
    pub fn reader(&self) -> OutputReader {
        self.buffer.reader()
    }

    /// A chunk channel over the task's output.
    #[must_use]
    pub fn stream(&self) -> UnboundedReceiver<Vec<u8>> {
        self.buffer.stream()
    }

    /// Snapshot of the output written so far.
    #[must_use]
    pub fn output(&self) -> Vec<u8> {
        self.buffer.contents()
    }

    /// Append diagnostics to the task's output buffer before it starts.
    pub(crate) fn write_output(&self, bytes: &[u8]) {
        self.buffer.write(bytes);
    }

    pub(crate) fn fire_after_create(&self) {
        self.fire(self.hooks.after_create.as_ref());
    }

    /// Await the terminal state; resolves once the terminal hooks have run.
    /// Returns `Ok` for a clean exit and the terminal error otherwise.
    pub async fn wait(&self) -> TaskResult<()> {
        let mut finished = self.finished.subscribe();
        while !*finished.borrow_and_update() {
            if finished.changed().await.is_err() {
                break;
            }
        }
        self.outcome()
    }

    fn outcome(&self) -> TaskResult<()> {
        let rt = self.runtime.lock().expect(LOCK);
        match rt.state {
            TaskState::Exited => Ok(()),
            TaskState::Canceled => Err(TaskError::Canceled { id: self.id }),
            state => Err(TaskError::Failed {
                id: self.id,
                reason: rt
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("task is {state}")),
            }),
        }
    }

    /// Write the new state, stamp the timestamp and publish the update
    /// event, all before the runtime lock is released.
    fn commit_locked(self: &Arc<Self>, rt: &mut Runtime, to: TaskState) {
        rt.state = to;
        rt.updated_at = Utc::now().max(rt.updated_at);
        self.events
            .publish(TaskEvent::new(EventKind::Updated, Arc::clone(self)));
    }

    fn fire(&self, hook: Option<&Hook>) {
        if let Some(hook) = hook {
            let hook = Arc::clone(hook);
            if catch_unwind(AssertUnwindSafe(|| hook(self))).is_err() {
                warn!(task = %self.id, "task lifecycle hook panicked");
            }
        }
    }

    fn fire_terminal(&self, state: TaskState) {
        match state {
            TaskState::Exited => self.fire(self.hooks.after_exited.as_ref()),
            TaskState::Errored => self.fire(self.hooks.after_errored.as_ref()),
            TaskState::Canceled => self.fire(self.hooks.after_canceled.as_ref()),
            _ => {}
        }
        self.fire(self.hooks.after_finish.as_ref());
    }

    /// Transition pending -> queued.
    pub(crate) fn enqueue(self: &Arc<Self>) -> TaskResult<()> {
        {
            let mut rt = self.runtime.lock().expect(LOCK);
            if !rt.state.can_transition_to(TaskState::Queued) {
                return Err(TaskError::InvalidTransition {
                    from: rt.state,
                    to: TaskState::Queued,
                });
            }
            self.commit_locked(&mut rt, TaskState::Queued);
        }
        self.fire(self.hooks.after_queued.as_ref());
        Ok(())
    }

    /// Spawn the child process and transition queued -> running. Never
    /// blocks on completion; a detached supervisor future drives the
    /// terminal transition. On spawn failure the task moves to errored
    /// and the error is returned.
    pub(crate) fn start(self: &Arc<Self>) -> TaskResult<()> {
        let spawned = {
            let mut rt = self.runtime.lock().expect(LOCK);
            if rt.state != TaskState::Queued {
                return Err(TaskError::InvalidTransition {
                    from: rt.state,
                    to: TaskState::Running,
                });
            }
            match self.spawn_child() {
                Ok(child) => {
                    rt.child_pid = child.id();
                    self.commit_locked(&mut rt, TaskState::Running);
                    Ok(child)
                }
                Err(err) => {
                    self.buffer.seal();
                    rt.error = Some(err.to_string());
                    self.commit_locked(&mut rt, TaskState::Errored);
                    Err(err)
                }
            }
        };

        match spawned {
            Ok(child) => {
                self.fire(self.hooks.after_running.as_ref());
                tokio::spawn(Arc::clone(self).supervise(child));
                Ok(())
            }
            Err(err) => {
                self.fire_terminal(TaskState::Errored);
                self.finished.send_replace(true);
                Err(err)
            }
        }
    }

    fn spawn_child(&self) -> TaskResult<Child> {
        let program = self.command.first().ok_or(TaskError::EmptyCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(self.command.iter().skip(1))
            .args(&self.args)
            .current_dir(&self.path)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn().map_err(|err| TaskError::SpawnFailed {
            id: self.id,
            reason: err.to_string(),
        })
    }

    /// Pump child output into the buffer, wait for the child to exit,
    /// seal the buffer, then drive the terminal transition and hooks.
    async fn supervise(self: Arc<Self>, mut child: Child) {
        let out_pump = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(Self::pump(stdout, self.buffer.clone())));
        let err_pump = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(Self::pump(stderr, self.buffer.clone())));

        let status = child.wait().await;

        if let Some(handle) = out_pump {
            let _ = handle.await;
        }
        if let Some(handle) = err_pump {
            let _ = handle.await;
        }

        self.buffer.seal();

        let outcome = match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(format!("process exited with {status}")),
            Err(err) => Err(format!("waiting on process failed: {err}")),
        };

        let final_state = {
            let mut rt = self.runtime.lock().expect(LOCK);
            rt.child_pid = None;
            let to = match &outcome {
                Ok(()) => TaskState::Exited,
                Err(_) if rt.cancel_requested => TaskState::Canceled,
                Err(reason) => {
                    rt.error = Some(reason.clone());
                    TaskState::Errored
                }
            };
            if !rt.state.can_transition_to(to) {
                warn!(task = %self.id, from = %rt.state, to = %to, "dropping invalid terminal transition");
                return;
            }
            self.commit_locked(&mut rt, to);
            to
        };

        if final_state == TaskState::Exited {
            self.fire(self.hooks.after_cli_success.as_ref());
        }
        self.fire_terminal(final_state);
        self.finished.send_replace(true);
        debug!(task = %self.id, state = %final_state, "task finished");
    }

    async fn pump<R: AsyncRead + Unpin>(mut src: R, buffer: OutputBuffer) {
        let mut chunk = [0u8; 4096];
        loop {
            match src.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buffer.write(&chunk[..n]),
                Err(err) => {
                    debug!(error = %err, "task output pump failed");
                    break;
                }
            }
        }
    }

    /// Request cancellation. Idempotent; permitted in any state.
    ///
    /// Pending and queued tasks are canceled directly. Running tasks
    /// receive the operating system's interrupt signal, best effort; the
    /// supervisor completes the transition once the process exits.
    pub fn cancel(self: &Arc<Self>) {
        enum After {
            Canceled,
            Interrupt(Option<u32>),
        }

        let after = {
            let mut rt = self.runtime.lock().expect(LOCK);
            if rt.state.is_terminal() {
                return;
            }
            rt.cancel_requested = true;
            match rt.state {
                TaskState::Pending | TaskState::Queued => {
                    self.buffer.seal();
                    self.commit_locked(&mut rt, TaskState::Canceled);
                    After::Canceled
                }
                _ => After::Interrupt(rt.child_pid),
            }
        };

        match after {
            After::Canceled => {
                self.fire(self.hooks.after_canceled.as_ref());
                self.fire(self.hooks.after_finish.as_ref());
                self.finished.send_replace(true);
            }
            After::Interrupt(pid) => self.interrupt(pid),
        }
    }

    #[cfg(unix)]
    fn interrupt(&self, pid: Option<u32>) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = pid else { return };
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            debug!(task = %self.id, error = %err, "failed to deliver interrupt");
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&self, _pid: Option<u32>) {
        debug!(task = %self.id, "interrupt is not supported on this platform");
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn broker() -> Arc<Broker<TaskEvent>> {
        Arc::new(Broker::new())
    }

    fn shell(script: &str) -> TaskSpec {
        TaskSpec::new(["sh", "-c", script])
    }

    #[tokio::test]
    async fn test_clean_exit() {
        let task = Task::new(shell("echo hello"), broker());
        task.enqueue().unwrap();
        task.start().unwrap();

        task.wait().await.unwrap();
        assert_eq!(task.state(), TaskState::Exited);
        assert!(task.error().is_none());
        assert_eq!(task.output(), b"hello\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_errors() {
        let task = Task::new(shell("exit 3"), broker());
        task.enqueue().unwrap();
        task.start().unwrap();

        let err = task.wait().await.unwrap_err();
        assert!(matches!(err, TaskError::Failed { .. }));
        assert_eq!(task.state(), TaskState::Errored);
        assert!(task.error().unwrap().contains("exit"));
    }

    #[tokio::test]
    async fn test_spawn_failure_errors() {
        let task = Task::new(
            TaskSpec::new(["/nonexistent/opsdeck-test-binary"]),
            broker(),
        );
        task.enqueue().unwrap();

        let err = task.start().unwrap_err();
        assert!(matches!(err, TaskError::SpawnFailed { .. }));
        assert_eq!(task.state(), TaskState::Errored);
        assert!(task.error().is_some());
        task.wait().await.unwrap_err();
    }

    #[tokio::test]
    async fn test_cancel_pending_goes_straight_to_canceled() {
        let task = Task::new(shell("true"), broker());
        task.cancel();

        assert_eq!(task.state(), TaskState::Canceled);
        assert!(matches!(
            task.wait().await.unwrap_err(),
            TaskError::Canceled { .. }
        ));

        // no child was ever spawned, and the task cannot be revived
        assert!(matches!(
            task.enqueue().unwrap_err(),
            TaskError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_interrupts_child() {
        let task = Task::new(shell("sleep 30"), broker());
        task.enqueue().unwrap();
        task.start().unwrap();
        assert_eq!(task.state(), TaskState::Running);

        task.cancel();
        let err = task.wait().await.unwrap_err();
        assert!(matches!(err, TaskError::Canceled { .. }));
        assert_eq!(task.state(), TaskState::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let task = Task::new(shell("true"), broker());
        task.cancel();
        task.cancel();
        assert_eq!(task.state(), TaskState::Canceled);
    }

    #[tokio::test]
    async fn test_hooks_fire_in_order() {
        let queued = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let exited = Arc::new(AtomicUsize::new(0));
        let success = Arc::new(AtomicUsize::new(0));
        let finish = Arc::new(AtomicUsize::new(0));

        let hook = |counter: &Arc<AtomicUsize>| {
            let counter = Arc::clone(counter);
            Some(Arc::new(move |_: &Task| {
                counter.fetch_add(1, Ordering::SeqCst);
            }) as Hook)
        };

        let hooks = TaskHooks {
            after_queued: hook(&queued),
            after_running: hook(&running),
            after_exited: hook(&exited),
            after_cli_success: hook(&success),
            after_finish: hook(&finish),
            ..TaskHooks::default()
        };

        let task = Task::new(shell("true").with_hooks(hooks), broker());
        task.enqueue().unwrap();
        task.start().unwrap();
        task.wait().await.unwrap();

        assert_eq!(queued.load(Ordering::SeqCst), 1);
        assert_eq!(running.load(Ordering::SeqCst), 1);
        assert_eq!(exited.load(Ordering::SeqCst), 1);
        assert_eq!(success.load(Ordering::SeqCst), 1);
        assert_eq!(finish.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hook_panic_does_not_corrupt_state() {
        let hooks = TaskHooks {
            after_exited: Some(Arc::new(|_: &Task| panic!("boom"))),
            ..TaskHooks::default()
        };
        let task = Task::new(shell("true").with_hooks(hooks), broker());
        task.enqueue().unwrap();
        task.start().unwrap();

        task.wait().await.unwrap();
        assert_eq!(task.state(), TaskState::Exited);
    }

    #[tokio::test]
    async fn test_every_transition_publishes_one_event() {
        let events = broker();
        let mut rx = events.subscribe();
        let task = Task::new(shell("true"), events);
        task.enqueue().unwrap();
        task.start().unwrap();
        task.wait().await.unwrap();

        // queued, running, exited
        let mut updates = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.kind, EventKind::Updated);
            assert_eq!(event.payload.id(), task.id());
            updates += 1;
        }
        assert_eq!(updates, 3);
    }

    #[tokio::test]
    async fn test_env_and_workdir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let task = Task::new(
            shell("echo \"$OPSDECK_TEST_MARKER $PWD\"")
                .with_env("OPSDECK_TEST_MARKER", "marker")
                .with_path(dir.path()),
            broker(),
        );
        task.enqueue().unwrap();
        task.start().unwrap();
        task.wait().await.unwrap();

        let output = String::from_utf8(task.output()).unwrap();
        assert!(output.contains("marker"));
    }
}
