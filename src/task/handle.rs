//! The in-memory handle for one active task.

use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tokio::process::Child;
use tokio::sync::watch;

use crate::config::TaskConfig;
use crate::plugin::{ExitResult, RunState, TaskSpec, TaskStatus};
use crate::stats::CpuTracker;
use crate::virt::{vm_name_for, VmConfig};

/// Fields mutated over the task's lifetime, guarded as one unit so readers
/// never observe a torn exit transition (state, completion time, and exit
/// result are always set together).
#[derive(Debug)]
struct HandleState {
    run_state: RunState,
    started_at: SystemTime,
    completed_at: Option<SystemTime>,
    exit_result: Option<ExitResult>,
    pid: u32,
}

/// A handle to one running task.
///
/// Created at StartTask, owned by the [`crate::task::TaskRegistry`] entry,
/// and shared with the supervision loops. Inspection reads and supervisor
/// writes synchronize on the internal lock; the exit transition is
/// first-writer-wins and terminal.
pub struct TaskHandle {
    spec: TaskSpec,
    task: TaskConfig,
    state: RwLock<HandleState>,
    /// The launcher child, held until a supervisor takes it to wait on.
    child: Mutex<Option<Child>>,
    /// Flips to true exactly once, on the exit transition.
    done_tx: watch::Sender<bool>,
    /// Per-task cancellation for the guest channel and exec sessions.
    cancel_tx: watch::Sender<bool>,
    /// CPU delta tracker, one per task for its whole lifetime.
    cpu_tracker: Mutex<CpuTracker>,
}

impl TaskHandle {
    /// Create a handle for a task whose launcher process just started.
    pub fn new(
        spec: TaskSpec,
        task: TaskConfig,
        pid: u32,
        child: Option<Child>,
        started_at: SystemTime,
    ) -> Self {
        let (done_tx, _) = watch::channel(false);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            spec,
            task,
            state: RwLock::new(HandleState {
                run_state: RunState::Running,
                started_at,
                completed_at: None,
                exit_result: None,
                pid,
            }),
            child: Mutex::new(child),
            done_tx,
            cancel_tx,
            cpu_tracker: Mutex::new(CpuTracker::new()),
        }
    }

    /// The host-level task spec.
    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    /// The decoded driver config block.
    pub fn task_config(&self) -> &TaskConfig {
        &self.task
    }

    /// The VM name for this task's allocation.
    pub fn vm_name(&self) -> String {
        vm_name_for(&self.spec.alloc_id)
    }

    /// Backend view of this task.
    pub fn vm_config(&self) -> VmConfig {
        VmConfig {
            task: self.task.clone(),
            spec: self.spec.clone(),
        }
    }

    /// The launcher pid.
    pub fn pid(&self) -> u32 {
        self.state.read().pid
    }

    /// Whether the task has not exited yet.
    pub fn is_running(&self) -> bool {
        self.state.read().run_state == RunState::Running
    }

    /// The recorded exit result, once the task has exited.
    pub fn exit_result(&self) -> Option<ExitResult> {
        self.state.read().exit_result.clone()
    }

    /// Take the launcher child to wait on it. Only one supervisor gets it.
    pub fn take_child(&self) -> Option<Child> {
        self.child.lock().take()
    }

    /// The task's CPU delta tracker.
    pub fn cpu_tracker(&self) -> &Mutex<CpuTracker> {
        &self.cpu_tracker
    }

    /// A receiver that flips to true when the task exits.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// The per-task cancellation signal.
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Fire the per-task cancellation (guest channel, exec sessions).
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Record the task's exit.
    ///
    /// Returns true when this call performed the transition; false when the
    /// task had already exited, in which case the recorded result is kept
    /// and `result` is dropped. Exited is terminal either way.
    pub fn transition_exited(&self, result: ExitResult) -> bool {
        {
            let mut state = self.state.write();
            if state.run_state == RunState::Exited {
                return false;
            }
            state.run_state = RunState::Exited;
            state.completed_at = Some(SystemTime::now());
            state.exit_result = Some(result);
        }
        let _ = self.done_tx.send(true);
        // A dead task has no live guest channel to keep retrying for.
        let _ = self.cancel_tx.send(true);
        true
    }

    /// Snapshot the task's status for InspectTask.
    pub fn task_status(&self) -> TaskStatus {
        let state = self.state.read();
        let mut driver_attributes = HashMap::new();
        driver_attributes.insert("pid".to_string(), state.pid.to_string());

        TaskStatus {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            state: state.run_state,
            started_at: state.started_at,
            completed_at: state.completed_at,
            exit_result: state.exit_result.clone(),
            driver_attributes,
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("TaskHandle")
            .field("id", &self.spec.id)
            .field("run_state", &state.run_state)
            .field("pid", &state.pid)
            .finish_non_exhaustive()
    }
}
