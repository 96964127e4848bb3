//! Task supervision.
//!
//! Two strategies run side by side for one task. The launcher watcher blocks
//! on the child process's exit and records the real exit status. The status
//! monitor polls the virtualizer, because the launcher can outlive the VM
//! (and vice versa during recovery, when there is no child to wait on at
//! all) and the VM layer pushes no notifications. Whichever observes death
//! first wins the exit transition; the other finds the handle already
//! Exited and stands down.
//!
//! Every loop honors two independent cancellation sources: the call-scoped
//! one (the host dropping its wait subscription) and the process-wide
//! shutdown signal. Either ends supervision without emitting a result.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::plugin::ExitResult;
use crate::task::TaskHandle;
use crate::virt::{Virtualizer, VmState};

/// Interval between VM status polls.
pub(crate) const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Delay before re-checking a non-Running status observation.
pub(crate) const STATUS_CONFIRM_DELAY: Duration = Duration::from_secs(1);

/// Resolve when the watch signal fires (or its sender is gone, which only
/// happens on teardown).
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Wait up to `timeout` for the handle's done signal.
///
/// Returns true when the task is done, false on timeout.
pub(crate) async fn wait_done(mut done: watch::Receiver<bool>, timeout: Duration) -> bool {
    if *done.borrow_and_update() {
        return true;
    }
    tokio::time::timeout(timeout, async {
        while done.changed().await.is_ok() {
            if *done.borrow() {
                return;
            }
        }
    })
    .await
    .is_ok()
}

/// Send SIGTERM to a process.
pub(crate) fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

/// Send SIGKILL to a process.
pub(crate) fn kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

/// Process-exit-driven supervision: wait on the launcher child and copy its
/// exit status into the handle.
pub(crate) async fn watch_launcher(
    handle: Arc<TaskHandle>,
    mut child: tokio::process::Child,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        status = child.wait() => {
            let result = match status {
                Ok(status) => {
                    #[cfg(unix)]
                    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                    #[cfg(not(unix))]
                    let signal = None;
                    ExitResult {
                        exit_code: status.code().unwrap_or(-1),
                        signal,
                        err: None,
                    }
                }
                Err(e) => ExitResult::failure(1, format!("wait on launcher failed: {}", e)),
            };
            if handle.transition_exited(result.clone()) {
                info!(
                    task_id = %handle.spec().id,
                    exit_code = result.exit_code,
                    signal = ?result.signal,
                    "launcher process exited"
                );
            }
        }
        _ = cancelled(&mut shutdown) => {
            debug!(task_id = %handle.spec().id, "driver shutdown, launcher watcher stopping");
        }
    }
}

/// Poll-driven supervision feeding a host wait subscription.
///
/// A non-Running observation is re-confirmed once after a short delay before
/// it is treated as authoritative; a failed poll conservatively counts as
/// the VM having exited with a synthetic failure rather than leaving the
/// task indeterminate.
pub(crate) async fn monitor_vm_status(
    client: Arc<dyn Virtualizer>,
    handle: Arc<TaskHandle>,
    tx: mpsc::Sender<ExitResult>,
    mut shutdown: watch::Receiver<bool>,
) {
    let vm_name = handle.vm_name();
    debug!(vm = %vm_name, "monitoring vm status");

    let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // interval() fires immediately; consume that so the first real check
    // happens one poll interval after launch.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancelled(&mut shutdown) => {
                debug!(vm = %vm_name, "driver shutdown, vm monitoring stopping");
                return;
            }
            _ = tx.closed() => {
                debug!(vm = %vm_name, "wait subscription dropped, vm monitoring stopping");
                return;
            }
        }

        // The launcher watcher may already have recorded the exit.
        if let Some(result) = handle.exit_result() {
            let _ = tx.send(result).await;
            return;
        }

        let first = match client.status(&vm_name).await {
            Ok(state) => state,
            Err(e) => {
                warn!(vm = %vm_name, error = %e, "failed to get vm status, assuming vm exited");
                let result = ExitResult::failure(1, format!("failed to get vm status: {}", e));
                let result = if handle.transition_exited(result.clone()) {
                    result
                } else {
                    handle.exit_result().unwrap_or(result)
                };
                let _ = tx.send(result).await;
                return;
            }
        };

        if first == VmState::Running {
            trace!(vm = %vm_name, "vm still running");
            continue;
        }

        // Re-check once: a single non-Running read can be a transient false
        // negative from the tool.
        tokio::time::sleep(STATUS_CONFIRM_DELAY).await;
        let confirmed = match client.status(&vm_name).await {
            Ok(VmState::Running) => {
                debug!(vm = %vm_name, "vm running again on second check");
                continue;
            }
            Ok(state) => state,
            Err(_) => first,
        };

        info!(vm = %vm_name, status = %confirmed, "vm is no longer running");
        // A clean stop is a successful task exit; paused or anything else
        // counts as abnormal.
        let exit_code = if confirmed == VmState::Stopped { 0 } else { 1 };
        let result = ExitResult::with_code(exit_code);
        let result = if handle.transition_exited(result.clone()) {
            result
        } else {
            handle.exit_result().unwrap_or(result)
        };
        let _ = tx.send(result).await;
        return;
    }
}
