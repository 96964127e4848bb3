//! Virtualization backends.
//!
//! [`Virtualizer`] is the capability boundary between the driver and the
//! tool that actually runs VMs. Exactly one concrete backend exists (the
//! [`tart::TartClient`] subprocess wrapper), but the driver only ever talks
//! through the trait, so tests substitute a scripted double for real
//! subprocess calls.

#[cfg(test)]
pub(crate) mod fake;
pub mod tart;

pub use tart::TartClient;

use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::config::TaskConfig;
use crate::error::Result;
use crate::plugin::{TaskSpec, TerminalSize};

/// Prefix for VM names derived from allocation ids.
const VM_NAME_PREFIX: &str = "alloc-";

/// Derive the VM name for an allocation.
///
/// One VM per allocation; the name is deterministic so it survives driver
/// restarts and recovery.
pub fn vm_name_for(alloc_id: &str) -> String {
    format!("{}{}", VM_NAME_PREFIX, alloc_id)
}

/// Observed state of a virtual machine.
///
/// The tool reports free-form state strings; [`VmState::parse`] normalizes
/// them case-insensitively and maps anything unrecognized to `Stopped`.
/// Treating an unknown state as running would keep dead tasks alive
/// forever, so unknown means stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// VM is currently running.
    Running,
    /// VM is not running.
    Stopped,
    /// VM is paused.
    Paused,
}

impl VmState {
    /// Normalize a tool-reported state string.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "running" => Self::Running,
            "paused" => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Name and state of one known VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    /// VM name.
    pub name: String,
    /// Normalized state.
    pub state: VmState,
}

/// Everything a backend needs to know about one task's VM.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// The decoded per-task driver block.
    pub task: TaskConfig,
    /// The host-level task spec.
    pub spec: TaskSpec,
}

impl VmConfig {
    /// The VM name for this task's allocation.
    pub fn vm_name(&self) -> String {
        vm_name_for(&self.spec.alloc_id)
    }
}

/// A launched VM process.
///
/// The `run` invocation blocks for the VM's whole lifetime, so the backend
/// hands the child back without waiting on it; the task supervisor owns the
/// wait. Test doubles report a pid with no child attached.
#[derive(Debug)]
pub struct LaunchedVm {
    /// OS pid of the launcher process.
    pub pid: u32,
    /// The launcher child process, when this backend spawned a real one.
    pub child: Option<tokio::process::Child>,
}

/// IO plumbing and options for one guest exec session.
///
/// Sinks are synchronous trait objects; the backend runs the session on a
/// blocking worker and polls `cancel` while waiting.
pub struct ExecOptions {
    /// Command and arguments to run in the guest.
    pub command: Vec<String>,
    /// Allocate a TTY and forward resize events.
    pub tty: bool,
    /// Input stream for the remote command.
    pub stdin: Option<Box<dyn Read + Send>>,
    /// Sink for the remote command's stdout.
    pub stdout: Box<dyn Write + Send>,
    /// Sink for the remote command's stderr. In TTY mode output is merged
    /// into stdout by the terminal.
    pub stderr: Box<dyn Write + Send>,
    /// Resize events, honored only in TTY mode.
    pub resize: Option<mpsc::UnboundedReceiver<TerminalSize>>,
    /// Cancellation for the session; the remote command is killed when it
    /// fires.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl ExecOptions {
    /// Buffered (non-TTY) session writing into the given sinks.
    pub fn buffered(
        command: Vec<String>,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            command,
            tty: false,
            stdin: None,
            stdout,
            stderr,
            resize: None,
            cancel: None,
        }
    }

    /// Attach a cancellation signal.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl std::fmt::Debug for ExecOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecOptions")
            .field("command", &self.command)
            .field("tty", &self.tty)
            .finish_non_exhaustive()
    }
}

/// The operations a virtualization backend provides.
#[async_trait]
pub trait Virtualizer: Send + Sync {
    /// Probe whether the tool is installed, returning its version string.
    async fn available(&self) -> Result<String>;

    /// Prepare a VM for the task: authenticate against the image registry
    /// when credentials are configured, clone the image, and apply resource
    /// overrides. Returns the VM name.
    async fn setup(&self, config: &VmConfig) -> Result<String>;

    /// Launch the VM as a long-running detached process. Returns immediately
    /// with the launcher pid; the VM's run duration is unbounded.
    async fn start(&self, config: &VmConfig) -> Result<LaunchedVm>;

    /// Request a graceful stop, bounded by `timeout`.
    async fn stop(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Current state of one VM. Absence is an error.
    async fn status(&self, name: &str) -> Result<VmState>;

    /// Permanently remove a VM's state and disk. Absence is an error.
    async fn delete(&self, name: &str) -> Result<()>;

    /// All VMs the tool knows about.
    async fn list(&self) -> Result<Vec<VmInfo>>;

    /// Run a command inside the guest over the remote shell. Address
    /// resolution failures are not retried here; that policy belongs to the
    /// guest channel supervisor.
    async fn exec(&self, config: &VmConfig, opts: ExecOptions) -> Result<i32>;

    /// The argument vector a `start` for this config would use. Pure and
    /// deterministic; rejects conflicting config instead of resolving it.
    fn build_start_args(&self, config: &VmConfig) -> Result<Vec<String>>;

    /// Whether the task's image still has to be pulled from its registry.
    async fn needs_pull(&self, config: &VmConfig) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_normalization_case_insensitive() {
        assert_eq!(VmState::parse("Running"), VmState::Running);
        assert_eq!(VmState::parse("running"), VmState::Running);
        assert_eq!(VmState::parse("RUNNING"), VmState::Running);
        assert_eq!(VmState::parse("paused"), VmState::Paused);
        assert_eq!(VmState::parse("PAUSED"), VmState::Paused);
        assert_eq!(VmState::parse("stopped"), VmState::Stopped);
    }

    #[test]
    fn test_state_normalization_unknown_defaults_to_stopped() {
        assert_eq!(VmState::parse("banana"), VmState::Stopped);
        assert_eq!(VmState::parse(""), VmState::Stopped);
        assert_eq!(VmState::parse("suspended"), VmState::Stopped);
    }

    #[test]
    fn test_vm_name_is_deterministic() {
        assert_eq!(vm_name_for("abc-123"), "alloc-abc-123");
        assert_eq!(vm_name_for("abc-123"), vm_name_for("abc-123"));
    }
}
