//! The host orchestrator's driver-plugin contract.
//!
//! The shapes in this module are dictated by the host's plugin API: the
//! driver implements them, it does not design them. [`DriverPlugin`] is the
//! full call surface the host dispatches RPCs onto; the structs are the fixed
//! request/response bodies. Streaming calls (fingerprint, wait, stats,
//! events) hand the host a receiver; the driver side owns the sender and
//! closes it when the subscription ends.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Name the driver registers under.
pub const PLUGIN_NAME: &str = "tart";

/// Plugin API versions this driver speaks.
pub const PLUGIN_API_VERSIONS: &[&str] = &["driver.v0.1.0"];

/// Driver version reported in plugin info and fingerprints.
pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version stamped into persisted task handles. Bump when [`TaskState`]
/// changes shape; recovery rejects handles with a different version.
pub const TASK_HANDLE_VERSION: u32 = 1;

/// Identifying information about the plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin type, always `"driver"`.
    pub plugin_type: String,
    /// API versions the plugin supports.
    pub plugin_api_versions: Vec<String>,
    /// Plugin version string.
    pub plugin_version: String,
    /// Plugin name.
    pub name: String,
}

impl Default for PluginInfo {
    fn default() -> Self {
        Self {
            plugin_type: "driver".to_string(),
            plugin_api_versions: PLUGIN_API_VERSIONS.iter().map(|s| s.to_string()).collect(),
            plugin_version: PLUGIN_VERSION.to_string(),
            name: PLUGIN_NAME.to_string(),
        }
    }
}

/// Filesystem isolation mode a driver provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsIsolation {
    /// No isolation; tasks share the host filesystem.
    None,
    /// Chroot-level isolation.
    Chroot,
    /// Image-level isolation (each task gets its own disk image).
    Image,
}

/// Optional features a driver declares to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether the driver can deliver signals to tasks.
    pub send_signals: bool,
    /// Whether the driver supports streaming exec into tasks.
    pub exec: bool,
    /// Filesystem isolation mode.
    pub fs_isolation: FsIsolation,
}

/// Lifecycle state of a task as reported to the host.
///
/// `Exited` is terminal: no transition ever leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Task accepted but the VM process has not launched yet.
    Pending,
    /// VM process launched and not yet observed dead.
    Running,
    /// VM process or VM observed dead; exit result recorded.
    Exited,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running => write!(f, "running"),
            RunState::Exited => write!(f, "exited"),
        }
    }
}

/// How a task exited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    /// Process or synthetic exit code.
    pub exit_code: i32,
    /// Signal that terminated the process, when one did.
    pub signal: Option<i32>,
    /// Error cause for synthetic exits (e.g. status polling failed).
    pub err: Option<String>,
}

impl ExitResult {
    /// Successful exit.
    pub fn success() -> Self {
        Self::default()
    }

    /// Exit with a code and no signal.
    pub fn with_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    /// Synthetic failure exit carrying an error cause.
    pub fn failure(exit_code: i32, err: impl Into<String>) -> Self {
        Self {
            exit_code,
            signal: None,
            err: Some(err.into()),
        }
    }
}

/// Compute resources the host allocated to a task.
///
/// Unset fields fall back to driver defaults when the VM is sized.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Resources {
    /// Number of CPU cores.
    pub cpu_cores: Option<u32>,
    /// Memory limit in megabytes.
    pub memory_mb: Option<u64>,
}

/// A task as handed to the driver by the host.
///
/// The host resolves templates and downloads artifacts before this reaches
/// the driver; `driver_config` is the already-validated per-task driver
/// block, decoded by [`crate::config::TaskConfig::decode`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique task identifier.
    pub id: String,
    /// Human-readable task name.
    pub name: String,
    /// Allocation this task instance runs within. One VM per allocation.
    pub alloc_id: String,
    /// Environment the host composed for the task.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Allocated compute resources.
    #[serde(default)]
    pub resources: Resources,
    /// The per-task driver config block.
    pub driver_config: serde_json::Value,
    /// File the task's stdout is appended to.
    pub stdout_path: PathBuf,
    /// File the task's stderr is appended to.
    pub stderr_path: PathBuf,
    /// The task's working directory on the host.
    pub task_dir: PathBuf,
    /// Directory holding host-written secrets for this task.
    pub secrets_dir: PathBuf,
    /// User to run the launcher process as, when set.
    #[serde(default)]
    pub user: Option<String>,
}

/// Driver state persisted by the host across driver restarts.
///
/// This is the opaque blob returned from `start_task`; on recovery the
/// driver must be able to rebuild a supervising handle from it alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    /// Handle format version, see [`TASK_HANDLE_VERSION`].
    pub version: u32,
    /// The task spec the driver was started with.
    pub task_spec: TaskSpec,
    /// When the task was started.
    pub started_at: SystemTime,
}

impl TaskState {
    /// Serialize to the opaque byte blob handed to the host.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| crate::error::Error::invalid_handle(format!("encode failed: {}", e)))
    }

    /// Decode a persisted blob, verifying the handle version.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let state: Self = serde_json::from_slice(raw)
            .map_err(|e| crate::error::Error::invalid_handle(format!("decode failed: {}", e)))?;
        if state.version != TASK_HANDLE_VERSION {
            return Err(crate::error::Error::invalid_handle(format!(
                "incompatible handle version {}",
                state.version
            )));
        }
        Ok(state)
    }
}

/// Point-in-time status of a task, returned from InspectTask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Task identifier.
    pub id: String,
    /// Task name.
    pub name: String,
    /// Current lifecycle state.
    pub state: RunState,
    /// When the task started.
    pub started_at: SystemTime,
    /// When the task reached `Exited`, if it has.
    pub completed_at: Option<SystemTime>,
    /// Exit result, present once `Exited`.
    pub exit_result: Option<ExitResult>,
    /// Driver-specific attributes (e.g. launcher pid).
    pub driver_attributes: HashMap<String, String>,
}

// ============================================================================
// Fingerprinting
// ============================================================================

/// Driver health as reported in fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Driver is operational and can accept work.
    Healthy,
    /// Driver detected its tooling but cannot currently operate.
    Unhealthy,
    /// Driver tooling is missing or the driver is disabled.
    Undetected,
}

/// A typed fingerprint attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean attribute.
    Bool(bool),
    /// Integer attribute.
    Int(i64),
    /// String attribute.
    String(String),
}

/// Periodic health/capability report sent to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Scheduling attributes (version, available slots, ...).
    pub attributes: HashMap<String, AttributeValue>,
    /// Overall driver health.
    pub health: HealthState,
    /// Human-readable health description.
    pub health_description: String,
}

// ============================================================================
// Events
// ============================================================================

/// A task-related event emitted to host subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Task the event belongs to.
    pub task_id: String,
    /// Task name.
    pub task_name: String,
    /// Allocation id.
    pub alloc_id: String,
    /// When the event occurred.
    pub timestamp: SystemTime,
    /// Event message.
    pub message: String,
    /// Free-form annotations.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

// ============================================================================
// Stats
// ============================================================================

/// Memory stat fields this driver actually measures.
pub const MEASURED_MEM_STATS: &[&str] = &["RSS", "Swap"];

/// CPU stat fields this driver actually measures.
pub const MEASURED_CPU_STATS: &[&str] = &["System Mode", "User Mode", "Percent"];

/// Memory usage sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Resident set size in bytes.
    pub rss: u64,
    /// Swapped-out bytes.
    pub swap: u64,
    /// Which fields are actually measured.
    pub measured: Vec<String>,
}

/// CPU usage sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuStats {
    /// Cumulative system-mode CPU time in nanoseconds.
    pub system_mode: f64,
    /// Cumulative user-mode CPU time in nanoseconds.
    pub user_mode: f64,
    /// CPU utilisation percent over the sampling window.
    pub percent: f64,
    /// Which fields are actually measured.
    pub measured: Vec<String>,
}

/// Combined memory and CPU usage for one process or an aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Memory usage.
    pub memory: MemoryStats,
    /// CPU usage.
    pub cpu: CpuStats,
}

/// A stats emission for one task: aggregate plus per-PID breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResourceUsage {
    /// Aggregate usage across all attributed processes.
    pub resource_usage: ResourceUsage,
    /// Emission timestamp.
    pub timestamp: SystemTime,
    /// Per-PID usage, keyed by the PID rendered as a string.
    pub pids: HashMap<String, ResourceUsage>,
}

// ============================================================================
// Exec
// ============================================================================

/// Terminal dimensions forwarded to an interactive exec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Terminal height in rows.
    pub height: u16,
    /// Terminal width in columns.
    pub width: u16,
}

/// IO plumbing and options for a streaming exec request.
///
/// Sinks are synchronous trait objects: the host side hands the driver pipe
/// ends, and exec runs the session on a blocking worker.
pub struct ExecStreamOptions {
    /// Command and arguments to run inside the guest.
    pub command: Vec<String>,
    /// Allocate a TTY and forward resize events.
    pub tty: bool,
    /// Input stream fed to the remote command.
    pub stdin: Option<Box<dyn Read + Send>>,
    /// Output sink for the remote command's stdout.
    pub stdout: Box<dyn Write + Send>,
    /// Output sink for the remote command's stderr.
    pub stderr: Box<dyn Write + Send>,
    /// Resize events, honored only in TTY mode.
    pub resize: Option<mpsc::UnboundedReceiver<TerminalSize>>,
}

impl std::fmt::Debug for ExecStreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStreamOptions")
            .field("command", &self.command)
            .field("tty", &self.tty)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// The plugin call surface
// ============================================================================

/// The driver-plugin contract the host dispatches onto.
///
/// Ordering guarantees are per task only: an exit-state transition
/// happens-before any later `inspect_task` observes it. Calls for different
/// tasks may arrive concurrently, including duplicate lifecycle calls for
/// the same task during recovery races.
#[async_trait]
pub trait DriverPlugin: Send + Sync {
    /// Identifying information about the plugin.
    fn plugin_info(&self) -> PluginInfo;

    /// Optional features this driver supports.
    fn capabilities(&self) -> Capabilities;

    /// Schema the host validates the plugin-wide config block against.
    fn config_schema(&self) -> &serde_json::Value;

    /// Schema the host validates per-task driver blocks against.
    fn task_config_schema(&self) -> &serde_json::Value;

    /// Apply the plugin-wide configuration.
    fn set_config(&self, config: serde_json::Value) -> Result<()>;

    /// Subscribe to periodic fingerprints. The first fingerprint is sent
    /// immediately; the channel closes on driver shutdown.
    fn fingerprint(&self) -> mpsc::Receiver<Fingerprint>;

    /// Start a task, returning the state blob the host persists.
    async fn start_task(&self, spec: TaskSpec) -> Result<TaskState>;

    /// Rebuild a supervising handle from a persisted state blob.
    async fn recover_task(&self, state: TaskState) -> Result<()>;

    /// Subscribe to the task's exit result. The channel yields at most one
    /// value and closes when supervision ends.
    fn wait_task(&self, task_id: &str) -> Result<mpsc::Receiver<ExitResult>>;

    /// Stop a running task within the timeout window.
    async fn stop_task(&self, task_id: &str, timeout: Duration, signal: Option<&str>)
        -> Result<()>;

    /// Remove a terminated task's bookkeeping. With `force`, a running task
    /// is shut down first.
    async fn destroy_task(&self, task_id: &str, force: bool) -> Result<()>;

    /// Detailed status for one task.
    fn inspect_task(&self, task_id: &str) -> Result<TaskStatus>;

    /// Subscribe to periodic resource usage for one task.
    fn task_stats(
        &self,
        task_id: &str,
        interval: Duration,
    ) -> Result<mpsc::Receiver<TaskResourceUsage>>;

    /// Subscribe to task events. Each subscriber gets its own queue; a slow
    /// subscriber never blocks the others.
    fn task_events(&self) -> mpsc::Receiver<TaskEvent>;

    /// Deliver a signal to a task.
    fn signal_task(&self, task_id: &str, signal: &str) -> Result<()>;

    /// One-shot buffered exec inside the task.
    async fn exec_task(
        &self,
        task_id: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExitResult>;

    /// Streaming exec inside the task, with optional TTY semantics.
    async fn exec_task_streaming(
        &self,
        task_id: &str,
        opts: ExecStreamOptions,
    ) -> Result<ExitResult>;

    /// Begin driver teardown: cancel supervision loops and close
    /// subscription channels.
    fn shutdown(&self);
}
