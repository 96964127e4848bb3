//! The driver facade implementing the host plugin contract.
//!
//! Placement, restart policy, and allocation bookkeeping all live in the
//! host. This layer turns task configuration into virtualizer calls, owns
//! the per-task supervision tasks, and reports state back.

mod events;
mod fingerprint;
mod logs;
mod monitor;

pub use fingerprint::{available_slots, FINGERPRINT_PERIOD, MAX_VM_SLOTS};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{DriverConfig, TaskConfig};
use crate::error::{Error, Result};
use crate::plugin::{
    Capabilities, DriverPlugin, ExecStreamOptions, ExitResult, Fingerprint, FsIsolation,
    PluginInfo, TaskEvent, TaskResourceUsage, TaskSpec, TaskState, TaskStatus,
    TASK_HANDLE_VERSION,
};
use crate::schema::DriverSchemas;
use crate::stats;
use crate::task::{TaskHandle, TaskRegistry};
use crate::virt::{ExecOptions, TartClient, Virtualizer, VmConfig};

/// Grace period for launcher shutdown during a forced destroy.
const DESTROY_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Floor for caller-provided stats intervals.
const MIN_STATS_INTERVAL: Duration = Duration::from_millis(100);

/// The task driver.
pub struct Driver {
    config: Arc<RwLock<DriverConfig>>,
    schemas: DriverSchemas,
    tasks: TaskRegistry,
    client: Arc<dyn Virtualizer>,
    eventer: events::Eventer,
    shutdown_tx: watch::Sender<bool>,
}

impl Driver {
    /// Create a driver on top of a virtualization backend.
    pub fn new(client: Arc<dyn Virtualizer>, schemas: DriverSchemas) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(RwLock::new(DriverConfig::default())),
            schemas,
            tasks: TaskRegistry::new(),
            client,
            eventer: events::Eventer::new(),
            shutdown_tx,
        }
    }

    /// Create a driver backed by the tart CLI.
    pub fn with_tart(schemas: DriverSchemas) -> Self {
        Self::new(Arc::new(TartClient::new()), schemas)
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn get_handle(&self, task_id: &str) -> Result<Arc<TaskHandle>> {
        self.tasks
            .get(task_id)
            .ok_or_else(|| Error::task_not_found(task_id))
    }

    fn emit_event(&self, spec: &TaskSpec, message: &str, annotations: HashMap<String, String>) {
        self.eventer.emit(TaskEvent {
            task_id: spec.id.clone(),
            task_name: spec.name.clone(),
            alloc_id: spec.alloc_id.clone(),
            timestamp: SystemTime::now(),
            message: message.to_string(),
            annotations,
        });
    }

    /// Bring the launcher process down, preferring a graceful exit.
    ///
    /// Waits for the exit watcher to record the result; when no watcher can
    /// observe it (recovered handle, test double) the exit is recorded here
    /// so bookkeeping converges.
    async fn shutdown_launcher(&self, handle: &Arc<TaskHandle>, timeout: Duration) {
        if !handle.is_running() {
            return;
        }

        let pid = handle.pid();
        let grace = timeout.max(Duration::from_secs(1));
        if pid > 0 {
            monitor::terminate(pid);
        }
        if monitor::wait_done(handle.done(), grace).await {
            return;
        }

        if pid > 0 {
            warn!(task_id = %handle.spec().id, pid, "launcher did not exit in time, killing");
            monitor::kill(pid);
            if monitor::wait_done(handle.done(), Duration::from_secs(5)).await {
                return;
            }
        }

        handle.transition_exited(ExitResult::with_code(0));
    }
}

#[async_trait]
impl DriverPlugin for Driver {
    fn plugin_info(&self) -> PluginInfo {
        PluginInfo::default()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            send_signals: false,
            exec: true,
            fs_isolation: FsIsolation::Image,
        }
    }

    fn config_schema(&self) -> &serde_json::Value {
        &self.schemas.plugin
    }

    fn task_config_schema(&self) -> &serde_json::Value {
        &self.schemas.task
    }

    fn set_config(&self, config: serde_json::Value) -> Result<()> {
        let decoded = DriverConfig::decode(config)?;
        *self.config.write() = decoded;
        Ok(())
    }

    fn fingerprint(&self) -> mpsc::Receiver<Fingerprint> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(fingerprint::run_fingerprint_loop(
            self.client.clone(),
            self.config.clone(),
            tx,
            self.shutdown_rx(),
        ));
        rx
    }

    async fn start_task(&self, spec: TaskSpec) -> Result<TaskState> {
        if self.tasks.contains(&spec.id) {
            return Err(Error::task_already_started(&spec.id));
        }

        let task = TaskConfig::decode(&spec.driver_config)?;
        info!(task_id = %spec.id, image = %task.image, "starting task");

        let vm_config = VmConfig {
            task: task.clone(),
            spec: spec.clone(),
        };

        // Locally present images skip the pull; tell the host when one is
        // actually being downloaded so it can surface progress.
        let needs_pull = self.client.needs_pull(&vm_config).await?;
        if needs_pull {
            info!(task_id = %spec.id, image = %task.image, "image not found locally, downloading");
            let mut annotations = HashMap::new();
            annotations.insert("image".to_string(), task.image.clone());
            self.emit_event(&spec, "Downloading VM image", annotations);
        }

        self.client.setup(&vm_config).await?;

        if needs_pull {
            let mut annotations = HashMap::new();
            annotations.insert("image".to_string(), task.image.clone());
            self.emit_event(&spec, "VM image download complete", annotations);
        }

        let launched = self.client.start(&vm_config).await?;
        let started_at = SystemTime::now();

        let handle = Arc::new(TaskHandle::new(
            spec.clone(),
            task,
            launched.pid,
            launched.child,
            started_at,
        ));
        self.tasks.set(&spec.id, handle.clone());

        if let Some(child) = handle.take_child() {
            tokio::spawn(monitor::watch_launcher(
                handle.clone(),
                child,
                self.shutdown_rx(),
            ));
        }

        debug!(
            task_id = %spec.id,
            stdout = %spec.stdout_path.display(),
            stderr = %spec.stderr_path.display(),
            "starting guest log streaming"
        );
        tokio::spawn(logs::stream_guest_logs(
            self.client.clone(),
            vm_config,
            handle.cancellation(),
            self.shutdown_rx(),
        ));

        Ok(TaskState {
            version: TASK_HANDLE_VERSION,
            task_spec: spec,
            started_at,
        })
    }

    async fn recover_task(&self, state: TaskState) -> Result<()> {
        if state.version != TASK_HANDLE_VERSION {
            return Err(Error::invalid_handle(format!(
                "incompatible handle version {}",
                state.version
            )));
        }

        // Recovery restarts the task through the same path as initial start.
        info!(task_id = %state.task_spec.id, "recovering task");
        self.start_task(state.task_spec).await?;
        Ok(())
    }

    fn wait_task(&self, task_id: &str) -> Result<mpsc::Receiver<ExitResult>> {
        let handle = self.get_handle(task_id)?;
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(monitor::monitor_vm_status(
            self.client.clone(),
            handle,
            tx,
            self.shutdown_rx(),
        ));
        Ok(rx)
    }

    async fn stop_task(
        &self,
        task_id: &str,
        timeout: Duration,
        _signal: Option<&str>,
    ) -> Result<()> {
        let handle = self.get_handle(task_id)?;
        let vm_name = handle.vm_name();

        // Graceful VM teardown first; failures here are logged, not fatal,
        // since the launcher shutdown below still converges the task.
        if let Err(e) = self.client.stop(&vm_name, timeout).await {
            warn!(vm = %vm_name, error = %e, "failed to stop vm via virtualizer");
        }
        if let Err(e) = self.client.delete(&vm_name).await {
            warn!(vm = %vm_name, error = %e, "failed to delete vm via virtualizer");
        }

        self.shutdown_launcher(&handle, timeout).await;

        info!(task_id = %task_id, "stopped task");
        Ok(())
    }

    async fn destroy_task(&self, task_id: &str, force: bool) -> Result<()> {
        let handle = self.get_handle(task_id)?;

        if handle.is_running() && !force {
            return Err(Error::TaskStillRunning {
                id: task_id.to_string(),
            });
        }

        if handle.is_running() {
            let vm_name = handle.vm_name();
            if let Err(e) = self.client.stop(&vm_name, DESTROY_STOP_TIMEOUT).await {
                warn!(vm = %vm_name, error = %e, "failed to stop vm during destroy");
            }
            if let Err(e) = self.client.delete(&vm_name).await {
                warn!(vm = %vm_name, error = %e, "failed to delete vm during destroy");
            }
            self.shutdown_launcher(&handle, DESTROY_STOP_TIMEOUT).await;
        }

        handle.cancel();
        self.tasks.delete(task_id);
        info!(task_id = %task_id, "destroyed task");
        Ok(())
    }

    fn inspect_task(&self, task_id: &str) -> Result<TaskStatus> {
        Ok(self.get_handle(task_id)?.task_status())
    }

    fn task_stats(
        &self,
        task_id: &str,
        interval: Duration,
    ) -> Result<mpsc::Receiver<TaskResourceUsage>> {
        let handle = self.get_handle(task_id)?;
        let (tx, rx) = mpsc::channel(1);
        let client = self.client.clone();
        let mut shutdown = self.shutdown_rx();

        tokio::spawn(async move {
            let vm_config = handle.vm_config();
            let vm_name = handle.vm_name();
            let mut system = sysinfo::System::new();
            let mut ticker = tokio::time::interval(interval.max(MIN_STATS_INTERVAL));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = monitor::cancelled(&mut shutdown) => return,
                    _ = tx.closed() => return,
                }

                let usage = if vm_config.task.guest_stats {
                    match stats::guest::guest_usage(client.as_ref(), &vm_config).await {
                        Ok(resource_usage) => TaskResourceUsage {
                            resource_usage,
                            timestamp: SystemTime::now(),
                            pids: HashMap::new(),
                        },
                        Err(e) => {
                            debug!(vm = %vm_name, error = %e, "guest stats failed, falling back to host scan");
                            host_usage_sample(&mut system, &handle, &vm_name)
                        }
                    }
                } else {
                    host_usage_sample(&mut system, &handle, &vm_name)
                };

                if tx.send(usage).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    fn task_events(&self) -> mpsc::Receiver<TaskEvent> {
        self.eventer.subscribe()
    }

    fn signal_task(&self, task_id: &str, _signal: &str) -> Result<()> {
        self.get_handle(task_id)?;
        Err(Error::not_supported("signals"))
    }

    async fn exec_task(
        &self,
        task_id: &str,
        _command: &[String],
        _timeout: Duration,
    ) -> Result<ExitResult> {
        self.get_handle(task_id)?;
        // Only the streaming variant is supported.
        Err(Error::not_supported("exec"))
    }

    async fn exec_task_streaming(
        &self,
        task_id: &str,
        opts: ExecStreamOptions,
    ) -> Result<ExitResult> {
        let handle = self.get_handle(task_id)?;

        let exec_opts = ExecOptions {
            command: opts.command,
            tty: opts.tty,
            stdin: opts.stdin,
            stdout: opts.stdout,
            stderr: opts.stderr,
            resize: opts.resize,
            cancel: Some(handle.cancellation()),
        };

        let exit_code = self.client.exec(&handle.vm_config(), exec_opts).await?;
        Ok(ExitResult::with_code(exit_code))
    }

    fn shutdown(&self) {
        info!("driver shutting down");
        let _ = self.shutdown_tx.send(true);
        for handle in self.tasks.handles() {
            handle.cancel();
        }
        self.eventer.close();
    }
}

/// One host-side usage sample for a task's attributed processes.
fn host_usage_sample(
    system: &mut sysinfo::System,
    handle: &Arc<TaskHandle>,
    vm_name: &str,
) -> TaskResourceUsage {
    let mut tracker = handle.cpu_tracker().lock();
    stats::collect(system, &mut tracker, vm_name, handle.pid())
}
