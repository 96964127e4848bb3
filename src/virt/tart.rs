//! The tart CLI backend.
//!
//! Every operation builds an argument vector, runs the `tart` binary to
//! completion (or spawns it detached for the long-running `run` verb), and
//! classifies failure from the exit status plus captured stderr. Guest exec
//! goes over SSH (`sshpass` + `ssh`) to the address `tart ip` reports.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::TaskConfig;
use crate::disk::build_root_disk_args;
use crate::error::{Error, Result};
use crate::mount::build_directory_args;
use crate::network::build_network_args;
use crate::registry_auth::registry_host;
use crate::virt::{ExecOptions, LaunchedVm, Virtualizer, VmConfig, VmInfo, VmState};

/// Default CPU cores when the host allocated none explicitly.
pub const DEFAULT_CPU_CORES: u32 = 4;

/// Default memory in MB when the host allocated none explicitly.
pub const DEFAULT_MEMORY_MB: u64 = 4096;

/// Poll interval while waiting on a blocking exec session.
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Extra directories appended to PATH for the launcher process so tart can
/// find helper binaries like softnet.
const EXTRA_PATH_DIRS: &str = "/opt/homebrew/bin:/opt/homebrew/sbin";

/// Shape of one entry in `tart list --format json` output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TartVmInfo {
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    size_on_disk: u64,
    #[serde(default)]
    running: bool,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    disk: u64,
    #[serde(default)]
    source: String,
}

/// Wrapper around the tart CLI implementing [`Virtualizer`].
#[derive(Debug, Clone)]
pub struct TartClient {
    binary: PathBuf,
}

impl Default for TartClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TartClient {
    /// Client invoking `tart` from the search path.
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("tart"),
        }
    }

    /// Client invoking a specific binary. Tests point this at a recording
    /// stand-in script.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Render a command line for error messages.
    fn render(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary.display(), args.join(" "))
    }

    /// Run a tart subcommand to completion and return its stdout.
    async fn run(&self, args: &[&str]) -> Result<String> {
        trace!(binary = %self.binary.display(), ?args, "running tart command");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::command_failed(self.render(args), format!("spawn failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::command_failed(
                self.render(args),
                format!("{} (stderr: {})", output.status, stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a tart subcommand feeding `input` to its stdin.
    async fn run_with_stdin(&self, args: &[&str], input: &str) -> Result<String> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::command_failed(self.render(args), format!("spawn failed: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
            // Drop closes the pipe so the child sees EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::command_failed(self.render(args), format!("wait failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::command_failed(
                self.render(args),
                format!("{} (stderr: {})", output.status, stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Log in to the registry hosting the task's image.
    async fn login(&self, host: &str, username: &str, password: &str) -> Result<()> {
        debug!(registry = %host, username = %username, "logging in to image registry");
        self.run_with_stdin(
            &["login", host, "--username", username, "--password-stdin"],
            password,
        )
        .await?;
        Ok(())
    }

    /// Apply CPU, memory, and disk-size overrides to a VM. Skipped entirely
    /// when no override applies.
    async fn set_resources(
        &self,
        name: &str,
        cpu_cores: u32,
        memory_mb: u64,
        disk_gb: u32,
    ) -> Result<()> {
        let cpu = cpu_cores.to_string();
        let memory = memory_mb.to_string();
        let disk = disk_gb.to_string();

        let mut args: Vec<&str> = vec!["set", name];
        if cpu_cores > 0 {
            args.extend(["--cpu", cpu.as_str()]);
        }
        if memory_mb > 0 {
            args.extend(["--memory", memory.as_str()]);
        }
        if disk_gb > 0 {
            args.extend(["--disk-size", disk.as_str()]);
        }

        if args.len() == 2 {
            return Ok(());
        }

        debug!(vm = %name, ?args, "setting vm resources");
        self.run(&args).await?;
        Ok(())
    }

    /// Resolve the VM's current network address.
    async fn ip(&self, name: &str) -> Result<String> {
        let out = self.run(&["ip", name]).await?;
        let ip = out.trim().to_string();
        if ip.is_empty() {
            return Err(Error::address_unavailable(name, "tool reported no address"));
        }
        Ok(ip)
    }
}

#[async_trait]
impl Virtualizer for TartClient {
    async fn available(&self) -> Result<String> {
        match self.run(&["--version"]).await {
            Ok(out) => {
                let version = out.trim().to_string();
                trace!(version = %version, "tart version probe succeeded");
                Ok(version)
            }
            Err(e) => Err(Error::command_failed(
                self.render(&["--version"]),
                format!("tart is not installed or not in PATH: {}", e),
            )),
        }
    }

    async fn setup(&self, config: &VmConfig) -> Result<String> {
        let vm_name = config.vm_name();
        let image = config.task.image.as_str();

        if let Some(auth) = &config.task.auth {
            if auth.valid() {
                let host = registry_host(image)?;
                self.login(&host, &auth.username, &auth.password).await?;
            }
        }

        debug!(vm = %vm_name, image = %image, "cloning vm image");
        self.run(&["clone", image, &vm_name]).await?;

        let cpu_cores = config.spec.resources.cpu_cores.unwrap_or(DEFAULT_CPU_CORES);
        let memory_mb = config.spec.resources.memory_mb.unwrap_or(DEFAULT_MEMORY_MB);
        self.set_resources(&vm_name, cpu_cores, memory_mb, config.task.disk_size)
            .await?;

        Ok(vm_name)
    }

    async fn start(&self, config: &VmConfig) -> Result<LaunchedVm> {
        let args = self.build_start_args(config)?;

        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.spec.stdout_path)?;
        let stderr = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.spec.stderr_path)?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .envs(&config.spec.env)
            .env("PATH", patched_path())
            .current_dir(&config.spec.task_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        debug!(vm = %config.vm_name(), ?args, "launching vm");
        let child = cmd.spawn().map_err(|e| {
            Error::command_failed(
                format!("{} run", self.binary.display()),
                format!("spawn failed: {}", e),
            )
        })?;

        let pid = child.id().unwrap_or_default();
        Ok(LaunchedVm {
            pid,
            child: Some(child),
        })
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        debug!(vm = %name, ?timeout, "stopping vm");
        match tokio::time::timeout(timeout, self.run(&["stop", name])).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(Error::command_failed(
                self.render(&["stop", name]),
                format!("timed out after {:?}", timeout),
            )),
        }
    }

    async fn status(&self, name: &str) -> Result<VmState> {
        let vms = self.list().await?;
        vms.into_iter()
            .find(|vm| vm.name == name)
            .map(|vm| vm.state)
            .ok_or_else(|| Error::vm_not_found(name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        debug!(vm = %name, "deleting vm");
        self.run(&["delete", name]).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VmInfo>> {
        let out = self.run(&["list", "--format", "json"]).await?;
        let raw: Vec<TartVmInfo> = serde_json::from_str(&out).map_err(|e| {
            Error::command_failed(
                self.render(&["list", "--format", "json"]),
                format!("unparseable vm list: {}", e),
            )
        })?;

        Ok(raw
            .into_iter()
            .map(|vm| VmInfo {
                state: VmState::parse(&vm.state),
                name: vm.name,
            })
            .collect())
    }

    async fn exec(&self, config: &VmConfig, opts: ExecOptions) -> Result<i32> {
        if opts.command.is_empty() {
            return Err(Error::invalid_config("exec command is required but was empty"));
        }

        let vm_name = config.vm_name();
        let ip = match self.ip(&vm_name).await {
            Ok(ip) => ip,
            Err(Error::VmAddressUnavailable { name, reason }) => {
                return Err(Error::VmAddressUnavailable { name, reason })
            }
            Err(e) => return Err(Error::address_unavailable(&vm_name, e.to_string())),
        };

        let task = config.task.clone();
        tokio::task::spawn_blocking(move || exec_ssh_session(&task, &ip, opts))
            .await
            .map_err(|e| Error::command_failed("ssh", format!("exec worker failed: {}", e)))?
    }

    fn build_start_args(&self, config: &VmConfig) -> Result<Vec<String>> {
        let mut args = vec!["run".to_string(), config.vm_name()];
        if !config.task.show_ui {
            args.push("--no-graphics".to_string());
        }

        // The host writes per-task secrets here; the guest always gets them
        // read-only.
        args.push(format!("--dir={}:ro", config.spec.secrets_dir.display()));

        args.extend(build_directory_args(&config.task.directories)?);
        args.extend(build_network_args(config.task.network.as_ref())?);
        args.extend(build_root_disk_args(config.task.root_disk.as_ref())?);
        Ok(args)
    }

    async fn needs_pull(&self, config: &VmConfig) -> Result<bool> {
        // Locally pulled images are listed under their registry reference.
        let vms = self.list().await?;
        Ok(!vms.iter().any(|vm| vm.name == config.task.image))
    }
}

/// PATH for launcher processes: the inherited PATH plus the Homebrew
/// locations tart's helper tools usually live in.
fn patched_path() -> String {
    match std::env::var("PATH") {
        Ok(path) if !path.is_empty() => format!("{}:{}", path, EXTRA_PATH_DIRS),
        _ => EXTRA_PATH_DIRS.to_string(),
    }
}

// ============================================================================
// SSH session plumbing (blocking)
// ============================================================================

/// Run one SSH session against the guest, buffered or on a TTY.
fn exec_ssh_session(task: &TaskConfig, ip: &str, opts: ExecOptions) -> Result<i32> {
    let mut args: Vec<String> = vec!["-p".into(), task.ssh_password.clone(), "ssh".into()];
    args.push("-q".into());
    if !task.ssh_strict_host_key {
        args.extend([
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
        ]);
    }
    args.push(if opts.tty { "-tt".into() } else { "-T".into() });
    args.push(format!("{}@{}", task.ssh_user, ip));
    args.extend(opts.command.iter().cloned());

    if opts.tty {
        exec_tty(&args, opts)
    } else {
        exec_buffered(&args, opts)
    }
}

/// Whether the session's cancellation has fired.
fn cancelled(cancel: &Option<tokio::sync::watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

/// Buffered session: pipe stdio through copy threads and wait.
fn exec_buffered(args: &[String], opts: ExecOptions) -> Result<i32> {
    let mut cmd = std::process::Command::new("sshpass");
    cmd.args(args)
        .env("TERM", "xterm-256color")
        .stdin(if opts.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::command_failed("sshpass ssh", format!("spawn failed: {}", e)))?;

    if let (Some(mut pipe), Some(mut source)) = (child.stdin.take(), opts.stdin) {
        std::thread::spawn(move || {
            let _ = std::io::copy(&mut source, &mut pipe);
        });
    }

    let mut child_stdout = child.stdout.take().expect("stdout was piped");
    let mut sink_stdout = opts.stdout;
    let stdout_thread = std::thread::spawn(move || {
        let _ = std::io::copy(&mut child_stdout, &mut sink_stdout);
    });

    let mut child_stderr = child.stderr.take().expect("stderr was piped");
    let mut sink_stderr = opts.stderr;
    let stderr_thread = std::thread::spawn(move || {
        let _ = std::io::copy(&mut child_stderr, &mut sink_stderr);
    });

    let status = loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::command_failed("sshpass ssh", format!("wait failed: {}", e)))?
        {
            break status;
        }
        if cancelled(&opts.cancel) {
            let _ = child.kill();
        }
        std::thread::sleep(EXEC_POLL_INTERVAL);
    };

    let _ = stdout_thread.join();
    let _ = stderr_thread.join();

    Ok(status.code().unwrap_or(-1))
}

/// TTY session: run under a pty, merge output, forward resizes.
fn exec_tty(args: &[String], opts: ExecOptions) -> Result<i32> {
    use portable_pty::{native_pty_system, CommandBuilder, PtySize};

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| Error::command_failed("openpty", e.to_string()))?;

    let mut cmd = CommandBuilder::new("sshpass");
    cmd.args(args);
    cmd.env("TERM", "xterm-256color");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| Error::command_failed("sshpass ssh", format!("spawn failed: {}", e)))?;
    // The child holds its own slave handle now.
    drop(pair.slave);

    let master = pair.master;
    let mut reader = master
        .try_clone_reader()
        .map_err(|e| Error::command_failed("pty reader", e.to_string()))?;
    let mut writer = master
        .take_writer()
        .map_err(|e| Error::command_failed("pty writer", e.to_string()))?;

    if let Some(mut stdin) = opts.stdin {
        std::thread::spawn(move || {
            let _ = std::io::copy(&mut stdin, &mut writer);
        });
    }

    let mut sink = opts.stdout;
    let output_thread = std::thread::spawn(move || {
        let _ = std::io::copy(&mut reader, &mut sink);
    });

    let mut resize = opts.resize;
    let exit_code = loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::command_failed("sshpass ssh", format!("wait failed: {}", e)))?
        {
            break status.exit_code() as i32;
        }

        if let Some(rx) = resize.as_mut() {
            while let Ok(size) = rx.try_recv() {
                let _ = master.resize(PtySize {
                    rows: size.height,
                    cols: size.width,
                    pixel_width: 0,
                    pixel_height: 0,
                });
            }
        }

        if cancelled(&opts.cancel) {
            let _ = child.kill();
        }
        std::thread::sleep(EXEC_POLL_INTERVAL);
    };

    // Closing the master unblocks the reader thread.
    drop(master);
    let _ = output_thread.join();

    Ok(exit_code)
}
