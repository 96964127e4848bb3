//! Scripted in-memory backend for tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::virt::{ExecOptions, LaunchedVm, Virtualizer, VmConfig, VmInfo, VmState};

/// Scripted outcome for one exec invocation.
#[derive(Debug, Clone)]
pub(crate) enum ExecOutcome {
    /// Session runs and exits with this code.
    Exit(i32),
    /// Session fails with a generic command error.
    Fail(String),
    /// Address resolution fails.
    AddressUnavailable,
}

/// A [`Virtualizer`] double that records calls and replays scripted
/// responses instead of running subprocesses.
pub(crate) struct FakeVirtualizer {
    calls: Mutex<Vec<String>>,
    /// Scripted status responses, consumed front to back; `status_default`
    /// answers once the script is exhausted.
    statuses: Mutex<VecDeque<std::result::Result<VmState, String>>>,
    status_default: Mutex<std::result::Result<VmState, String>>,
    list_result: Mutex<Vec<VmInfo>>,
    exec_script: Mutex<VecDeque<ExecOutcome>>,
}

impl FakeVirtualizer {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            statuses: Mutex::new(VecDeque::new()),
            status_default: Mutex::new(Ok(VmState::Running)),
            list_result: Mutex::new(Vec::new()),
            exec_script: Mutex::new(VecDeque::new()),
        }
    }

    /// Record of every call, in order, as `"<op> <arg>"` strings.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub(crate) fn push_status(&self, state: VmState) {
        self.statuses.lock().push_back(Ok(state));
    }

    pub(crate) fn push_status_error(&self, reason: &str) {
        self.statuses.lock().push_back(Err(reason.to_string()));
    }

    pub(crate) fn set_status_default(&self, state: VmState) {
        *self.status_default.lock() = Ok(state);
    }

    pub(crate) fn set_list(&self, vms: Vec<VmInfo>) {
        *self.list_result.lock() = vms;
    }

    pub(crate) fn push_exec(&self, outcome: ExecOutcome) {
        self.exec_script.lock().push_back(outcome);
    }

    pub(crate) fn exec_attempts(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.starts_with("exec"))
            .count()
    }
}

#[async_trait]
impl Virtualizer for FakeVirtualizer {
    async fn available(&self) -> Result<String> {
        self.record("available");
        Ok("2.0.0-test".to_string())
    }

    async fn setup(&self, config: &VmConfig) -> Result<String> {
        let name = config.vm_name();
        self.record(format!("setup {}", name));
        Ok(name)
    }

    async fn start(&self, config: &VmConfig) -> Result<LaunchedVm> {
        self.record(format!("start {}", config.vm_name()));
        Ok(LaunchedVm { pid: 0, child: None })
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.record(format!("stop {}", name));
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<VmState> {
        self.record(format!("status {}", name));
        let scripted = self.statuses.lock().pop_front();
        let response = scripted.unwrap_or_else(|| self.status_default.lock().clone());
        response.map_err(|reason| Error::command_failed("fake status", reason))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.record(format!("delete {}", name));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VmInfo>> {
        self.record("list");
        Ok(self.list_result.lock().clone())
    }

    async fn exec(&self, config: &VmConfig, opts: ExecOptions) -> Result<i32> {
        self.record(format!("exec {} {}", config.vm_name(), opts.command.join(" ")));
        let outcome = self
            .exec_script
            .lock()
            .pop_front()
            .unwrap_or(ExecOutcome::Exit(0));
        match outcome {
            ExecOutcome::Exit(code) => Ok(code),
            ExecOutcome::Fail(reason) => Err(Error::command_failed("fake exec", reason)),
            ExecOutcome::AddressUnavailable => Err(Error::address_unavailable(
                config.vm_name(),
                "no address yet",
            )),
        }
    }

    fn build_start_args(&self, config: &VmConfig) -> Result<Vec<String>> {
        Ok(vec!["run".to_string(), config.vm_name()])
    }

    async fn needs_pull(&self, config: &VmConfig) -> Result<bool> {
        self.record("needs_pull");
        let listed = self
            .list_result
            .lock()
            .iter()
            .any(|vm| vm.name == config.task.image);
        Ok(!listed)
    }
}
