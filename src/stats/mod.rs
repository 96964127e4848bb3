//! Multi-process resource accounting for VM tasks.
//!
//! One logical VM task spans more than one OS process: the `tart run`
//! launcher plus the hypervisor helper that owns the VM's backing store.
//! Attribution is recomputed from the live process table on every sample
//! rather than cached, since helper processes come and go with the VM.
//!
//! CPU percent uses a stateful delta tracker: each sample compares
//! cumulative CPU time against the previous sample for the same PID, so
//! short sampling intervals don't under-report. One tracker lives for the
//! task's whole lifetime and is pruned of PIDs that disappeared.

pub mod guest;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use sysinfo::System;
use tracing::debug;

use crate::platform;
use crate::plugin::{
    CpuStats, MemoryStats, ResourceUsage, TaskResourceUsage, MEASURED_CPU_STATS,
    MEASURED_MEM_STATS,
};

/// Executable-path fragment identifying the hypervisor helper process.
const HELPER_EXE_PATTERN: &str = "Virtualization.VirtualMachine";

/// Process-name fragment identifying the hypervisor helper process. The
/// helper has shown up under either spelling across tool versions.
const HELPER_NAME_PATTERN: &str = "Virtual Machine Service";

/// Stateful CPU usage tracker.
///
/// Keeps the last observed cumulative CPU time per PID and derives percent
/// from the delta against wall time. The first sample for a PID reports
/// zero percent; it only seeds the baseline.
#[derive(Debug, Default)]
pub struct CpuTracker {
    entries: HashMap<u32, TrackerEntry>,
}

#[derive(Debug, Clone, Copy)]
struct TrackerEntry {
    total_cpu_secs: f64,
    sampled_at: Instant,
}

impl CpuTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cumulative CPU time observation and return the utilisation
    /// percent since the previous observation for this PID.
    pub fn percent(&mut self, pid: u32, total_cpu_secs: f64) -> f64 {
        self.percent_at(pid, total_cpu_secs, Instant::now())
    }

    fn percent_at(&mut self, pid: u32, total_cpu_secs: f64, now: Instant) -> f64 {
        let previous = self.entries.insert(
            pid,
            TrackerEntry {
                total_cpu_secs,
                sampled_at: now,
            },
        );

        let Some(previous) = previous else {
            return 0.0;
        };

        let wall = now.duration_since(previous.sampled_at).as_secs_f64();
        if wall <= 0.0 {
            return 0.0;
        }
        // Clamp: cumulative counters can regress when a PID is recycled.
        let delta = (total_cpu_secs - previous.total_cpu_secs).max(0.0);
        delta / wall * 100.0
    }

    /// Drop tracking state for PIDs that are no longer attributed.
    pub fn prune(&mut self, live: &[u32]) {
        self.entries.retain(|pid, _| live.contains(pid));
    }

    /// Number of tracked PIDs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any PIDs are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Expected path of a VM's backing disk image.
pub fn vm_disk_path(vm_name: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tart").join("vms").join(vm_name).join("disk.img"))
}

/// All PIDs attributed to one VM task: the launcher plus any hypervisor
/// helper holding the VM's backing disk open.
pub fn related_pids(system: &System, vm_name: &str, launcher_pid: u32) -> Vec<u32> {
    let mut pids = Vec::new();
    if launcher_pid > 0 {
        pids.push(launcher_pid);
    }

    let Some(disk_path) = vm_disk_path(vm_name) else {
        return pids;
    };
    pids.extend(helper_pids_for_disk(system, &disk_path));
    pids
}

/// Helper processes holding the given backing disk open.
///
/// A process qualifies when its executable matches the helper naming
/// pattern and one of its open file handles is the disk image.
pub fn helper_pids_for_disk(system: &System, disk_path: &Path) -> Vec<u32> {
    let mut pids = Vec::new();
    for (pid, process) in system.processes() {
        let pid = pid.as_u32();

        let exe_matches = process
            .exe()
            .map(|exe| exe.to_string_lossy().contains(HELPER_EXE_PATTERN))
            .unwrap_or(false)
            || process.name().contains(HELPER_NAME_PATTERN);
        if !exe_matches {
            continue;
        }

        if platform::open_file_paths(pid)
            .iter()
            .any(|path| path == disk_path)
        {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    pids
}

/// Collect one aggregated usage sample for a VM task.
///
/// Per-process sampling failures are skipped; a flaky PID never fails the
/// aggregate.
pub fn collect(
    system: &mut System,
    tracker: &mut CpuTracker,
    vm_name: &str,
    launcher_pid: u32,
) -> TaskResourceUsage {
    system.refresh_processes();

    let pids = related_pids(system, vm_name, launcher_pid);
    tracker.prune(&pids);

    let mut by_pid = HashMap::new();
    let mut total_rss = 0u64;
    let mut total_swap = 0u64;
    let mut total_user = 0f64;
    let mut total_system = 0f64;
    let mut total_percent = 0f64;

    for pid in pids {
        let Some(sample) = platform::sample_process(pid) else {
            debug!(pid, "failed to sample process, skipping");
            continue;
        };

        let percent = tracker.percent(pid, sample.total_cpu_secs());
        let usage = ResourceUsage {
            memory: MemoryStats {
                rss: sample.rss,
                swap: sample.swap,
                measured: MEASURED_MEM_STATS.iter().map(|s| s.to_string()).collect(),
            },
            cpu: CpuStats {
                user_mode: sample.user_secs * 1e9,
                system_mode: sample.system_secs * 1e9,
                percent,
                measured: MEASURED_CPU_STATS.iter().map(|s| s.to_string()).collect(),
            },
        };

        total_rss += sample.rss;
        total_swap += sample.swap;
        total_user += usage.cpu.user_mode;
        total_system += usage.cpu.system_mode;
        total_percent += percent;
        by_pid.insert(pid.to_string(), usage);
    }

    TaskResourceUsage {
        resource_usage: ResourceUsage {
            memory: MemoryStats {
                rss: total_rss,
                swap: total_swap,
                measured: MEASURED_MEM_STATS.iter().map(|s| s.to_string()).collect(),
            },
            cpu: CpuStats {
                user_mode: total_user,
                system_mode: total_system,
                percent: total_percent,
                measured: MEASURED_CPU_STATS.iter().map(|s| s.to_string()).collect(),
            },
        },
        timestamp: SystemTime::now(),
        pids: by_pid,
    }
}
