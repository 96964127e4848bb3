//! Guest-side usage sampling over the remote shell.
//!
//! When a task opts in, resource usage is read from inside the VM with
//! standard `ps` output instead of scanning host processes. This sees the
//! guest's own view of memory and CPU, at the cost of an SSH round trip per
//! sample.

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::plugin::{CpuStats, MemoryStats, ResourceUsage, MEASURED_MEM_STATS};
use crate::virt::{ExecOptions, Virtualizer, VmConfig};

/// A `Write` sink the exec plumbing can own while we keep a handle.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Collect CPU and memory usage from inside the guest.
pub async fn guest_usage(client: &dyn Virtualizer, config: &VmConfig) -> Result<ResourceUsage> {
    let stdout = SharedBuffer::default();
    let stderr = SharedBuffer::default();

    let opts = ExecOptions::buffered(
        vec!["ps".into(), "-axo".into(), "rss,pcpu".into()],
        Box::new(stdout.clone()),
        Box::new(stderr.clone()),
    );

    client.exec(config, opts).await.map_err(|e| {
        let captured = String::from_utf8_lossy(&stderr.take()).trim().to_string();
        Error::command_failed(
            "guest ps",
            format!("exec stats command failed: {} (stderr: {})", e, captured),
        )
    })?;

    let raw = String::from_utf8_lossy(&stdout.take()).into_owned();
    parse_ps_output(&raw)
}

/// Sum `ps -axo rss,pcpu` output into a single usage sample.
///
/// Malformed lines (including the header) are skipped.
pub(crate) fn parse_ps_output(raw: &str) -> Result<ResourceUsage> {
    let lines: Vec<&str> = raw.trim().lines().collect();
    if lines.is_empty() {
        return Err(Error::command_failed("guest ps", "no stats output"));
    }

    let mut total_rss = 0u64;
    let mut total_cpu = 0f64;
    for line in lines {
        let mut fields = line.split_whitespace();
        let (Some(rss), Some(cpu)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(rss) = rss.parse::<u64>() else {
            continue;
        };
        let Ok(cpu) = cpu.parse::<f64>() else {
            continue;
        };
        // ps reports RSS in KB.
        total_rss += rss * 1024;
        total_cpu += cpu;
    }

    Ok(ResourceUsage {
        memory: MemoryStats {
            rss: total_rss,
            swap: 0,
            measured: MEASURED_MEM_STATS.iter().map(|s| s.to_string()).collect(),
        },
        cpu: CpuStats {
            system_mode: 0.0,
            user_mode: 0.0,
            percent: total_cpu,
            measured: vec!["Percent".to_string()],
        },
    })
}
