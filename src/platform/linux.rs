//! Linux process inspection via `/proc`.

use std::path::PathBuf;

use super::ProcessSample;

/// Sample CPU times and memory for one process from `/proc/<pid>/`.
pub(super) fn sample_process(pid: u32) -> Option<ProcessSample> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Format: pid (comm) state ppid ... utime stime ...
    // comm can contain spaces and parentheses, so find the last ')' first.
    let after_comm = stat.rfind(')')? + 2;
    let fields: Vec<&str> = stat.get(after_comm..)?.split_whitespace().collect();
    // After ") ", fields are: state(0) ppid(1) ... utime(11) stime(12)
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;

    let ticks_per_sec = match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
        n if n > 0 => n as f64,
        _ => 100.0,
    };

    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let rss = status_kb_field(&status, "VmRSS:").unwrap_or(0);
    let swap = status_kb_field(&status, "VmSwap:").unwrap_or(0);

    Some(ProcessSample {
        rss: rss * 1024,
        swap: swap * 1024,
        user_secs: utime as f64 / ticks_per_sec,
        system_secs: stime as f64 / ticks_per_sec,
    })
}

/// Extract a `<name>: <n> kB` field from `/proc/<pid>/status`.
fn status_kb_field(status: &str, name: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with(name))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Resolve the file paths behind `/proc/<pid>/fd/*`.
pub(super) fn open_file_paths(pid: u32) -> Vec<PathBuf> {
    let fd_dir = format!("/proc/{}/fd", pid);
    let entries = match std::fs::read_dir(&fd_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| std::fs::read_link(entry.path()).ok())
        // Sockets and pipes read as "socket:[...]"; keep real paths only.
        .filter(|target| target.is_absolute())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_kb_field() {
        let status = "Name:\tcat\nVmRSS:\t  1024 kB\nVmSwap:\t     0 kB\n";
        assert_eq!(status_kb_field(status, "VmRSS:"), Some(1024));
        assert_eq!(status_kb_field(status, "VmSwap:"), Some(0));
        assert_eq!(status_kb_field(status, "VmMissing:"), None);
    }
}
