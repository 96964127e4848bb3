//! Platform-specific process inspection.
//!
//! Resource accounting needs two things the standard library does not give
//! us: per-PID CPU time split into user/system, and the set of file paths a
//! process holds open (used to attribute hypervisor helper processes to a
//! VM's backing disk). Linux reads `/proc`; macOS goes through `libproc`.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;

use std::path::PathBuf;

/// One point-in-time sample of a process's resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    /// Resident set size in bytes.
    pub rss: u64,
    /// Swapped-out bytes. Zero on platforms without per-process swap
    /// accounting.
    pub swap: u64,
    /// Cumulative user-mode CPU time in seconds.
    pub user_secs: f64,
    /// Cumulative system-mode CPU time in seconds.
    pub system_secs: f64,
}

impl ProcessSample {
    /// Total cumulative CPU time in seconds.
    pub fn total_cpu_secs(&self) -> f64 {
        self.user_secs + self.system_secs
    }
}

/// Sample memory and CPU usage of one process.
///
/// Returns `None` when the process is gone or unreadable; callers treat a
/// failed sample as skippable, never fatal.
pub fn sample_process(pid: u32) -> Option<ProcessSample> {
    #[cfg(target_os = "linux")]
    {
        linux::sample_process(pid)
    }
    #[cfg(target_os = "macos")]
    {
        macos::sample_process(pid)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = pid;
        None
    }
}

/// Paths of the regular files a process holds open.
///
/// Best-effort: unreadable processes yield an empty list.
pub fn open_file_paths(pid: u32) -> Vec<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        linux::open_file_paths(pid)
    }
    #[cfg(target_os = "macos")]
    {
        macos::open_file_paths(pid)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = pid;
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_current_process() {
        let sample = sample_process(std::process::id());
        // We exist, so a sample should come back with a non-zero RSS.
        let sample = sample.expect("current process should be sampleable");
        assert!(sample.rss > 0);
        assert!(sample.total_cpu_secs() >= 0.0);
    }

    #[test]
    fn test_sample_missing_process_returns_none() {
        assert!(sample_process(u32::MAX - 1).is_none());
    }

    #[test]
    fn test_open_file_paths_sees_held_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("platform-open-file-{}", std::process::id()));
        std::fs::write(&path, b"data").unwrap();
        let file = std::fs::File::open(&path).unwrap();

        let open = open_file_paths(std::process::id());
        let canonical = path.canonicalize().unwrap();
        assert!(
            open.iter().any(|p| p == &canonical || p == &path),
            "expected {} in {:?}",
            path.display(),
            open
        );

        drop(file);
        let _ = std::fs::remove_file(&path);
    }
}
