//! macOS process inspection via `libproc`.
//!
//! Uses `proc_pidinfo`/`proc_pidfdinfo`, the modern macOS APIs for process
//! information, which have stable struct layouts. Only the struct subsets we
//! read are declared.

use std::path::PathBuf;

use super::ProcessSample;

extern "C" {
    fn proc_pidinfo(
        pid: libc::c_int,
        flavor: libc::c_int,
        arg: u64,
        buffer: *mut libc::c_void,
        buffersize: libc::c_int,
    ) -> libc::c_int;

    fn proc_pidfdinfo(
        pid: libc::c_int,
        fd: libc::c_int,
        flavor: libc::c_int,
        buffer: *mut libc::c_void,
        buffersize: libc::c_int,
    ) -> libc::c_int;
}

const PROC_PIDLISTFDS: libc::c_int = 1;
const PROC_PIDTASKINFO: libc::c_int = 4;
const PROC_PIDFDVNODEPATHINFO: libc::c_int = 2;
const PROX_FDTYPE_VNODE: u32 = 1;
const MAXPATHLEN: usize = 1024;

/// Subset of `struct proc_taskinfo` from <libproc.h>.
#[repr(C)]
#[derive(Default)]
struct ProcTaskInfo {
    pti_virtual_size: u64,
    pti_resident_size: u64,
    pti_total_user: u64,
    pti_total_system: u64,
    pti_threads_user: u64,
    pti_threads_system: u64,
    pti_policy: i32,
    pti_faults: i32,
    pti_pageins: i32,
    pti_cow_faults: i32,
    pti_messages_sent: i32,
    pti_messages_received: i32,
    pti_syscalls_mach: i32,
    pti_syscalls_unix: i32,
    pti_csw: i32,
    pti_threadnum: i32,
    pti_numrunning: i32,
    pti_priority: i32,
}

/// `struct proc_fdinfo` from <libproc.h>.
#[repr(C)]
#[derive(Clone, Copy)]
struct ProcFdInfo {
    proc_fd: i32,
    proc_fdtype: u32,
}

/// `struct proc_fileinfo` from <libproc.h>.
#[repr(C)]
struct ProcFileInfo {
    fi_openflags: u32,
    fi_status: u32,
    fi_offset: i64,
    fi_type: i32,
    fi_guardflags: u32,
}

/// `struct vinfo_stat` from <sys/proc_info.h>.
#[repr(C)]
struct VinfoStat {
    vst_dev: u32,
    vst_mode: u16,
    vst_nlink: u16,
    vst_ino: u64,
    vst_uid: u32,
    vst_gid: u32,
    vst_atime: i64,
    vst_atimensec: i64,
    vst_mtime: i64,
    vst_mtimensec: i64,
    vst_ctime: i64,
    vst_ctimensec: i64,
    vst_birthtime: i64,
    vst_birthtimensec: i64,
    vst_size: i64,
    vst_blocks: i64,
    vst_blksize: i32,
    vst_flags: u32,
    vst_gen: u32,
    vst_rdev: u32,
    vst_qspare: [i64; 2],
}

/// `struct vnode_info` from <sys/proc_info.h>.
#[repr(C)]
struct VnodeInfo {
    vi_stat: VinfoStat,
    vi_type: i32,
    vi_pad: i32,
    vi_fsid: [i32; 2],
}

/// `struct vnode_fdinfowithpath` from <sys/proc_info.h>.
#[repr(C)]
struct VnodeFdInfoWithPath {
    pfi: ProcFileInfo,
    vip_vi: VnodeInfo,
    vip_path: [u8; MAXPATHLEN],
}

/// Convert mach absolute time units to seconds.
fn mach_units_to_secs(units: u64) -> f64 {
    let mut timebase = libc::mach_timebase_info { numer: 0, denom: 0 };
    let nanos = unsafe {
        if libc::mach_timebase_info(&mut timebase) == libc::KERN_SUCCESS && timebase.denom != 0 {
            units as f64 * timebase.numer as f64 / timebase.denom as f64
        } else {
            units as f64
        }
    };
    nanos / 1e9
}

/// Sample CPU times and memory for one process.
///
/// Per-process swap is not accounted on macOS; it reports as zero.
pub(super) fn sample_process(pid: u32) -> Option<ProcessSample> {
    let mut info = ProcTaskInfo::default();
    let size = std::mem::size_of::<ProcTaskInfo>() as libc::c_int;
    let ret = unsafe {
        proc_pidinfo(
            pid as libc::c_int,
            PROC_PIDTASKINFO,
            0,
            &mut info as *mut _ as *mut libc::c_void,
            size,
        )
    };
    if ret < size {
        return None;
    }

    Some(ProcessSample {
        rss: info.pti_resident_size,
        swap: 0,
        user_secs: mach_units_to_secs(info.pti_total_user),
        system_secs: mach_units_to_secs(info.pti_total_system),
    })
}

/// Paths of the vnode-backed files a process holds open.
pub(super) fn open_file_paths(pid: u32) -> Vec<PathBuf> {
    // First call sizes the fd table.
    let needed = unsafe {
        proc_pidinfo(
            pid as libc::c_int,
            PROC_PIDLISTFDS,
            0,
            std::ptr::null_mut(),
            0,
        )
    };
    if needed <= 0 {
        return Vec::new();
    }

    let count = needed as usize / std::mem::size_of::<ProcFdInfo>();
    let mut fds = vec![
        ProcFdInfo {
            proc_fd: 0,
            proc_fdtype: 0,
        };
        count
    ];
    let filled = unsafe {
        proc_pidinfo(
            pid as libc::c_int,
            PROC_PIDLISTFDS,
            0,
            fds.as_mut_ptr() as *mut libc::c_void,
            needed,
        )
    };
    if filled <= 0 {
        return Vec::new();
    }
    let filled_count = filled as usize / std::mem::size_of::<ProcFdInfo>();

    let mut paths = Vec::new();
    for fd in &fds[..filled_count.min(count)] {
        if fd.proc_fdtype != PROX_FDTYPE_VNODE {
            continue;
        }

        let mut vnode: VnodeFdInfoWithPath = unsafe { std::mem::zeroed() };
        let size = std::mem::size_of::<VnodeFdInfoWithPath>() as libc::c_int;
        let ret = unsafe {
            proc_pidfdinfo(
                pid as libc::c_int,
                fd.proc_fd,
                PROC_PIDFDVNODEPATHINFO,
                &mut vnode as *mut _ as *mut libc::c_void,
                size,
            )
        };
        if ret < size {
            continue;
        }

        let len = vnode
            .vip_path
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAXPATHLEN);
        if len == 0 {
            continue;
        }
        let path = String::from_utf8_lossy(&vnode.vip_path[..len]).into_owned();
        paths.push(PathBuf::from(path));
    }
    paths
}
