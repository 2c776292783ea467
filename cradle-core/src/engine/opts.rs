//! Engine option construction.
//!
//! Options are built from a [`ProcessScan`] of the target's /proc entries
//! so that [`build_dump_opts`] itself stays pure and unit-testable.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Options forwarded to the checkpoint engine. Mirrors the narrow subset
/// of engine flags the orchestrator cares about; anything unset is left to
/// the engine's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineOpts {
    pub tcp_established: bool,
    pub ext_unix_sk: bool,
    pub shell_job: bool,
    pub file_locks: bool,
    /// Keep the process running after a successful dump.
    pub leave_running: bool,
    /// Image directory for this attempt; set by the pipeline, never by
    /// the caller.
    #[serde(skip)]
    pub images_dir: Option<PathBuf>,
    /// External resources (mounts, ttys, files) the engine should treat
    /// as outside the dumped tree, in `kind[id]` notation.
    pub external: Vec<String>,
    /// Descriptors to re-inject on restore as `(key, fd)`. Ownership of
    /// the fds transfers to the restored process on success.
    #[serde(skip)]
    pub inherit_fds: Vec<(String, RawFd)>,
}

/// What a scan of `/proc/<pid>` observed about the target process.
#[derive(Debug, Clone, Default)]
pub struct ProcessScan {
    pub pid: u32,
    pub sid: u32,
    pub has_established_tcp: bool,
    pub has_unix_socket: bool,
    pub has_tty: bool,
    /// Inodes of established TCP sockets, used as FD-store keys.
    pub tcp_inodes: Vec<u64>,
    /// Regular files open write-only; copied into the checkpoint
    /// directory before the snapshot.
    pub write_only_files: Vec<PathBuf>,
}

impl ProcessScan {
    /// FD-store keys for the externally-held network descriptors this
    /// process references.
    pub fn ext_fd_keys(&self) -> Vec<String> {
        self.tcp_inodes.iter().map(|ino| format!("tcp:{ino}")).collect()
    }
}

/// Build dump options from a process scan, layered over whatever the
/// caller already set. `file_locks` is always on; network flags follow the
/// observed sockets; `shell_job` is set for an open tty or a session
/// leader mismatch.
pub fn build_dump_opts(scan: &ProcessScan, mut opts: EngineOpts) -> EngineOpts {
    opts.tcp_established = opts.tcp_established || scan.has_established_tcp;
    opts.ext_unix_sk = opts.ext_unix_sk || scan.has_unix_socket;
    opts.shell_job = opts.shell_job || scan.has_tty || (scan.sid != scan.pid && scan.sid != 0);
    opts.file_locks = true;
    opts
}

/// Scan `/proc/<pid>` for the signals [`build_dump_opts`] needs.
pub fn scan_process(pid: u32) -> std::io::Result<ProcessScan> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));

    let mut scan = ProcessScan {
        pid,
        sid: read_sid(&proc_dir).unwrap_or(0),
        ..Default::default()
    };

    let mut socket_inodes = Vec::new();
    let fd_dir = proc_dir.join("fd");
    for entry in std::fs::read_dir(&fd_dir)? {
        let entry = entry?;
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        let target_str = target.to_string_lossy();

        if let Some(inode) = parse_socket_inode(&target_str) {
            socket_inodes.push(inode);
        } else if target_str.starts_with("/dev/pts/") || target_str == "/dev/tty" {
            scan.has_tty = true;
        } else if target.is_absolute() && target.is_file() {
            let fd_name = entry.file_name();
            if is_write_only(&proc_dir, &fd_name.to_string_lossy()) {
                scan.write_only_files.push(target);
            }
        }
    }

    if !socket_inodes.is_empty() {
        let established = established_tcp_inodes(&proc_dir);
        let unix = unix_socket_inodes(&proc_dir);
        for inode in socket_inodes {
            if established.contains(&inode) {
                scan.has_established_tcp = true;
                scan.tcp_inodes.push(inode);
            }
            if unix.contains(&inode) {
                scan.has_unix_socket = true;
            }
        }
    }

    Ok(scan)
}

/// Session id is field 6 of `/proc/<pid>/stat`, counted after the
/// parenthesized comm (which may itself contain spaces).
fn read_sid(proc_dir: &Path) -> Option<u32> {
    let stat = std::fs::read_to_string(proc_dir.join("stat")).ok()?;
    let after_comm = stat.rsplit_once(')')?.1;
    after_comm.split_whitespace().nth(3)?.parse().ok()
}

fn parse_socket_inode(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// O_WRONLY check via the flags line of `/proc/<pid>/fdinfo/<fd>`.
fn is_write_only(proc_dir: &Path, fd: &str) -> bool {
    let Ok(info) = std::fs::read_to_string(proc_dir.join("fdinfo").join(fd)) else {
        return false;
    };
    for line in info.lines() {
        if let Some(flags) = line.strip_prefix("flags:") {
            if let Ok(flags) = i32::from_str_radix(flags.trim(), 8) {
                return flags & libc::O_ACCMODE == libc::O_WRONLY;
            }
        }
    }
    false
}

/// Inodes of sockets in the ESTABLISHED state (st == 01) from the
/// process's own network namespace view.
fn established_tcp_inodes(proc_dir: &Path) -> Vec<u64> {
    let mut inodes = Vec::new();
    for table in ["net/tcp", "net/tcp6"] {
        let Ok(contents) = std::fs::read_to_string(proc_dir.join(table)) else {
            continue;
        };
        for line in contents.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() > 9 && fields[3] == "01" {
                if let Ok(inode) = fields[9].parse() {
                    inodes.push(inode);
                }
            }
        }
    }
    inodes
}

fn unix_socket_inodes(proc_dir: &Path) -> Vec<u64> {
    let Ok(contents) = std::fs::read_to_string(proc_dir.join("net/unix")) else {
        return Vec::new();
    };
    contents
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(6)?.parse().ok())
        .collect()
}
