//! CRIU engine driver.
//!
//! Drives the external `criu` binary for dump and restore. The
//! [`CheckpointEngine`] trait is the seam the rest of the crate depends
//! on, so tests substitute a mock engine.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::EngineError;

use super::opts::EngineOpts;

/// Log file names written by the engine into the image directory.
pub const DUMP_LOG_FILE: &str = "engine-dump.log";
pub const RESTORE_LOG_FILE: &str = "engine-restore.log";
const PID_FILE: &str = "restored.pid";

/// The external checkpoint/restore primitive. Dump snapshots the process
/// tree rooted at `pid` into `opts.images_dir`; restore reconstructs a
/// process from that directory and returns its new PID.
pub trait CheckpointEngine: Send + Sync {
    fn dump(&self, pid: u32, opts: &EngineOpts) -> Result<(), EngineError>;
    fn restore(&self, opts: &EngineOpts) -> Result<u32, EngineError>;
}

/// Engine implementation backed by the CRIU binary.
pub struct CriuEngine {
    binary: PathBuf,
}

impl CriuEngine {
    /// Use the given binary, or discover one from well-known locations.
    pub fn new(binary: Option<PathBuf>) -> Result<Self, EngineError> {
        let binary = match binary {
            Some(path) => path,
            None => Self::find_binary()?,
        };
        tracing::info!(binary = %binary.display(), "checkpoint engine initialized");
        Ok(Self { binary })
    }

    fn find_binary() -> Result<PathBuf, EngineError> {
        let candidates = [
            "/usr/sbin/criu",
            "/usr/bin/criu",
            "/sbin/criu",
            "/bin/criu",
            "/usr/local/sbin/criu",
            "/usr/local/bin/criu",
        ];

        for path in candidates {
            let p = PathBuf::from(path);
            if p.exists() {
                return Ok(p);
            }
        }

        if let Ok(output) = Command::new("which").arg("criu").output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Ok(PathBuf::from(path));
                }
            }
        }

        Err(EngineError::BinaryNotFound)
    }

    fn common_args(cmd: &mut Command, opts: &EngineOpts, images_dir: &Path, log_file: &str) {
        cmd.arg("-D").arg(images_dir);
        cmd.arg("-o").arg(log_file);
        if opts.shell_job {
            cmd.arg("--shell-job");
        }
        if opts.tcp_established {
            cmd.arg("--tcp-established");
        }
        if opts.ext_unix_sk {
            cmd.arg("--ext-unix-sk");
        }
        if opts.file_locks {
            cmd.arg("--file-locks");
        }
        for ext in &opts.external {
            cmd.arg("--external").arg(ext);
        }
    }
}

impl CheckpointEngine for CriuEngine {
    fn dump(&self, pid: u32, opts: &EngineOpts) -> Result<(), EngineError> {
        let images_dir = opts.images_dir.as_deref().ok_or_else(|| {
            EngineError::DumpFailed {
                reason: "no image directory set".to_string(),
            }
        })?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("dump").arg("-t").arg(pid.to_string());
        Self::common_args(&mut cmd, opts, images_dir, DUMP_LOG_FILE);
        if opts.leave_running {
            cmd.arg("--leave-running");
        }

        tracing::debug!(pid, dir = %images_dir.display(), "invoking engine dump");

        let output = cmd.output().map_err(|e| EngineError::DumpFailed {
            reason: format!("failed to execute engine: {e}"),
        })?;

        if !output.status.success() {
            let reason = failure_reason(&output.stderr, images_dir, DUMP_LOG_FILE);
            return Err(classify("dump", reason));
        }

        Ok(())
    }

    fn restore(&self, opts: &EngineOpts) -> Result<u32, EngineError> {
        let images_dir = opts.images_dir.as_deref().ok_or_else(|| {
            EngineError::RestoreFailed {
                reason: "no image directory set".to_string(),
            }
        })?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("restore").arg("-d"); // detach after restore
        Self::common_args(&mut cmd, opts, images_dir, RESTORE_LOG_FILE);
        cmd.arg("--pidfile").arg(images_dir.join(PID_FILE));
        for (key, fd) in &opts.inherit_fds {
            cmd.arg("--inherit-fd").arg(format!("fd[{fd}]:{key}"));
        }

        tracing::debug!(dir = %images_dir.display(), "invoking engine restore");

        let output = cmd.output().map_err(|e| EngineError::RestoreFailed {
            reason: format!("failed to execute engine: {e}"),
        })?;

        if !output.status.success() {
            let reason = failure_reason(&output.stderr, images_dir, RESTORE_LOG_FILE);
            return Err(classify("restore", reason));
        }

        let pid_path = images_dir.join(PID_FILE);
        let pid_str =
            std::fs::read_to_string(&pid_path).map_err(|e| EngineError::RestoreFailed {
                reason: format!("failed to read pid file {}: {e}", pid_path.display()),
            })?;

        pid_str
            .trim()
            .parse()
            .map_err(|e| EngineError::RestoreFailed {
                reason: format!("invalid pid '{}': {e}", pid_str.trim()),
            })
    }
}

/// Engine failure text: stderr plus the tail of the engine's own log file
/// from the image directory.
fn failure_reason(stderr: &[u8], images_dir: &Path, log_file: &str) -> String {
    let mut reason = String::from_utf8_lossy(stderr).trim().to_string();
    if let Ok(log) = std::fs::read_to_string(images_dir.join(log_file)) {
        let tail: Vec<&str> = log.lines().rev().take(5).collect();
        if !tail.is_empty() {
            reason.push_str(" | log tail: ");
            for line in tail.into_iter().rev() {
                reason.push_str(line);
                reason.push(';');
            }
        }
    }
    reason
}

/// Classify an unprivileged-condition report apart from a generic engine
/// failure, since only the former is actionable by the caller.
fn classify(operation: &'static str, reason: String) -> EngineError {
    let lowered = reason.to_lowercase();
    let unprivileged = lowered.contains("permission denied")
        || lowered.contains("operation not permitted")
        || lowered.contains("cap_sys_admin")
        || lowered.contains("must be root")
        || lowered.contains("non-root");

    if unprivileged {
        EngineError::Permission { operation, reason }
    } else {
        match operation {
            "dump" => EngineError::DumpFailed { reason },
            _ => EngineError::RestoreFailed { reason },
        }
    }
}
