//! OS-level process control.
//!
//! Signal-based pause/resume, liveness probes, cooperative
//! signal-and-await (used to ask GPU-attached workloads to
//! self-checkpoint), and asynchronous exit waiting for managed PIDs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
// Re-exported so plugin crates can name signals without a nix dependency.
pub use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::ProcessError;

/// Interval at which exit-waiters and await loops poll.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Deliver a stop signal, pausing the process.
pub fn pause(pid: u32) -> Result<(), ProcessError> {
    signal(pid, Signal::SIGSTOP)
}

/// Deliver a continue signal, resuming a paused process.
pub fn resume(pid: u32) -> Result<(), ProcessError> {
    signal(pid, Signal::SIGCONT)
}

/// Deliver an arbitrary signal. Signaling a nonexistent PID is reported,
/// never silently ignored.
pub fn signal(pid: u32, sig: Signal) -> Result<(), ProcessError> {
    kill(Pid::from_raw(pid as i32), sig).map_err(|errno| match errno {
        Errno::ESRCH => ProcessError::NotFound { pid },
        Errno::EPERM => ProcessError::PermissionDenied { pid },
        other => ProcessError::SignalFailed {
            pid,
            reason: other.to_string(),
        },
    })
}

/// Liveness probe via a null signal.
pub fn exists(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // EPERM means the process exists but we may not signal it.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Deliver `sig` to a cooperating process and block up to `timeout` for a
/// checkpoint artifact to appear under `artifact_dir`. Returns the path of
/// the first artifact observed, or `None` if the timeout elapsed without
/// one (the caller decides whether an empty result is an error).
///
/// Only entries created after the signal count: the directory may already
/// hold daemon-written files (pre-copied open files, metadata), and those
/// must never be mistaken for the process's own artifact.
pub fn signal_and_await(
    pid: u32,
    sig: Signal,
    artifact_dir: &Path,
    timeout: Duration,
) -> Result<Option<PathBuf>, ProcessError> {
    let preexisting = list_entries(artifact_dir);

    signal(pid, sig)?;

    tracing::debug!(pid, signal = %sig, dir = %artifact_dir.display(), "awaiting checkpoint artifact");

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(path) = new_entry(artifact_dir, &preexisting) {
            tracing::info!(pid, artifact = %path.display(), "checkpoint artifact observed");
            return Ok(Some(path));
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    tracing::warn!(pid, "no checkpoint artifact observed within timeout");
    Ok(None)
}

fn list_entries(dir: &Path) -> HashSet<PathBuf> {
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect()
}

fn new_entry(dir: &Path, preexisting: &HashSet<PathBuf>) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| !preexisting.contains(p))
}

/// Handle for a pending process exit. Dropping the waiter cancels the
/// background poller, so abandoning interest does not leak a thread that
/// outlives the process.
#[derive(Debug)]
pub struct ExitWaiter {
    rx: Receiver<i32>,
    cancel: Arc<AtomicBool>,
}

impl ExitWaiter {
    /// Block until the process exits, returning its exit code. `None` if
    /// the poller terminated without observing an exit (cancelled).
    pub fn wait(&self) -> Option<i32> {
        self.rx.recv().ok()
    }

    /// Block up to `timeout` for the exit code.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<i32, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Non-blocking check.
    pub fn try_wait(&self) -> Option<i32> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ExitWaiter {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

/// Start a background poller that resolves with the process's exit code
/// once it terminates. For direct children the real exit code is reaped
/// via waitpid; for non-children (e.g. engine-restored detached
/// processes) only disappearance is observable and the code reported is 0.
pub fn wait_for_exit(pid: u32) -> ExitWaiter {
    let (tx, rx) = sync_channel(1);
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);

    let spawned = std::thread::Builder::new()
        .name(format!("exit-wait-{pid}"))
        .spawn(move || {
            let nix_pid = Pid::from_raw(pid as i32);
            loop {
                if flag.load(Ordering::Relaxed) {
                    return;
                }
                match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::Exited(_, code)) => {
                        let _ = tx.send(code);
                        return;
                    }
                    Ok(WaitStatus::Signaled(_, sig, _)) => {
                        let _ = tx.send(128 + sig as i32);
                        return;
                    }
                    Ok(_) => {} // still alive
                    Err(Errno::ECHILD) => {
                        // Not our child: fall back to liveness polling.
                        if !exists(pid) {
                            let _ = tx.send(0);
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = tx.send(0);
                        return;
                    }
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        });
    if let Err(e) = spawned {
        // tx was moved into the failed spawn and dropped with it, so the
        // waiter resolves to None rather than blocking forever.
        tracing::warn!(pid, error = %e, "failed to spawn exit-wait thread");
    }

    ExitWaiter { rx, cancel }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_signal_nonexistent_pid_reported() {
        // PID near the u32 ceiling is virtually guaranteed unused.
        let err = signal(u32::MAX - 7, Signal::SIGCONT).unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { .. }));
    }

    #[test]
    fn test_pause_resume_child() {
        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id();

        pause(pid).unwrap();
        resume(pid).unwrap();
        assert!(exists(pid));

        signal(pid, Signal::SIGKILL).unwrap();
        let waiter = wait_for_exit(pid);
        let code = waiter.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(code, 128 + libc::SIGKILL);
    }

    #[test]
    fn test_exit_waiter_reaps_exit_code() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let waiter = wait_for_exit(child.id());
        assert_eq!(waiter.wait_timeout(Duration::from_secs(5)).unwrap(), 3);
    }

    #[test]
    fn test_dropped_waiter_cancels() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let waiter = wait_for_exit(pid);
        drop(waiter); // poller must stop on its own
        signal(pid, Signal::SIGKILL).unwrap();
        // Reap to avoid a zombie in the test process.
        let _ = waitpid(Pid::from_raw(pid as i32), None);
    }

    #[test]
    fn test_signal_and_await_observes_artifact() {
        let dir = tempfile::TempDir::new().unwrap();
        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id();

        let dir_path = dir.path().to_path_buf();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            std::fs::write(dir_path.join("ckpt.img"), b"x").unwrap();
        });

        let artifact =
            signal_and_await(pid, Signal::SIGCONT, dir.path(), Duration::from_secs(5)).unwrap();
        assert!(artifact.is_some());
        writer.join().unwrap();

        signal(pid, Signal::SIGKILL).unwrap();
        let _ = waitpid(Pid::from_raw(pid as i32), None);
    }

    #[test]
    fn test_signal_and_await_ignores_preexisting_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        // Daemon-written content that predates the signal must not count
        // as the process's artifact.
        std::fs::create_dir(dir.path().join("open-files")).unwrap();
        std::fs::write(dir.path().join("open-files").join("app.log"), b"x").unwrap();

        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id();

        // Never-cooperating process: only the stale entries exist, so the
        // wait must run out rather than report instant success.
        let artifact =
            signal_and_await(pid, Signal::SIGCONT, dir.path(), Duration::from_millis(200)).unwrap();
        assert!(artifact.is_none());

        // Once a genuinely new entry lands, it is the one reported.
        let dir_path = dir.path().to_path_buf();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            std::fs::write(dir_path.join("ckpt.img"), b"x").unwrap();
        });
        let artifact =
            signal_and_await(pid, Signal::SIGCONT, dir.path(), Duration::from_secs(5)).unwrap();
        assert_eq!(artifact, Some(dir.path().join("ckpt.img")));
        writer.join().unwrap();

        signal(pid, Signal::SIGKILL).unwrap();
        let _ = waitpid(Pid::from_raw(pid as i32), None);
    }

    #[test]
    fn test_signal_and_await_times_out_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let child = Command::new("sleep").arg("2").spawn().unwrap();
        let pid = child.id();

        let artifact =
            signal_and_await(pid, Signal::SIGCONT, dir.path(), Duration::from_millis(150)).unwrap();
        assert!(artifact.is_none());

        signal(pid, Signal::SIGKILL).unwrap();
        let _ = waitpid(Pid::from_raw(pid as i32), None);
    }
}
