//! Dump/restore orchestration around the engine.
//!
//! Owns everything that happens around an engine invocation: fresh
//! per-attempt image directories, the write-only file pre-copy, notify
//! hook execution, the GPU signal-based dump path, and re-injection of
//! externally-held network descriptors on restore.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use nix::sys::signal::Signal;

use crate::config::DaemonConfig;
use crate::error::{CradleError, CradleResult, EngineError};
use crate::process;
use crate::types::{ProcessState, STATE_FILE};

use super::criu::CheckpointEngine;
use super::notify::NotifyHooks;
use super::opts::{EngineOpts, ProcessScan};

/// Externally-held file descriptors available for re-injection, keyed the
/// same way dump metadata records them (e.g. `tcp:<inode>`).
#[derive(Default)]
pub struct FdStore {
    fds: DashMap<String, RawFd>,
}

impl FdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, fd: RawFd) {
        self.fds.insert(key.into(), fd);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fds.contains_key(key)
    }

    /// Remove and return the descriptor for `key`. The caller takes over
    /// closing it.
    pub fn take(&self, key: &str) -> Option<RawFd> {
        self.fds.remove(key).map(|(_, fd)| fd)
    }
}

/// Orchestrates engine invocations with notify hooks.
pub struct EngineAdapter {
    engine: Arc<dyn CheckpointEngine>,
    config: Arc<DaemonConfig>,
}

impl EngineAdapter {
    pub fn new(engine: Arc<dyn CheckpointEngine>, config: Arc<DaemonConfig>) -> Self {
        Self { engine, config }
    }

    /// Create a fresh, timestamped image directory for one dump attempt.
    /// An existing directory is never reused or overwritten.
    pub fn prepare_images_dir(&self, base: &Path, name: &str) -> CradleResult<PathBuf> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = base.join(format!("{name}-{millis}"));

        if dir.exists() {
            return Err(EngineError::ImagesDirExists { path: dir }.into());
        }

        std::fs::create_dir_all(base).map_err(|e| CradleError::Io {
            context: "creating checkpoint base directory",
            source: e,
        })?;
        std::fs::create_dir(&dir).map_err(|e| CradleError::Io {
            context: "creating image directory",
            source: e,
        })?;

        Ok(dir)
    }

    /// Run a dump: initialize and pre-dump hooks, then either the GPU
    /// signal path or the engine, then post-dump hooks (which run
    /// regardless of outcome and receive it). Writes the process state
    /// file into the image directory on success.
    pub fn dump(
        &self,
        state: &mut ProcessState,
        scan: &ProcessScan,
        opts: &mut EngineOpts,
        hooks: &mut NotifyHooks,
        images_dir: &Path,
    ) -> CradleResult<()> {
        opts.images_dir = Some(images_dir.to_path_buf());
        state.sid = scan.sid;
        state.ext_fd_keys = scan.ext_fd_keys();

        self.precopy_write_only(scan, images_dir);

        hooks.run_initialize()?;
        hooks.run_pre_dump(images_dir)?;

        let result = if state.gpu_enabled && self.config.gpu_signal_checkpoint {
            self.gpu_signal_dump(state.pid, images_dir)
        } else {
            self.engine
                .dump(state.pid, opts)
                .map_err(CradleError::from)
        };

        // Post-dump hooks observe the outcome either way; their failure
        // only surfaces when the dump itself succeeded.
        let post = hooks.run_post_dump(images_dir, result.is_ok());
        result?;
        post?;

        self.write_state(images_dir, state)?;

        tracing::info!(pid = state.pid, dir = %images_dir.display(), "dump complete");
        Ok(())
    }

    /// GPU-attached workloads self-checkpoint on a signal; the engine is
    /// skipped entirely and the copied artifact is the checkpoint.
    fn gpu_signal_dump(&self, pid: u32, images_dir: &Path) -> CradleResult<()> {
        let sig = Signal::try_from(self.config.gpu_checkpoint_signal).map_err(|_| {
            CradleError::Unavailable {
                reason: format!(
                    "invalid GPU checkpoint signal {}",
                    self.config.gpu_checkpoint_signal
                ),
            }
        })?;

        let artifact =
            process::signal_and_await(pid, sig, images_dir, self.config.gpu_await_timeout)?;

        match artifact {
            Some(path) => {
                tracing::info!(pid, artifact = %path.display(), "GPU self-checkpoint captured");
                Ok(())
            }
            None => Err(CradleError::DeadlineExceeded {
                operation: "gpu-signal-dump",
                timeout: self.config.gpu_await_timeout,
            }),
        }
    }

    /// Copy open write-only regular files into the image directory before
    /// the snapshot so in-flight writes are captured. Best-effort only:
    /// there is no byte-level synchronization with the writer, so files
    /// written faster than they can be copied are a known consistency
    /// gap.
    fn precopy_write_only(&self, scan: &ProcessScan, images_dir: &Path) {
        if scan.write_only_files.is_empty() {
            return;
        }
        let dest_dir = images_dir.join("open-files");
        if let Err(e) = std::fs::create_dir_all(&dest_dir) {
            tracing::warn!(error = %e, "failed to create open-files directory");
            return;
        }
        for file in &scan.write_only_files {
            let Some(name) = file.file_name() else { continue };
            if let Err(e) = std::fs::copy(file, dest_dir.join(name)) {
                tracing::warn!(file = %file.display(), error = %e, "failed to pre-copy open file");
            }
        }
    }

    /// Run a restore: resolve required external descriptors from the FD
    /// store (all must be present before the engine is invoked), run
    /// pre/post-restore hooks around the engine call, and close our
    /// copies of the descriptors whether or not the call succeeded.
    pub fn restore(
        &self,
        images_dir: &Path,
        opts: &mut EngineOpts,
        hooks: &mut NotifyHooks,
        fd_store: &FdStore,
    ) -> CradleResult<(u32, ProcessState)> {
        let state = self.read_state(images_dir)?;

        // Every descriptor referenced by the checkpoint metadata must be
        // available; otherwise fail before touching the engine.
        let mut taken: Vec<(String, RawFd)> = Vec::with_capacity(state.ext_fd_keys.len());
        for key in &state.ext_fd_keys {
            match fd_store.take(key) {
                Some(fd) => taken.push((key.clone(), fd)),
                None => {
                    close_all(&taken);
                    return Err(CradleError::NotFound {
                        what: format!("external fd '{key}' in FD store"),
                    });
                }
            }
        }

        opts.images_dir = Some(images_dir.to_path_buf());
        opts.inherit_fds = taken.clone();

        hooks.run_initialize()?;
        let result: CradleResult<u32> = (|| {
            hooks.run_pre_restore(images_dir)?;
            let pid = self.engine.restore(opts)?;
            Ok(pid)
        })();

        // Ownership of the injected descriptors passed to the restored
        // process on success; either way our copies must go.
        close_all(&taken);

        let pid = result?;
        hooks.run_post_restore(pid)?;

        tracing::info!(pid, dir = %images_dir.display(), "restore complete");
        Ok((pid, state))
    }

    fn write_state(&self, images_dir: &Path, state: &ProcessState) -> CradleResult<()> {
        let path = images_dir.join(STATE_FILE);
        let json = serde_json::to_vec_pretty(state).map_err(|e| CradleError::Io {
            context: "serializing process state",
            source: e.into(),
        })?;
        std::fs::write(&path, json).map_err(|e| CradleError::Io {
            context: "writing process state file",
            source: e,
        })
    }

    fn read_state(&self, images_dir: &Path) -> CradleResult<ProcessState> {
        let path = images_dir.join(STATE_FILE);
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            CradleError::Engine(EngineError::BadMetadata {
                path: path.clone(),
                reason: e.to_string(),
            })
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            CradleError::Engine(EngineError::BadMetadata {
                path,
                reason: e.to_string(),
            })
        })
    }
}

fn close_all(fds: &[(String, RawFd)]) {
    for (key, fd) in fds {
        if let Err(e) = nix::unistd::close(*fd) {
            tracing::warn!(key, fd, error = %e, "failed to close injected fd copy");
        }
    }
}
