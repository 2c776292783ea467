//! Daemon configuration.
//!
//! YAML configuration parsed through a raw struct and validated into a
//! typed one. Every value has a built-in default so the daemon can start
//! with no configuration file at all; the core treats these as
//! already-resolved inputs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CradleError, CradleResult, ValidationError};

/// Raw configuration as parsed from YAML (before validation).
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    checkpoint: RawCheckpointConfig,
    #[serde(default)]
    plugins: RawPluginConfig,
    #[serde(default)]
    gpu: RawGpuConfig,
}

#[derive(Debug, Deserialize)]
struct RawCheckpointConfig {
    #[serde(default = "default_base_dir")]
    base_dir: String,
    /// Explicit engine binary path; discovered from well-known locations
    /// when unset.
    engine_binary: Option<String>,
    #[serde(default = "default_dump_timeout_secs")]
    dump_timeout_secs: u64,
    #[serde(default = "default_restore_timeout_secs")]
    restore_timeout_secs: u64,
    #[serde(default = "default_freeze_timeout_secs")]
    freeze_timeout_secs: u64,
}

fn default_base_dir() -> String {
    "/var/lib/cradle/checkpoints".to_string()
}

fn default_dump_timeout_secs() -> u64 {
    300
}

fn default_restore_timeout_secs() -> u64 {
    300
}

fn default_freeze_timeout_secs() -> u64 {
    60
}

impl Default for RawCheckpointConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            engine_binary: None,
            dump_timeout_secs: default_dump_timeout_secs(),
            restore_timeout_secs: default_restore_timeout_secs(),
            freeze_timeout_secs: default_freeze_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPluginConfig {
    #[serde(default = "default_plugin_dir")]
    dir: String,
}

fn default_plugin_dir() -> String {
    "/usr/local/lib/cradle".to_string()
}

impl Default for RawPluginConfig {
    fn default() -> Self {
        Self {
            dir: default_plugin_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawGpuConfig {
    /// When set, GPU-attached processes are checkpointed by signaling
    /// them to self-checkpoint instead of invoking the engine.
    #[serde(default)]
    signal_checkpoint: bool,
    #[serde(default = "default_gpu_signal")]
    checkpoint_signal: i32,
    #[serde(default = "default_gpu_await_secs")]
    await_timeout_secs: u64,
}

fn default_gpu_signal() -> i32 {
    libc::SIGUSR1
}

fn default_gpu_await_secs() -> u64 {
    60
}

impl Default for RawGpuConfig {
    fn default() -> Self {
        Self {
            signal_checkpoint: false,
            checkpoint_signal: default_gpu_signal(),
            await_timeout_secs: default_gpu_await_secs(),
        }
    }
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Base directory under which per-attempt checkpoint directories are
    /// created.
    pub checkpoint_base_dir: PathBuf,
    pub engine_binary: Option<PathBuf>,
    pub dump_timeout: Duration,
    pub restore_timeout: Duration,
    pub freeze_timeout: Duration,
    pub plugin_dir: PathBuf,
    pub gpu_signal_checkpoint: bool,
    pub gpu_checkpoint_signal: i32,
    pub gpu_await_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_raw(RawConfig::default()).expect("built-in defaults are valid")
    }
}

impl DaemonConfig {
    /// Load configuration from a YAML file. A missing file is not an
    /// error; it yields the built-in defaults.
    pub fn load(path: impl AsRef<Path>) -> CradleResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| CradleError::Io {
            context: "reading config file",
            source: e,
        })?;

        let raw: RawConfig = serde_yaml::from_str(&contents).map_err(|e| {
            CradleError::Validation(ValidationError::InvalidFieldValue {
                field: "config",
                value: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> CradleResult<Self> {
        if raw.checkpoint.dump_timeout_secs == 0 {
            return Err(CradleError::Validation(ValidationError::InvalidFieldValue {
                field: "checkpoint.dump_timeout_secs",
                value: "0".to_string(),
                reason: "timeout must be non-zero".to_string(),
            }));
        }
        if raw.checkpoint.restore_timeout_secs == 0 {
            return Err(CradleError::Validation(ValidationError::InvalidFieldValue {
                field: "checkpoint.restore_timeout_secs",
                value: "0".to_string(),
                reason: "timeout must be non-zero".to_string(),
            }));
        }

        Ok(Self {
            checkpoint_base_dir: PathBuf::from(raw.checkpoint.base_dir),
            engine_binary: raw.checkpoint.engine_binary.map(PathBuf::from),
            dump_timeout: Duration::from_secs(raw.checkpoint.dump_timeout_secs),
            restore_timeout: Duration::from_secs(raw.checkpoint.restore_timeout_secs),
            freeze_timeout: Duration::from_secs(raw.checkpoint.freeze_timeout_secs),
            plugin_dir: PathBuf::from(raw.plugins.dir),
            gpu_signal_checkpoint: raw.gpu.signal_checkpoint,
            gpu_checkpoint_signal: raw.gpu.checkpoint_signal,
            gpu_await_timeout: Duration::from_secs(raw.gpu.await_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.dump_timeout, Duration::from_secs(300));
        assert_eq!(config.freeze_timeout, Duration::from_secs(60));
        assert!(!config.gpu_signal_checkpoint);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = DaemonConfig::load("/nonexistent/cradle.yaml").unwrap();
        assert_eq!(config.restore_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_load_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "checkpoint:\n  base_dir: /tmp/ckpts\n  dump_timeout_secs: 10\ngpu:\n  signal_checkpoint: true"
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.checkpoint_base_dir, PathBuf::from("/tmp/ckpts"));
        assert_eq!(config.dump_timeout, Duration::from_secs(10));
        assert!(config.gpu_signal_checkpoint);
        // Unspecified values keep defaults
        assert_eq!(config.freeze_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "checkpoint:\n  dump_timeout_secs: 0\n").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }
}
