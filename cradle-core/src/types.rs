//! Core identifier and job-kind types.
//!
//! Following the "Newtype" pattern: validated at construction time so the
//! rest of the crate can assume well-formed values.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Validated job identifier.
/// Must be non-empty, alphanumeric with hyphens/underscores, max 64 chars.
/// Immutable once assigned to a job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid(String);

impl Jid {
    /// Create a new Jid with validation.
    pub fn new(jid: impl Into<String>) -> Result<Self, ValidationError> {
        let jid = jid.into();

        if jid.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "jid",
                value: jid,
                reason: "JID cannot be empty".to_string(),
            });
        }

        if jid.len() > 64 {
            return Err(ValidationError::InvalidFieldValue {
                field: "jid",
                value: jid.clone(),
                reason: format!("JID too long: {} chars (max 64)", jid.len()),
            });
        }

        if !jid
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidFieldValue {
                field: "jid",
                value: jid,
                reason: "JID must contain only alphanumeric characters, hyphens, and underscores"
                    .to_string(),
            });
        }

        Ok(Self(jid))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Jid {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.0
    }
}

/// The kind of entity a job manages. Selects the middleware chain and the
/// terminal handler for every operation on the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Bare OS process, checkpointed directly by the engine.
    Process,
    /// runc container.
    Runc,
    /// containerd container.
    Containerd,
    /// CRI-O container.
    Crio,
    /// Kata / cloud-hypervisor VM.
    Kata,
    /// Slurm batch job.
    Slurm,
}

impl JobKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Runc => "runc",
            Self::Containerd => "containerd",
            Self::Crio => "crio",
            Self::Kata => "kata",
            Self::Slurm => "slurm",
        }
    }

    /// Plugin name that implements this kind, if any. The `process` kind
    /// is built in and needs no plugin.
    pub const fn plugin_name(&self) -> Option<&'static str> {
        match self {
            Self::Process => None,
            Self::Runc => Some("runc"),
            Self::Containerd => Some("containerd"),
            Self::Crio => Some("crio"),
            Self::Kata => Some("kata"),
            Self::Slurm => Some("slurm"),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(Self::Process),
            "runc" => Ok(Self::Runc),
            "containerd" => Ok(Self::Containerd),
            "crio" => Ok(Self::Crio),
            "kata" => Ok(Self::Kata),
            "slurm" => Ok(Self::Slurm),
            other => Err(ValidationError::UnknownJobKind {
                value: other.to_string(),
            }),
        }
    }
}

/// Kind-specific request details. A tagged union with one case per job
/// kind; a mismatch between the variant and the request's declared kind is
/// a validation error, enforced once, early in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobDetails {
    Process {
        pid: u32,
    },
    Runc {
        id: String,
        /// runc root directory (e.g. /run/runc).
        root: PathBuf,
        bundle: Option<PathBuf>,
    },
    Containerd {
        namespace: String,
        id: String,
    },
    Crio {
        id: String,
    },
    Kata {
        vm_id: String,
        /// Hypervisor API socket path.
        vm_socket: PathBuf,
    },
    Slurm {
        slurm_job_id: u32,
    },
}

impl JobDetails {
    pub const fn kind(&self) -> JobKind {
        match self {
            Self::Process { .. } => JobKind::Process,
            Self::Runc { .. } => JobKind::Runc,
            Self::Containerd { .. } => JobKind::Containerd,
            Self::Crio { .. } => JobKind::Crio,
            Self::Kata { .. } => JobKind::Kata,
            Self::Slurm { .. } => JobKind::Slurm,
        }
    }

    /// Validate that this variant matches the declared kind.
    pub fn check_kind(&self, kind: JobKind) -> Result<(), ValidationError> {
        if self.kind() == kind {
            Ok(())
        } else {
            Err(ValidationError::KindMismatch {
                kind: kind.as_str(),
                details: self.kind().as_str(),
            })
        }
    }
}

/// Snapshot of a managed process, captured at dump time and persisted as
/// `process_state.json` inside the checkpoint directory. Restore reads it
/// back to learn the dumped PID, GPU attachment, and which externally-held
/// file descriptors must be re-injected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessState {
    pub pid: u32,
    /// Session id at dump time; SID != PID marks a shell job.
    pub sid: u32,
    pub gpu_enabled: bool,
    pub gpu_id: Option<String>,
    /// Keys into the daemon's FD store for network descriptors that were
    /// held externally at dump time and must be re-injected on restore.
    #[serde(default)]
    pub ext_fd_keys: Vec<String>,
}

/// Filename of the process state file inside a checkpoint directory.
pub const STATE_FILE: &str = "process_state.json";
