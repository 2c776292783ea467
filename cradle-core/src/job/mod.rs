//! Job tracking: the record, the lifecycle state machine, and the
//! concurrency-safe registry that is the single source of truth for job
//! existence and state.

pub mod registry;
pub mod state;

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::{Jid, JobDetails, JobKind};

use state::JobState;

/// One successful checkpoint of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub path: PathBuf,
    pub created_at: SystemTime,
}

/// The unit of management: a process, container, VM, or batch job tracked
/// by JID across its lifecycle. JID and kind are immutable once assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub jid: Jid,
    pub kind: JobKind,
    pub state: JobState,
    /// Current PID; 0 if not running.
    pub pid: u32,
    pub gpu_enabled: bool,
    /// Last successful checkpoint location, if any.
    pub checkpoint_path: Option<PathBuf>,
    pub details: Option<JobDetails>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Exit code observed when the managed process terminated.
    pub exit_code: Option<i32>,
}

impl Job {
    pub fn new(jid: Jid, kind: JobKind) -> Self {
        Self {
            jid,
            kind,
            state: JobState::Pending,
            pid: 0,
            gpu_enabled: false,
            checkpoint_path: None,
            details: None,
            checkpoints: Vec::new(),
            exit_code: None,
        }
    }

    /// Latest successful checkpoint, if any.
    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }
}
