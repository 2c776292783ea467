//! Custom error types for Cradle.
//!
//! All errors are explicit enum variants - no `Box<dyn Error>`, no
//! `anyhow::Result`. The taxonomy is what the transport layer maps to
//! status codes, so variants are grouped by how a caller should react:
//! validation errors are never retried, conflicts can be polled and
//! retried, permission errors carry an actionable hint, and engine
//! failures are terminal for the attempt.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::job::state::JobState;
use crate::types::Jid;

/// Top-level error type for the Cradle orchestrator.
#[derive(Debug, Error)]
pub enum CradleError {
    // =========================================================================
    // Validation - malformed/incomplete request, never retried
    // =========================================================================
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Job registry & state machine
    // =========================================================================
    #[error("Job not found: {jid}")]
    JobNotFound { jid: Jid },

    #[error("Job already exists: {jid}")]
    JobAlreadyExists { jid: Jid },

    #[error("Invalid state transition: {0}")]
    Transition(#[from] StateTransitionError),

    // =========================================================================
    // Preconditions - conflict/failed-precondition class, caller may poll
    // =========================================================================
    #[error("Failed precondition for job {jid}: {reason}")]
    FailedPrecondition { jid: Jid, reason: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    // =========================================================================
    // Checkpoint engine & process control
    // =========================================================================
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Deadline expiry is distinct from an engine-reported failure: the
    /// former is retryable once the job state has been re-queried, the
    /// latter is not.
    #[error("Operation '{operation}' exceeded deadline of {timeout:?}")]
    DeadlineExceeded {
        operation: &'static str,
        timeout: Duration,
    },

    // =========================================================================
    // Transient/infrastructure - retried with a bounded budget
    // =========================================================================
    #[error("Unavailable: {reason}")]
    Unavailable { reason: String },

    // =========================================================================
    // System
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl CradleError {
    /// Whether the orchestration boundary may retry this error with
    /// backoff before surfacing it. Only transient infrastructure
    /// failures qualify; engine failures are not idempotent against
    /// partial on-disk state.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Request validation errors. Always local to the caller.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingField {
        field: &'static str,
        context: &'static str,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Unknown job kind: {value}")]
    UnknownJobKind { value: String },

    #[error("Details do not match job kind {kind}: got {details}")]
    KindMismatch {
        kind: &'static str,
        details: &'static str,
    },

    #[error("Unrecognized plugin name: {name}")]
    UnrecognizedPlugin { name: String },
}

/// State transition errors for the job state machine.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition job {jid} from {from} to {to}")]
    InvalidTransition {
        jid: Jid,
        from: &'static str,
        to: &'static str,
    },

    /// The optimistic-concurrency check failed: another operation is in
    /// flight or has already changed the job's state.
    #[error("Job {jid} is in state {actual}, expected {expected}")]
    Conflict {
        jid: Jid,
        expected: JobState,
        actual: JobState,
    },

    #[error("Job {jid} is in state {state} and cannot be deleted")]
    NotDeletable { jid: Jid, state: &'static str },
}

/// Checkpoint engine errors. Permission failures are classified apart
/// from generic failures because the former is actionable by the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Checkpoint engine binary not found")]
    BinaryNotFound,

    #[error("Engine reported a privilege failure during {operation}: {reason} (try re-running the daemon as root)")]
    Permission { operation: &'static str, reason: String },

    #[error("Engine dump failed: {reason}")]
    DumpFailed { reason: String },

    #[error("Engine restore failed: {reason}")]
    RestoreFailed { reason: String },

    #[error("Checkpoint directory already exists: {path}")]
    ImagesDirExists { path: PathBuf },

    #[error("Checkpoint metadata missing or unreadable at {path}: {reason}")]
    BadMetadata { path: PathBuf, reason: String },
}

/// OS process control errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("No such process: {pid}")]
    NotFound { pid: u32 },

    #[error("Permission denied signaling process {pid}")]
    PermissionDenied { pid: u32 },

    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    #[error("Failed to spawn process: {reason}")]
    SpawnFailed { reason: String },
}

/// Result type alias using CradleError.
pub type CradleResult<T> = Result<T, CradleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_error_carries_hint() {
        let err = EngineError::Permission {
            operation: "dump",
            reason: "CAP_SYS_ADMIN required".to_string(),
        };
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn test_error_chain() {
        let engine_err = EngineError::DumpFailed {
            reason: "image write failed".to_string(),
        };
        let err: CradleError = engine_err.into();
        assert!(matches!(err, CradleError::Engine(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        let err = CradleError::Unavailable {
            reason: "plugin load failure".to_string(),
        };
        assert!(err.is_transient());
    }
}
