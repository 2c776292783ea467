//! Job lifecycle state machine.
//!
//! Pending → Running ⇄ Frozen → Checkpointing → {Checkpointed, Failed},
//! with Restoring between a checkpoint and a running process again, and
//! Killed as the terminal state. Invalid transitions produce
//! StateTransitionError; the registry's compare-and-set on top of this is
//! what serializes concurrent operations on one job.

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::Jid;

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Registered, process not yet started.
    Pending,
    /// Process attached and live.
    Running,
    /// Process paused (signal or cgroup freeze), not yet captured.
    Frozen,
    /// Checkpoint engine invocation in flight.
    Checkpointing,
    /// Last checkpoint succeeded.
    Checkpointed,
    /// Restore invocation in flight.
    Restoring,
    /// The triggering operation failed; the job may still be queried and
    /// retried from its last checkpoint.
    Failed,
    /// Process signaled and reaped. Terminal.
    Killed,
}

impl JobState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Frozen => "Frozen",
            Self::Checkpointing => "Checkpointing",
            Self::Checkpointed => "Checkpointed",
            Self::Restoring => "Restoring",
            Self::Failed => "Failed",
            Self::Killed => "Killed",
        }
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        matches!(
            (self, target),
            // From Pending
            (Self::Pending, Self::Running) |
            (Self::Pending, Self::Failed) |
            (Self::Pending, Self::Killed) |
            // From Running
            (Self::Running, Self::Frozen) |
            (Self::Running, Self::Checkpointing) |
            (Self::Running, Self::Restoring) |
            (Self::Running, Self::Failed) |
            (Self::Running, Self::Killed) |
            // From Frozen
            (Self::Frozen, Self::Running) |
            (Self::Frozen, Self::Checkpointing) |
            (Self::Frozen, Self::Failed) |
            (Self::Frozen, Self::Killed) |
            // From Checkpointing
            (Self::Checkpointing, Self::Checkpointed) |
            (Self::Checkpointing, Self::Failed) |
            // From Checkpointed (leave-running dumps go back to Running)
            (Self::Checkpointed, Self::Running) |
            (Self::Checkpointed, Self::Restoring) |
            (Self::Checkpointed, Self::Checkpointing) |
            (Self::Checkpointed, Self::Failed) |
            (Self::Checkpointed, Self::Killed) |
            // From Restoring
            (Self::Restoring, Self::Running) |
            (Self::Restoring, Self::Failed) |
            // From Failed (retry from the last checkpoint)
            (Self::Failed, Self::Restoring) |
            (Self::Failed, Self::Checkpointing) |
            (Self::Failed, Self::Killed)
        )
    }

    /// Whether an operation is currently in flight for the job.
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Checkpointing | Self::Restoring)
    }

    /// States a job may be deleted from. A job mid-checkpoint or
    /// mid-restore must finish (or fail) first.
    pub const fn is_deletable(&self) -> bool {
        !self.is_in_flight()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for a single job. Enforces valid transitions and keeps a
/// transition count for observability.
#[derive(Debug, Clone)]
pub struct JobStateMachine {
    jid: Jid,
    current: JobState,
    transitions: u64,
}

impl JobStateMachine {
    pub fn new(jid: Jid) -> Self {
        Self {
            jid,
            current: JobState::Pending,
            transitions: 0,
        }
    }

    /// Rehydrate a machine at a known state, e.g. from persisted job
    /// metadata. No transition is recorded.
    pub fn with_state(jid: Jid, state: JobState) -> Self {
        Self {
            jid,
            current: state,
            transitions: 0,
        }
    }

    pub fn state(&self) -> JobState {
        self.current
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    pub fn transition_to(&mut self, target: JobState) -> Result<(), StateTransitionError> {
        if !self.current.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                jid: self.jid.clone(),
                from: self.current.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            jid = %self.jid,
            from = self.current.name(),
            to = target.name(),
            "state transition"
        );

        self.current = target;
        self.transitions += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid() -> Jid {
        Jid::new("test-job").unwrap()
    }

    #[test]
    fn test_initial_state() {
        let sm = JobStateMachine::new(jid());
        assert_eq!(sm.state(), JobState::Pending);
        assert_eq!(sm.transitions(), 0);
    }

    #[test]
    fn test_dump_path() {
        let mut sm = JobStateMachine::new(jid());
        sm.transition_to(JobState::Running).unwrap();
        sm.transition_to(JobState::Checkpointing).unwrap();
        sm.transition_to(JobState::Checkpointed).unwrap();
        assert_eq!(sm.state(), JobState::Checkpointed);
        assert_eq!(sm.transitions(), 3);
    }

    #[test]
    fn test_freeze_then_dump_path() {
        let mut sm = JobStateMachine::new(jid());
        sm.transition_to(JobState::Running).unwrap();
        sm.transition_to(JobState::Frozen).unwrap();
        sm.transition_to(JobState::Running).unwrap();
        sm.transition_to(JobState::Frozen).unwrap();
        sm.transition_to(JobState::Checkpointing).unwrap();
        sm.transition_to(JobState::Failed).unwrap();
    }

    #[test]
    fn test_checkpointing_never_directly_restoring() {
        let mut sm = JobStateMachine::new(jid());
        sm.transition_to(JobState::Running).unwrap();
        sm.transition_to(JobState::Checkpointing).unwrap();
        assert!(sm.transition_to(JobState::Restoring).is_err());
        assert_eq!(sm.state(), JobState::Checkpointing);
    }

    #[test]
    fn test_killed_is_terminal() {
        let mut sm = JobStateMachine::new(jid());
        sm.transition_to(JobState::Running).unwrap();
        sm.transition_to(JobState::Killed).unwrap();
        for target in [
            JobState::Pending,
            JobState::Running,
            JobState::Checkpointing,
            JobState::Restoring,
            JobState::Failed,
        ] {
            assert!(sm.clone().transition_to(target).is_err());
        }
    }

    #[test]
    fn test_deletable() {
        assert!(JobState::Pending.is_deletable());
        assert!(JobState::Failed.is_deletable());
        assert!(!JobState::Checkpointing.is_deletable());
        assert!(!JobState::Restoring.is_deletable());
    }
}
