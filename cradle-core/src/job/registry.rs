//! Thread-safe job registry using DashMap.
//!
//! All job mutation goes through this registry; no other component
//! mutates job state directly. Writes to a single job are serialized by
//! the per-key shard lock, and the compare-and-set `transition` is how
//! concurrent operations on the same JID exclude each other: the loser of
//! the race observes a state it did not expect and gets a conflict error.

use dashmap::DashMap;

use crate::error::{CradleError, CradleResult, StateTransitionError};
use crate::types::{Jid, JobKind};

use super::state::{JobState, JobStateMachine};
use super::{Checkpoint, Job};

#[derive(Debug)]
struct JobEntry {
    job: Job,
    machine: JobStateMachine,
}

/// Registry of all managed jobs.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<Jid, JobEntry>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job. Fails if the JID already exists.
    pub fn create(&self, job: Job) -> CradleResult<()> {
        let jid = job.jid.clone();
        // entry() holds the shard lock across the vacancy check, so two
        // concurrent creates for one JID cannot both succeed.
        match self.jobs.entry(jid.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CradleError::JobAlreadyExists { jid })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                // Jobs may arrive mid-lifecycle (attached to a live
                // process, or rehydrated from persisted metadata).
                let machine = JobStateMachine::with_state(jid, job.state);
                slot.insert(JobEntry { job, machine });
                Ok(())
            }
        }
    }

    pub fn get(&self, jid: &Jid) -> Option<Job> {
        self.jobs.get(jid).map(|e| e.job.clone())
    }

    pub fn exists(&self, jid: &Jid) -> bool {
        self.jobs.contains_key(jid)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// List jobs, optionally restricted to one kind.
    pub fn list(&self, kind: Option<JobKind>) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|e| kind.map_or(true, |k| e.job.kind == k))
            .map(|e| e.job.clone())
            .collect()
    }

    /// Find the job currently attached to `pid`.
    pub fn find_by_pid(&self, pid: u32) -> Option<Job> {
        if pid == 0 {
            return None;
        }
        self.jobs
            .iter()
            .find(|e| e.job.pid == pid)
            .map(|e| e.job.clone())
    }

    /// Optimistic-concurrency transition: succeeds only when the job is
    /// currently in `expected`. Two concurrent operations racing on the
    /// same job cannot both pass this gate.
    pub fn transition(&self, jid: &Jid, expected: JobState, new: JobState) -> CradleResult<()> {
        let mut entry = self
            .jobs
            .get_mut(jid)
            .ok_or_else(|| CradleError::JobNotFound { jid: jid.clone() })?;

        let actual = entry.machine.state();
        if actual != expected {
            return Err(StateTransitionError::Conflict {
                jid: jid.clone(),
                expected,
                actual,
            }
            .into());
        }

        entry.machine.transition_to(new)?;
        entry.job.state = new;
        Ok(())
    }

    /// Current state of a job.
    pub fn state(&self, jid: &Jid) -> CradleResult<JobState> {
        self.jobs
            .get(jid)
            .map(|e| e.machine.state())
            .ok_or_else(|| CradleError::JobNotFound { jid: jid.clone() })
    }

    /// Mutate a job's non-state fields under the per-job write lock.
    pub fn update(&self, jid: &Jid, f: impl FnOnce(&mut Job)) -> CradleResult<()> {
        let mut entry = self
            .jobs
            .get_mut(jid)
            .ok_or_else(|| CradleError::JobNotFound { jid: jid.clone() })?;
        f(&mut entry.job);
        Ok(())
    }

    /// Record a successful checkpoint and make it the job's current
    /// checkpoint path.
    pub fn add_checkpoint(&self, jid: &Jid, path: std::path::PathBuf) -> CradleResult<()> {
        self.update(jid, |job| {
            let id = format!("{}-{}", jid, job.checkpoints.len() + 1);
            job.checkpoint_path = Some(path.clone());
            job.checkpoints.push(Checkpoint {
                id,
                path,
                created_at: std::time::SystemTime::now(),
            });
        })
    }

    /// Remove a job. Fails while an operation is in flight for it.
    pub fn delete(&self, jid: &Jid) -> CradleResult<()> {
        // remove_if holds the shard lock across the check, so an
        // in-flight transition cannot interleave with the delete.
        let removed = self
            .jobs
            .remove_if(jid, |_, e| e.machine.state().is_deletable());

        match removed {
            Some(_) => Ok(()),
            None => {
                let state = self.state(jid)?;
                Err(StateTransitionError::NotDeletable {
                    jid: jid.clone(),
                    state: state.name(),
                }
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make_job(jid: &str) -> Job {
        Job::new(Jid::new(jid).unwrap(), JobKind::Process)
    }

    #[test]
    fn test_create_and_get() {
        let registry = JobRegistry::new();
        registry.create(make_job("j1")).unwrap();

        let jid = Jid::new("j1").unwrap();
        assert!(registry.exists(&jid));
        assert_eq!(registry.get(&jid).unwrap().state, JobState::Pending);
    }

    #[test]
    fn test_duplicate_create_fails() {
        let registry = JobRegistry::new();
        registry.create(make_job("j1")).unwrap();
        assert!(matches!(
            registry.create(make_job("j1")),
            Err(CradleError::JobAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_transition_conflict_on_stale_expectation() {
        let registry = JobRegistry::new();
        registry.create(make_job("j1")).unwrap();
        let jid = Jid::new("j1").unwrap();

        registry
            .transition(&jid, JobState::Pending, JobState::Running)
            .unwrap();
        registry
            .transition(&jid, JobState::Running, JobState::Checkpointing)
            .unwrap();

        // A second dump expecting Running now conflicts.
        let err = registry
            .transition(&jid, JobState::Running, JobState::Checkpointing)
            .unwrap_err();
        assert!(matches!(
            err,
            CradleError::Transition(StateTransitionError::Conflict { .. })
        ));
    }

    #[test]
    fn test_only_one_concurrent_transition_wins() {
        let registry = Arc::new(JobRegistry::new());
        let mut job = make_job("j1");
        job.state = JobState::Running;
        registry.create(job).unwrap();
        let jid = Jid::new("j1").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let jid = jid.clone();
                std::thread::spawn(move || {
                    registry
                        .transition(&jid, JobState::Running, JobState::Checkpointing)
                        .is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(registry.state(&jid).unwrap(), JobState::Checkpointing);
    }

    #[test]
    fn test_delete_blocked_in_flight() {
        let registry = JobRegistry::new();
        let mut job = make_job("j1");
        job.state = JobState::Running;
        registry.create(job).unwrap();
        let jid = Jid::new("j1").unwrap();

        registry
            .transition(&jid, JobState::Running, JobState::Checkpointing)
            .unwrap();
        assert!(registry.delete(&jid).is_err());

        registry
            .transition(&jid, JobState::Checkpointing, JobState::Checkpointed)
            .unwrap();
        registry.delete(&jid).unwrap();
        assert!(!registry.exists(&jid));
    }

    #[test]
    fn test_checkpoint_history() {
        let registry = JobRegistry::new();
        registry.create(make_job("j1")).unwrap();
        let jid = Jid::new("j1").unwrap();

        registry
            .add_checkpoint(&jid, "/tmp/ckpt-1".into())
            .unwrap();
        registry
            .add_checkpoint(&jid, "/tmp/ckpt-2".into())
            .unwrap();

        let job = registry.get(&jid).unwrap();
        assert_eq!(job.checkpoints.len(), 2);
        assert_eq!(
            job.latest_checkpoint().unwrap().path,
            std::path::PathBuf::from("/tmp/ckpt-2")
        );
        assert_eq!(job.checkpoint_path, Some("/tmp/ckpt-2".into()));
    }

    #[test]
    fn test_find_by_pid() {
        let registry = JobRegistry::new();
        registry.create(make_job("j1")).unwrap();
        let jid = Jid::new("j1").unwrap();
        registry.update(&jid, |job| job.pid = 4321).unwrap();

        assert_eq!(registry.find_by_pid(4321).unwrap().jid, jid);
        assert!(registry.find_by_pid(9999).is_none());
        // PID 0 means "no process attached", never a match.
        assert!(registry.find_by_pid(0).is_none());
    }

    #[test]
    fn test_list_by_kind() {
        let registry = JobRegistry::new();
        registry.create(make_job("p1")).unwrap();
        registry
            .create(Job::new(Jid::new("r1").unwrap(), JobKind::Runc))
            .unwrap();

        assert_eq!(registry.list(None).len(), 2);
        assert_eq!(registry.list(Some(JobKind::Runc)).len(), 1);
    }
}
