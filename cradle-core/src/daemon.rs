//! The orchestration facade.
//!
//! Assembles per-kind pipelines, serializes operations through the job
//! registry's optimistic transitions, applies operation-class deadlines,
//! retries transient failures with a small fixed budget, and publishes
//! pre/post-dump events to attached subscribers. Every operation gates on
//! a state transition before any side effect, so two concurrent requests
//! against one job can never both proceed.

use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::broadcast::Broadcaster;
use crate::config::DaemonConfig;
use crate::engine::{CheckpointEngine, EngineAdapter, EngineOpts, FdStore};
use crate::error::{CradleError, CradleResult, EngineError, ProcessError, ValidationError};
use crate::features;
use crate::job::registry::JobRegistry;
use crate::job::state::JobState;
use crate::job::Job;
use crate::pipeline::{
    self, DumpRequest, DumpResponse, Opts, RestoreRequest, RestoreResponse, RunRequest,
    RunResponse,
};
use crate::plugins::PluginRegistry;
use crate::process::{self, ExitWaiter};
use crate::storage::Store;
use crate::types::{Jid, JobDetails, JobKind};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

const JOB_KEY_PREFIX: &str = "job/";

fn job_key(jid: &Jid) -> String {
    format!("{JOB_KEY_PREFIX}{jid}")
}

/// Events published around every dump attempt. Delivery is best-effort
/// (see [`Broadcaster`]); subscribers are progress observers, not
/// participants.
#[derive(Debug, Clone)]
pub enum DumpEvent {
    PreDump {
        jid: Jid,
        dir: PathBuf,
    },
    PostDump {
        jid: Jid,
        dir: PathBuf,
        success: bool,
    },
}

/// Checkpoint/restore orchestrator.
pub struct Daemon {
    registry: Arc<JobRegistry>,
    plugins: Arc<PluginRegistry>,
    engine: Arc<EngineAdapter>,
    fd_store: Arc<FdStore>,
    config: Arc<DaemonConfig>,
    store: Arc<dyn Store>,
    dump_events: Broadcaster<DumpEvent>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        engine: Arc<dyn CheckpointEngine>,
        store: Arc<dyn Store>,
    ) -> CradleResult<Self> {
        let config = Arc::new(config);
        let daemon = Self {
            registry: Arc::new(JobRegistry::new()),
            plugins: Arc::new(PluginRegistry::new()),
            engine: Arc::new(EngineAdapter::new(engine, Arc::clone(&config))),
            fd_store: Arc::new(FdStore::new()),
            config,
            store,
            dump_events: Broadcaster::new(),
        };
        daemon.load_jobs()?;
        Ok(daemon)
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn fd_store(&self) -> &FdStore {
        &self.fd_store
    }

    /// Subscribe to pre/post-dump events.
    pub fn subscribe_dump_events(&self) -> Receiver<DumpEvent> {
        self.dump_events.attach()
    }

    /// Stop publishing events. Existing subscribers drain and see
    /// end-of-stream; later subscribers get an empty, closed stream.
    pub fn shutdown(&self) {
        self.dump_events.close();
    }

    // =====================================================================
    // Job lifecycle operations
    // =====================================================================

    /// Start a new managed job.
    pub fn run(&self, req: RunRequest) -> CradleResult<Job> {
        let jid = req.jid.clone().ok_or(CradleError::Validation(
            ValidationError::MissingField {
                field: "jid",
                context: "run request",
            },
        ))?;

        let mut job = Job::new(jid.clone(), req.kind);
        job.gpu_enabled = req.gpu_enabled;
        job.details = req.details.clone();
        self.registry.create(job)?;

        let chain = match retry_transient(|| pipeline::run::pipeline(req.kind, &self.plugins)) {
            Ok(chain) => chain,
            Err(e) => {
                self.fail(&jid, JobState::Pending);
                return Err(e);
            }
        };

        let mut opts = self.op_opts();
        let mut req = req;
        let mut resp = RunResponse::default();
        match chain(&mut opts, &mut resp, &mut req) {
            Ok(waiter) => {
                if let Err(e) = self
                    .registry
                    .transition(&jid, JobState::Pending, JobState::Running)
                {
                    // A concurrent kill or delete won the gate; the fresh
                    // process must not outlive the job record.
                    reap_unmanaged(&jid, resp.pid, waiter);
                    return Err(e);
                }
                self.registry.update(&jid, |j| {
                    j.pid = resp.pid;
                    if j.details.is_none() && j.kind == JobKind::Process {
                        j.details = Some(JobDetails::Process { pid: resp.pid });
                    }
                })?;
                self.persist(&jid)?;
                if let Some(waiter) = waiter {
                    self.monitor_exit(jid.clone(), waiter);
                }
                self.get(&jid)
            }
            Err(e) => {
                self.fail(&jid, JobState::Pending);
                Err(e)
            }
        }
    }

    /// Adopt an already-running entity as a managed job.
    pub fn manage(&self, jid: Jid, details: JobDetails, gpu_enabled: bool) -> CradleResult<Job> {
        let kind = details.kind();
        let pid = match &details {
            JobDetails::Process { pid } => *pid,
            _ => 0,
        };
        if kind == JobKind::Process && !process::exists(pid) {
            return Err(ProcessError::NotFound { pid }.into());
        }

        let mut job = Job::new(jid.clone(), kind);
        job.state = JobState::Running;
        job.pid = pid;
        job.gpu_enabled = gpu_enabled;
        job.details = Some(details);
        self.registry.create(job)?;
        self.persist(&jid)?;

        if pid != 0 {
            self.monitor_exit(jid.clone(), process::wait_for_exit(pid));
        }
        tracing::info!(jid = %jid, kind = %kind, pid, "job managed");
        self.get(&jid)
    }

    /// Checkpoint a job. `dir` overrides the configured base directory;
    /// `leave_running` keeps the process alive after a successful dump.
    pub fn dump(
        &self,
        jid: &Jid,
        dir: Option<PathBuf>,
        leave_running: bool,
    ) -> CradleResult<DumpResponse> {
        let job = self.get(jid)?;

        // Gate before any side effect: the loser of a concurrent dump race
        // observes a state it did not expect.
        self.registry
            .transition(jid, job.state, JobState::Checkpointing)?;

        let chain = match retry_transient(|| pipeline::dump::pipeline(job.kind, &self.plugins)) {
            Ok(chain) => chain,
            Err(e) => {
                self.fail(jid, JobState::Checkpointing);
                return Err(e);
            }
        };

        let mut opts = self.op_opts();
        {
            let events = self.dump_events.clone();
            let hook_jid = jid.clone();
            opts.hooks.pre_dump(move |dir| {
                events.publish(DumpEvent::PreDump {
                    jid: hook_jid.clone(),
                    dir: dir.to_path_buf(),
                });
                Ok(())
            });
        }
        {
            let events = self.dump_events.clone();
            let hook_jid = jid.clone();
            opts.hooks.post_dump(move |dir, success| {
                events.publish(DumpEvent::PostDump {
                    jid: hook_jid.clone(),
                    dir: dir.to_path_buf(),
                    success,
                });
                Ok(())
            });
        }

        let mut req = DumpRequest {
            jid: Some(jid.clone()),
            kind: job.kind,
            details: Self::job_details(&job),
            dir: dir.unwrap_or_default(),
            name: String::new(),
            gpu_enabled: job.gpu_enabled,
            engine: EngineOpts {
                leave_running,
                ..Default::default()
            },
        };

        let outcome = run_with_deadline("dump", self.config.dump_timeout, move || {
            let mut resp = DumpResponse::default();
            let result = chain(&mut opts, &mut resp, &mut req);
            (result, resp)
        });
        let (result, resp) = match outcome {
            Ok(pair) => pair,
            Err(e) => (Err(e), DumpResponse::default()),
        };

        match result {
            Ok(_) => {
                // Checkpointed without a recorded path would be a job that
                // can never restore; a handler reporting success while
                // producing nothing is a failed dump.
                let Some(path) = resp.paths.last() else {
                    self.fail(jid, JobState::Checkpointing);
                    return Err(EngineError::DumpFailed {
                        reason: "dump reported success without a checkpoint path".to_string(),
                    }
                    .into());
                };
                self.registry.add_checkpoint(jid, path.clone())?;
                self.registry
                    .transition(jid, JobState::Checkpointing, JobState::Checkpointed)?;
                if leave_running {
                    self.registry
                        .transition(jid, JobState::Checkpointed, JobState::Running)?;
                } else if job.kind == JobKind::Process {
                    // The engine reaps the dumped process unless asked to
                    // leave it running.
                    self.registry.update(jid, |j| j.pid = 0)?;
                }
                self.persist(jid)?;
                tracing::info!(jid = %jid, paths = resp.paths.len(), "dump succeeded");
                Ok(resp)
            }
            Err(e) => {
                self.fail(jid, JobState::Checkpointing);
                Err(e)
            }
        }
    }

    /// Restore a job from a checkpoint. With no explicit `path` the job's
    /// latest checkpoint is used.
    pub fn restore(&self, jid: &Jid, path: Option<PathBuf>) -> CradleResult<RestoreResponse> {
        let job = self.get(jid)?;
        let path = match path.or_else(|| job.latest_checkpoint().map(|c| c.path.clone())) {
            Some(path) => path,
            None => {
                return Err(CradleError::FailedPrecondition {
                    jid: jid.clone(),
                    reason: "no checkpoint to restore from".to_string(),
                })
            }
        };

        self.registry
            .transition(jid, job.state, JobState::Restoring)?;

        let chain = match retry_transient(|| pipeline::restore::pipeline(job.kind, &self.plugins))
        {
            Ok(chain) => chain,
            Err(e) => {
                self.fail(jid, JobState::Restoring);
                return Err(e);
            }
        };

        let mut opts = self.op_opts();
        let mut req = RestoreRequest {
            jid: Some(jid.clone()),
            kind: job.kind,
            details: job.details.clone(),
            path: Some(path),
            engine: EngineOpts::default(),
        };

        let outcome = run_with_deadline("restore", self.config.restore_timeout, move || {
            let mut resp = RestoreResponse::default();
            let result = chain(&mut opts, &mut resp, &mut req);
            (result, resp)
        });
        let (result, resp) = match outcome {
            Ok(pair) => pair,
            Err(e) => (Err(e), RestoreResponse::default()),
        };

        match result {
            Ok(waiter) => {
                self.registry
                    .transition(jid, JobState::Restoring, JobState::Running)?;
                self.registry.update(jid, |j| {
                    j.pid = resp.pid;
                    j.exit_code = None;
                })?;
                self.persist(jid)?;
                if let Some(waiter) = waiter {
                    self.monitor_exit(jid.clone(), waiter);
                }
                tracing::info!(jid = %jid, pid = resp.pid, "restore succeeded");
                Ok(resp)
            }
            Err(e) => {
                self.fail(jid, JobState::Restoring);
                Err(e)
            }
        }
    }

    /// Pause a running job.
    pub fn freeze(&self, jid: &Jid) -> CradleResult<()> {
        self.freeze_impl(jid, true)
    }

    /// Resume a frozen job.
    pub fn unfreeze(&self, jid: &Jid) -> CradleResult<()> {
        self.freeze_impl(jid, false)
    }

    fn freeze_impl(&self, jid: &Jid, freeze: bool) -> CradleResult<()> {
        let job = self.get(jid)?;
        let (from, to) = if freeze {
            (JobState::Running, JobState::Frozen)
        } else {
            (JobState::Frozen, JobState::Running)
        };
        self.registry.transition(jid, from, to)?;

        let operation: &'static str = if freeze { "freeze" } else { "unfreeze" };
        let built = retry_transient(|| {
            if freeze {
                pipeline::freeze::freeze_pipeline(job.kind, &self.plugins)
            } else {
                pipeline::freeze::unfreeze_pipeline(job.kind, &self.plugins)
            }
        });
        let chain = match built {
            Ok(chain) => chain,
            Err(e) => {
                self.revert(jid, to, from);
                return Err(e);
            }
        };

        let mut opts = self.op_opts();
        let mut req = DumpRequest {
            jid: Some(jid.clone()),
            kind: job.kind,
            details: Self::job_details(&job),
            ..Default::default()
        };
        let outcome = run_with_deadline(operation, self.config.freeze_timeout, move || {
            let mut resp = DumpResponse::default();
            chain(&mut opts, &mut resp, &mut req).map(|_| ())
        });

        match outcome.and_then(|inner| inner) {
            Ok(()) => {
                self.persist(jid)?;
                Ok(())
            }
            Err(e) => {
                self.revert(jid, to, from);
                Err(e)
            }
        }
    }

    /// Terminate a job's process. The job's plugin may substitute a
    /// gentler signal for SIGKILL.
    pub fn kill(&self, jid: &Jid) -> CradleResult<()> {
        let job = self.get(jid)?;
        if !job.state.can_transition_to(JobState::Killed) {
            return Err(CradleError::FailedPrecondition {
                jid: jid.clone(),
                reason: format!("cannot kill a job in state {}", job.state),
            });
        }

        let sig = job
            .kind
            .plugin_name()
            .and_then(|plugin| self.plugins.lookup(plugin, &features::KILL_SIGNAL))
            .and_then(|raw| Signal::try_from(raw).ok())
            .unwrap_or(Signal::SIGKILL);

        if job.pid != 0 && process::exists(job.pid) {
            process::signal(job.pid, sig)?;
            tracing::info!(jid = %jid, pid = job.pid, signal = %sig, "job signaled");
        }

        self.registry.transition(jid, job.state, JobState::Killed)?;
        self.registry.update(jid, |j| j.pid = 0)?;
        self.persist(jid)
    }

    /// Remove a job. Fails while a dump or restore is in flight.
    pub fn delete(&self, jid: &Jid) -> CradleResult<()> {
        self.registry.delete(jid)?;
        self.store.delete(&job_key(jid))
    }

    pub fn get(&self, jid: &Jid) -> CradleResult<Job> {
        self.registry
            .get(jid)
            .ok_or_else(|| CradleError::JobNotFound { jid: jid.clone() })
    }

    pub fn list(&self, kind: Option<JobKind>) -> Vec<Job> {
        self.registry.list(kind)
    }

    // =====================================================================
    // Internals
    // =====================================================================

    fn op_opts(&self) -> Opts {
        Opts::new(
            Arc::clone(&self.plugins),
            Arc::clone(&self.engine),
            Arc::clone(&self.fd_store),
            Arc::clone(&self.config),
        )
    }

    /// Kind-specific details for an operation, synthesized from the PID
    /// for bare processes that were adopted without any.
    fn job_details(job: &Job) -> Option<JobDetails> {
        match (&job.details, job.kind) {
            (Some(details), _) => Some(details.clone()),
            (None, JobKind::Process) if job.pid != 0 => {
                Some(JobDetails::Process { pid: job.pid })
            }
            _ => None,
        }
    }

    /// Mark a failed operation's job as Failed and persist, best-effort.
    fn fail(&self, jid: &Jid, from: JobState) {
        if let Err(e) = self.registry.transition(jid, from, JobState::Failed) {
            tracing::warn!(jid = %jid, error = %e, "could not mark job failed");
        }
        if let Err(e) = self.persist(jid) {
            tracing::warn!(jid = %jid, error = %e, "could not persist failed job");
        }
    }

    /// Undo a freeze/unfreeze gate transition after the operation failed.
    fn revert(&self, jid: &Jid, from: JobState, to: JobState) {
        if let Err(e) = self.registry.transition(jid, from, to) {
            tracing::warn!(jid = %jid, error = %e, "could not revert job state");
        }
    }

    fn persist(&self, jid: &Jid) -> CradleResult<()> {
        let Some(job) = self.registry.get(jid) else {
            return Ok(());
        };
        persist_job(self.store.as_ref(), &job)
    }

    /// Rehydrate jobs persisted by a previous daemon instance. A process
    /// that disappeared while we were down is terminal; an operation that
    /// was in flight did not survive the crash.
    fn load_jobs(&self) -> CradleResult<()> {
        for key in self.store.list(JOB_KEY_PREFIX)? {
            let Some(bytes) = self.store.get(&key)? else {
                continue;
            };
            let mut job: Job = match serde_json::from_slice(&bytes) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping unreadable job record");
                    continue;
                }
            };

            if job.state.is_in_flight() {
                job.state = JobState::Failed;
            }
            if matches!(job.state, JobState::Running | JobState::Frozen)
                && (job.pid == 0 || !process::exists(job.pid))
            {
                job.state = JobState::Killed;
                job.pid = 0;
            }

            let jid = job.jid.clone();
            let pid = job.pid;
            let running = job.state == JobState::Running;
            if let Err(e) = self.registry.create(job) {
                tracing::warn!(jid = %jid, error = %e, "skipping duplicate job record");
                continue;
            }
            if running && pid != 0 {
                self.monitor_exit(jid, process::wait_for_exit(pid));
            }
        }
        Ok(())
    }

    /// Track a managed process until it exits, recording its exit code.
    fn monitor_exit(&self, jid: Jid, waiter: ExitWaiter) {
        let registry = Arc::clone(&self.registry);
        let store = Arc::clone(&self.store);
        let spawned = std::thread::Builder::new()
            .name(format!("job-exit-{jid}"))
            .spawn(move || {
                let Some(code) = waiter.wait() else {
                    return;
                };
                tracing::info!(jid = %jid, code, "managed process exited");
                let _ = registry.update(&jid, |j| {
                    j.exit_code = Some(code);
                    j.pid = 0;
                });
                // A checkpointing/checkpointed job losing its process is
                // expected; only a plainly live job becomes terminal here.
                if let Ok(state) = registry.state(&jid) {
                    if matches!(state, JobState::Running | JobState::Frozen) {
                        if let Err(e) = registry.transition(&jid, state, JobState::Killed) {
                            tracing::warn!(jid = %jid, error = %e, "exit transition rejected");
                        }
                    }
                }
                if let Some(job) = registry.get(&jid) {
                    if let Err(e) = persist_job(store.as_ref(), &job) {
                        tracing::warn!(jid = %jid, error = %e, "could not persist exited job");
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn exit monitor");
        }
    }
}

fn persist_job(store: &dyn Store, job: &Job) -> CradleResult<()> {
    let bytes = serde_json::to_vec(job).map_err(|e| CradleError::Io {
        context: "serializing job metadata",
        source: e.into(),
    })?;
    store.put(&job_key(&job.jid), bytes)
}

/// Kill and reap a process that was spawned but could not be handed to a
/// job record (the Pending→Running gate was lost to a concurrent kill or
/// delete).
fn reap_unmanaged(jid: &Jid, pid: u32, waiter: Option<ExitWaiter>) {
    if pid == 0 {
        return;
    }
    tracing::warn!(jid = %jid, pid, "terminating process spawned for a job that was taken away");
    if let Err(e) = process::signal(pid, Signal::SIGKILL) {
        tracing::warn!(jid = %jid, pid, error = %e, "could not signal unmanaged process");
        return;
    }
    if let Some(waiter) = waiter {
        let _ = waiter.wait_timeout(Duration::from_secs(5));
    }
}

/// Run `f` on its own thread and wait up to `timeout` for the result.
/// On expiry the worker keeps running detached (the engine exposes no
/// abort); its eventual result is discarded, and the caller has already
/// re-homed the job's state, so a late completion cannot be mistaken for
/// a live operation.
fn run_with_deadline<T: Send + 'static>(
    operation: &'static str,
    timeout: Duration,
    f: impl FnOnce() -> T + Send + 'static,
) -> CradleResult<T> {
    let (tx, rx) = sync_channel(1);
    std::thread::Builder::new()
        .name(format!("{operation}-worker"))
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| CradleError::Io {
            context: "spawning operation worker",
            source: e,
        })?;

    rx.recv_timeout(timeout)
        .map_err(|_| CradleError::DeadlineExceeded { operation, timeout })
}

/// Retry transient failures with a fixed small budget before surfacing.
fn retry_transient<T>(mut f: impl FnMut() -> CradleResult<T>) -> CradleResult<T> {
    let mut attempt = 1;
    loop {
        match f() {
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                tracing::debug!(attempt, error = %e, "transient failure, retrying");
                std::thread::sleep(RETRY_DELAY);
                attempt += 1;
            }
            other => return other,
        }
    }
}
