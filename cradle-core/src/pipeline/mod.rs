//! Middleware pipeline.
//!
//! Every operation (dump, restore, run, freeze) executes as a single
//! terminal handler wrapped in an ordered chain of adapters. Adapters run
//! in registration order on the way in; an adapter that returns an error
//! short-circuits everything downstream, including the terminal handler.
//! Adapters communicate with the terminal handler only through the request,
//! the response, and the shared [`Opts`] context - there is no side
//! channel.

pub mod defaults;
pub mod dump;
pub mod freeze;
pub mod restore;
pub mod run;
pub mod validation;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::DaemonConfig;
use crate::engine::{EngineAdapter, EngineOpts, FdStore, NotifyHooks, ProcessScan};
use crate::error::CradleResult;
use crate::plugins::PluginRegistry;
use crate::process::ExitWaiter;
use crate::types::{Jid, JobDetails, JobKind, ProcessState};

/// Shared context for one operation. Long-lived collaborators come in as
/// `Arc`s; `hooks` and `scan` are scratch state accumulated by middleware
/// for the terminal handler and die with the operation.
pub struct Opts {
    pub plugins: Arc<PluginRegistry>,
    pub engine: Arc<EngineAdapter>,
    pub fd_store: Arc<FdStore>,
    pub config: Arc<DaemonConfig>,
    /// Lifecycle hooks registered by middleware, run by the engine around
    /// its invocation.
    pub hooks: NotifyHooks,
    /// The /proc scan of the dump target, filled by middleware.
    pub scan: Option<ProcessScan>,
}

impl Opts {
    pub fn new(
        plugins: Arc<PluginRegistry>,
        engine: Arc<EngineAdapter>,
        fd_store: Arc<FdStore>,
        config: Arc<DaemonConfig>,
    ) -> Self {
        Self {
            plugins,
            engine,
            fd_store,
            config,
            hooks: NotifyHooks::new(),
            scan: None,
        }
    }
}

/// A pipeline stage. Terminal handlers may hand back an [`ExitWaiter`] for
/// the process they started or restored; everything else returns `None`.
pub type Handler<Req, Resp> =
    Box<dyn Fn(&mut Opts, &mut Resp, &mut Req) -> CradleResult<Option<ExitWaiter>> + Send>;

/// Wraps the next stage, producing a new stage.
pub type Adapter<Req, Resp> = Box<dyn FnOnce(Handler<Req, Resp>) -> Handler<Req, Resp> + Send>;

/// Compose `handler` with `adapters` so the first adapter in the list is
/// the outermost wrapper: request flow runs the adapters front to back,
/// then the handler.
pub fn adapted<Req, Resp>(
    handler: Handler<Req, Resp>,
    adapters: Vec<Adapter<Req, Resp>>,
) -> Handler<Req, Resp> {
    adapters.into_iter().rev().fold(handler, |next, wrap| wrap(next))
}

// =========================================================================
// Request/response envelopes
// =========================================================================

/// Dump request. Freeze and unfreeze reuse this envelope: a freeze is the
/// front half of a dump, and plugin-provided handlers for both consume the
/// same fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpRequest {
    pub jid: Option<Jid>,
    pub kind: JobKind,
    pub details: Option<JobDetails>,
    /// Base directory for the image directory; defaulted from config.
    pub dir: PathBuf,
    /// Human-readable stem for the image directory name.
    pub name: String,
    /// Whether the target is GPU-attached; selects the signal-based dump
    /// path when the daemon is configured for it.
    pub gpu_enabled: bool,
    pub engine: EngineOpts,
}

impl Default for DumpRequest {
    fn default() -> Self {
        Self {
            jid: None,
            kind: JobKind::Process,
            details: None,
            dir: PathBuf::new(),
            name: String::new(),
            gpu_enabled: false,
            engine: EngineOpts::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DumpResponse {
    /// Captured process state; also persisted into the image directory.
    pub state: Option<ProcessState>,
    /// Image directories produced by this operation.
    pub paths: Vec<PathBuf>,
    /// Advisory messages accumulated by the chain.
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub jid: Option<Jid>,
    pub kind: JobKind,
    pub details: Option<JobDetails>,
    /// Checkpoint directory to restore from. Defaulted to the job's
    /// latest checkpoint when unset.
    pub path: Option<PathBuf>,
    pub engine: EngineOpts,
}

impl Default for RestoreRequest {
    fn default() -> Self {
        Self {
            jid: None,
            kind: JobKind::Process,
            details: None,
            path: None,
            engine: EngineOpts::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreResponse {
    /// PID of the restored process.
    pub pid: u32,
    /// Process state read back from the checkpoint metadata.
    pub state: Option<ProcessState>,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub jid: Option<Jid>,
    pub kind: JobKind,
    pub details: Option<JobDetails>,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub gpu_enabled: bool,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            jid: None,
            kind: JobKind::Process,
            details: None,
            command: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            gpu_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResponse {
    pub pid: u32,
    pub messages: Vec<String>,
}

pub type DumpHandler = Handler<DumpRequest, DumpResponse>;
pub type DumpAdapter = Adapter<DumpRequest, DumpResponse>;
pub type RestoreHandler = Handler<RestoreRequest, RestoreResponse>;
pub type RestoreAdapter = Adapter<RestoreRequest, RestoreResponse>;
pub type RunHandler = Handler<RunRequest, RunResponse>;
pub type RunAdapter = Adapter<RunRequest, RunResponse>;

// Plugin-exported pipeline pieces are plain function pointers so they can
// live in a capability table and be cloned out on every lookup.
pub type DumpHandlerFn =
    fn(&mut Opts, &mut DumpResponse, &mut DumpRequest) -> CradleResult<Option<ExitWaiter>>;
pub type DumpAdapterFn = fn(DumpHandler) -> DumpHandler;
pub type RestoreHandlerFn =
    fn(&mut Opts, &mut RestoreResponse, &mut RestoreRequest) -> CradleResult<Option<ExitWaiter>>;
pub type RestoreAdapterFn = fn(RestoreHandler) -> RestoreHandler;
pub type RunHandlerFn =
    fn(&mut Opts, &mut RunResponse, &mut RunRequest) -> CradleResult<Option<ExitWaiter>>;
pub type RunAdapterFn = fn(RunHandler) -> RunHandler;

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::engine::{CheckpointEngine, EngineOpts};
    use crate::error::EngineError;

    /// Engine stub that records invocations and always succeeds.
    pub struct NoopEngine;

    impl CheckpointEngine for NoopEngine {
        fn dump(&self, _pid: u32, _opts: &EngineOpts) -> Result<(), EngineError> {
            Ok(())
        }

        fn restore(&self, _opts: &EngineOpts) -> Result<u32, EngineError> {
            Ok(1)
        }
    }

    pub fn test_opts() -> Opts {
        Opts::new(
            Arc::new(PluginRegistry::new()),
            Arc::new(EngineAdapter::new(
                Arc::new(NoopEngine),
                Arc::new(DaemonConfig::default()),
            )),
            Arc::new(FdStore::new()),
            Arc::new(DaemonConfig::default()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_opts;
    use super::*;
    use crate::error::CradleError;
    use std::sync::{Arc as StdArc, Mutex};

    fn tracing_adapter(
        label: &'static str,
        log: StdArc<Mutex<Vec<String>>>,
    ) -> DumpAdapter {
        Box::new(move |next: DumpHandler| {
            Box::new(move |opts, resp, req| {
                log.lock().unwrap().push(format!("{label}:pre"));
                let result = next(opts, resp, req);
                log.lock().unwrap().push(format!("{label}:post"));
                result
            })
        })
    }

    #[test]
    fn test_adapters_run_front_to_back_around_handler() {
        let log = StdArc::new(Mutex::new(Vec::new()));

        let handler: DumpHandler = {
            let log = StdArc::clone(&log);
            Box::new(move |_, _, _| {
                log.lock().unwrap().push("handler".to_string());
                Ok(None)
            })
        };

        let chain = adapted(
            handler,
            vec![
                tracing_adapter("a", StdArc::clone(&log)),
                tracing_adapter("b", StdArc::clone(&log)),
            ],
        );

        let mut opts = test_opts();
        chain(&mut opts, &mut DumpResponse::default(), &mut DumpRequest::default()).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:pre", "b:pre", "handler", "b:post", "a:post"]
        );
    }

    #[test]
    fn test_failing_adapter_short_circuits() {
        let handler_ran = StdArc::new(Mutex::new(false));

        let handler: DumpHandler = {
            let handler_ran = StdArc::clone(&handler_ran);
            Box::new(move |_, _, _| {
                *handler_ran.lock().unwrap() = true;
                Ok(None)
            })
        };

        let failing: DumpAdapter = Box::new(|_next: DumpHandler| {
            Box::new(|_, _, _| {
                Err(CradleError::Unavailable {
                    reason: "refused".to_string(),
                })
            })
        });

        let chain = adapted(handler, vec![failing]);
        let mut opts = test_opts();
        let err = chain(
            &mut opts,
            &mut DumpResponse::default(),
            &mut DumpRequest::default(),
        )
        .unwrap_err();

        assert!(matches!(err, CradleError::Unavailable { .. }));
        assert!(!*handler_ran.lock().unwrap());
    }

    #[test]
    fn test_adapters_may_rewrite_the_request() {
        let handler: DumpHandler = Box::new(|_, resp, req| {
            resp.messages.push(format!("saw name '{}'", req.name));
            Ok(None)
        });

        let renamer: DumpAdapter = Box::new(|next: DumpHandler| {
            Box::new(move |opts, resp, req| {
                req.name = "rewritten".to_string();
                next(opts, resp, req)
            })
        });

        let chain = adapted(handler, vec![renamer]);
        let mut opts = test_opts();
        let mut resp = DumpResponse::default();
        chain(&mut opts, &mut resp, &mut DumpRequest::default()).unwrap();
        assert_eq!(resp.messages, vec!["saw name 'rewritten'"]);
    }

    #[test]
    fn test_empty_adapter_list_is_the_bare_handler() {
        let handler: DumpHandler = Box::new(|_, resp, _| {
            resp.messages.push("marker".to_string());
            Ok(None)
        });
        let chain = adapted(handler, Vec::new());

        let mut opts = test_opts();
        let mut resp = DumpResponse::default();
        chain(&mut opts, &mut resp, &mut DumpRequest::default()).unwrap();
        assert_eq!(resp.messages, vec!["marker"]);
    }
}
