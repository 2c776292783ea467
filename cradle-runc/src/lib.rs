//! runc container plugin.
//!
//! Exports the capability table that makes `runc` a checkpointable job
//! kind: a cgroup v2 freezer, dump middleware that quiesces the container
//! around the snapshot, a dump handler that targets the container's init
//! process, and a freeze/unfreeze handler pair. The core never links this
//! crate; consumers register [`capability_table`] into a `PluginRegistry`
//! at startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use cradle_core::engine::{build_dump_opts, scan_process};
use cradle_core::error::{CradleError, CradleResult, ValidationError};
use cradle_core::features::{self, Freezer, FreezerFactory};
use cradle_core::pipeline::{
    DumpAdapterFn, DumpHandler, DumpHandlerFn, DumpRequest, DumpResponse, Opts,
};
use cradle_core::plugins::CapabilityTable;
use cradle_core::process::ExitWaiter;
use cradle_core::types::{JobDetails, ProcessState};

pub const PLUGIN_NAME: &str = "runc";

/// cgroupfs-driver layout: each container's unified cgroup lives directly
/// under the v2 mount.
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Everything this plugin exports, keyed by the core's feature names.
pub fn capability_table() -> CapabilityTable {
    CapabilityTable::new()
        .provide(
            &features::DUMP_MIDDLEWARE,
            vec![prepare_dump as DumpAdapterFn],
        )
        .provide(&features::DUMP_HANDLER, dump_container as DumpHandlerFn)
        .provide(&features::FREEZE_HANDLER, freeze_container as DumpHandlerFn)
        .provide(
            &features::UNFREEZE_HANDLER,
            unfreeze_container as DumpHandlerFn,
        )
        .provide(&features::FREEZER, freezer_for as FreezerFactory)
        .provide(&features::KILL_SIGNAL, libc::SIGTERM)
}

// =========================================================================
// cgroup v2 freezer
// =========================================================================

/// Freezer backed by a cgroup v2 `cgroup.freeze` file.
pub struct CgroupFreezer {
    path: PathBuf,
}

impl CgroupFreezer {
    pub fn new(cgroup_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: cgroup_dir.into(),
        }
    }

    /// Whether the freezer file is visible to us at all. Containers in
    /// foreign cgroup namespaces may not be.
    pub fn available(&self) -> bool {
        self.freeze_file().exists()
    }

    fn freeze_file(&self) -> PathBuf {
        self.path.join("cgroup.freeze")
    }

    fn write(&self, value: &str) -> CradleResult<()> {
        std::fs::write(self.freeze_file(), value).map_err(|e| CradleError::Io {
            context: "writing cgroup.freeze",
            source: e,
        })
    }
}

impl Freezer for CgroupFreezer {
    fn freeze(&self) -> CradleResult<()> {
        self.write("1")
    }

    fn thaw(&self) -> CradleResult<()> {
        self.write("0")
    }

    fn frozen(&self) -> CradleResult<bool> {
        let contents =
            std::fs::read_to_string(self.freeze_file()).map_err(|e| CradleError::Io {
                context: "reading cgroup.freeze",
                source: e,
            })?;
        Ok(contents.trim() == "1")
    }
}

fn container_cgroup(id: &str) -> PathBuf {
    Path::new(CGROUP_ROOT).join(id)
}

fn freezer_for(details: &JobDetails) -> CradleResult<Box<dyn Freezer>> {
    let (id, _root) = runc_details(details)?;
    Ok(Box::new(CgroupFreezer::new(container_cgroup(id))))
}

// =========================================================================
// Container state
// =========================================================================

/// The slice of runc's on-disk `state.json` we need.
#[derive(Debug, Deserialize)]
struct RuncState {
    #[allow(dead_code)]
    id: String,
    init_process_pid: u32,
}

fn container_state(root: &Path, id: &str) -> CradleResult<RuncState> {
    let path = root.join(id).join("state.json");
    let contents = std::fs::read_to_string(&path).map_err(|_| CradleError::NotFound {
        what: format!("runc container '{id}' under {}", root.display()),
    })?;
    serde_json::from_str(&contents).map_err(|e| {
        CradleError::Validation(ValidationError::InvalidFieldValue {
            field: "state.json",
            value: path.display().to_string(),
            reason: e.to_string(),
        })
    })
}

fn runc_details(details: &JobDetails) -> CradleResult<(&str, &Path)> {
    match details {
        JobDetails::Runc { id, root, .. } if !id.is_empty() => Ok((id, root)),
        JobDetails::Runc { .. } => Err(ValidationError::InvalidFieldValue {
            field: "details.id",
            value: String::new(),
            reason: "container id cannot be empty".to_string(),
        }
        .into()),
        _ => Err(ValidationError::MissingField {
            field: "details",
            context: "runc operation",
        }
        .into()),
    }
}

fn request_details(req: &DumpRequest) -> CradleResult<&JobDetails> {
    req.details.as_ref().ok_or(CradleError::Validation(
        ValidationError::MissingField {
            field: "details",
            context: "runc operation",
        },
    ))
}

// =========================================================================
// Pipeline pieces
// =========================================================================

/// Dump middleware: validate the container details and, when the cgroup
/// is visible, quiesce the container around the snapshot via freeze
/// hooks. An invisible cgroup (foreign namespace) downgrades to an
/// unquiesced dump.
fn prepare_dump(next: DumpHandler) -> DumpHandler {
    Box::new(move |opts: &mut Opts, resp, req: &mut DumpRequest| {
        let (id, _root) = runc_details(request_details(req)?)?;

        let freezer = Arc::new(CgroupFreezer::new(container_cgroup(id)));
        if freezer.available() {
            {
                let freezer = Arc::clone(&freezer);
                opts.hooks.pre_dump(move |_| freezer.freeze());
            }
            opts.hooks.post_dump(move |_, _| freezer.thaw());
        } else {
            tracing::debug!(id, "container cgroup not visible, dumping without quiesce");
        }

        next(opts, resp, req)
    })
}

/// Terminal dump handler: resolve the container's init process from
/// runc's state file and checkpoint that process tree.
fn dump_container(
    opts: &mut Opts,
    resp: &mut DumpResponse,
    req: &mut DumpRequest,
) -> CradleResult<Option<ExitWaiter>> {
    let details = request_details(req)?.clone();
    let (id, root) = runc_details(&details)?;
    let container = container_state(root, id)?;
    let pid = container.init_process_pid;

    let scan = scan_process(pid).map_err(|e| CradleError::Io {
        context: "scanning container init process",
        source: e,
    })?;
    req.engine = build_dump_opts(&scan, std::mem::take(&mut req.engine));

    let mut state = ProcessState {
        pid,
        sid: scan.sid,
        gpu_enabled: req.gpu_enabled,
        gpu_id: None,
        ext_fd_keys: scan.ext_fd_keys(),
    };

    let engine = Arc::clone(&opts.engine);
    let images_dir = engine.prepare_images_dir(&req.dir, &req.name)?;
    engine.dump(&mut state, &scan, &mut req.engine, &mut opts.hooks, &images_dir)?;

    tracing::info!(id, pid, dir = %images_dir.display(), "container dumped");
    resp.paths.push(images_dir);
    resp.state = Some(state);
    Ok(None)
}

fn freeze_container(
    _opts: &mut Opts,
    _resp: &mut DumpResponse,
    req: &mut DumpRequest,
) -> CradleResult<Option<ExitWaiter>> {
    let (id, _root) = runc_details(request_details(req)?)?;
    CgroupFreezer::new(container_cgroup(id)).freeze()?;
    tracing::info!(id, "container frozen");
    Ok(None)
}

fn unfreeze_container(
    _opts: &mut Opts,
    _resp: &mut DumpResponse,
    req: &mut DumpRequest,
) -> CradleResult<Option<ExitWaiter>> {
    let (id, _root) = runc_details(request_details(req)?)?;
    CgroupFreezer::new(container_cgroup(id)).thaw()?;
    tracing::info!(id, "container thawed");
    Ok(None)
}
