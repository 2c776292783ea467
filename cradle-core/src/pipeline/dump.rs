//! Dump pipeline assembly.
//!
//! The chain for a bare process is built in: defaults, validation, a
//! /proc scan that captures process state and derives engine options, then
//! the engine itself. Container and batch kinds splice in their plugin's
//! middleware and may replace the terminal handler entirely; a kind whose
//! plugin is not loaded cannot be dumped.

use std::sync::Arc;

use crate::engine::{build_dump_opts, scan_process, ProcessScan};
use crate::error::{CradleError, CradleResult, ValidationError};
use crate::features;
use crate::plugins::PluginRegistry;
use crate::process::ExitWaiter;
use crate::types::{JobDetails, JobKind, ProcessState};

use super::{adapted, defaults, validation, DumpAdapter, DumpHandler, DumpRequest, DumpResponse, Opts};

/// Assemble the dump chain for one job kind.
pub fn pipeline(kind: JobKind, plugins: &PluginRegistry) -> CradleResult<DumpHandler> {
    let mut middleware: Vec<DumpAdapter> =
        vec![defaults::fill_dump_defaults(), validation::validate_dump()];
    let mut handler: DumpHandler = Box::new(engine_dump);

    match kind.plugin_name() {
        None => {
            middleware.push(fill_process_state());
        }
        Some(plugin) => {
            if !plugins.is_registered(plugin) {
                return Err(CradleError::Unavailable {
                    reason: format!("plugin '{plugin}' not loaded for job kind '{kind}'"),
                });
            }
            if let Some(extra) = plugins.lookup(plugin, &features::DUMP_MIDDLEWARE) {
                middleware.extend(extra.into_iter().map(|a| Box::new(a) as DumpAdapter));
            }
            if let Some(h) = plugins.lookup(plugin, &features::DUMP_HANDLER) {
                handler = Box::new(h);
            }
        }
    }

    Ok(adapted(handler, middleware))
}

/// Scan the target process and capture its state: session id, network
/// descriptors to treat as external, open write-only files. Engine options
/// are derived from the scan on top of whatever the caller set.
pub fn fill_process_state() -> DumpAdapter {
    Box::new(|next: DumpHandler| {
        Box::new(move |opts, resp, req| {
            let pid = match &req.details {
                Some(JobDetails::Process { pid }) => *pid,
                _ => {
                    return Err(ValidationError::MissingField {
                        field: "details.pid",
                        context: "process dump",
                    }
                    .into())
                }
            };

            let scan = scan_process(pid).map_err(|e| CradleError::Io {
                context: "scanning /proc for dump target",
                source: e,
            })?;

            tracing::debug!(
                pid,
                sid = scan.sid,
                tcp = scan.tcp_inodes.len(),
                shell = scan.has_tty,
                "dump target scanned"
            );

            req.engine = build_dump_opts(&scan, std::mem::take(&mut req.engine));
            resp.state = Some(ProcessState {
                pid,
                sid: scan.sid,
                gpu_enabled: req.gpu_enabled,
                gpu_id: None,
                ext_fd_keys: scan.ext_fd_keys(),
            });
            opts.scan = Some(scan);

            next(opts, resp, req)
        })
    })
}

/// Terminal handler: fresh image directory, then the engine with the
/// accumulated hooks.
fn engine_dump(
    opts: &mut Opts,
    resp: &mut DumpResponse,
    req: &mut DumpRequest,
) -> CradleResult<Option<ExitWaiter>> {
    let mut state = resp.state.take().ok_or(CradleError::Validation(
        ValidationError::MissingField {
            field: "state",
            context: "dump pipeline",
        },
    ))?;
    let scan = opts.scan.take().unwrap_or_else(|| ProcessScan {
        pid: state.pid,
        sid: state.sid,
        ..Default::default()
    });

    let engine = Arc::clone(&opts.engine);
    let images_dir = engine.prepare_images_dir(&req.dir, &req.name)?;
    engine.dump(&mut state, &scan, &mut req.engine, &mut opts.hooks, &images_dir)?;

    resp.paths.push(images_dir);
    resp.state = Some(state);
    Ok(None)
}
