//! Restore pipeline assembly.
//!
//! Mirrors the dump chain: defaults, validation, plugin splice, then the
//! engine. The terminal handler hands back an exit waiter for the restored
//! process so the caller can track its lifetime.

use std::sync::Arc;

use crate::error::{CradleError, CradleResult, ValidationError};
use crate::features;
use crate::plugins::PluginRegistry;
use crate::process::{self, ExitWaiter};
use crate::types::JobKind;

use super::{
    adapted, defaults, validation, Opts, RestoreAdapter, RestoreHandler, RestoreRequest,
    RestoreResponse,
};

/// Assemble the restore chain for one job kind.
pub fn pipeline(kind: JobKind, plugins: &PluginRegistry) -> CradleResult<RestoreHandler> {
    let mut middleware: Vec<RestoreAdapter> = vec![
        defaults::fill_restore_defaults(),
        validation::validate_restore(),
    ];
    let mut handler: RestoreHandler = Box::new(engine_restore);

    if let Some(plugin) = kind.plugin_name() {
        if !plugins.is_registered(plugin) {
            return Err(CradleError::Unavailable {
                reason: format!("plugin '{plugin}' not loaded for job kind '{kind}'"),
            });
        }
        if let Some(extra) = plugins.lookup(plugin, &features::RESTORE_MIDDLEWARE) {
            middleware.extend(extra.into_iter().map(|a| Box::new(a) as RestoreAdapter));
        }
        if let Some(h) = plugins.lookup(plugin, &features::RESTORE_HANDLER) {
            handler = Box::new(h);
        }
    }

    Ok(adapted(handler, middleware))
}

/// Terminal handler: engine restore with external-FD re-injection, then an
/// exit waiter on the restored PID.
fn engine_restore(
    opts: &mut Opts,
    resp: &mut RestoreResponse,
    req: &mut RestoreRequest,
) -> CradleResult<Option<ExitWaiter>> {
    let path = req.path.clone().ok_or(CradleError::Validation(
        ValidationError::MissingField {
            field: "path",
            context: "restore pipeline",
        },
    ))?;

    let engine = Arc::clone(&opts.engine);
    let fd_store = Arc::clone(&opts.fd_store);
    let (pid, state) = engine.restore(&path, &mut req.engine, &mut opts.hooks, &fd_store)?;

    resp.pid = pid;
    resp.state = Some(state);
    Ok(Some(process::wait_for_exit(pid)))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_opts;
    use super::*;
    use crate::types::{ProcessState, STATE_FILE};

    #[test]
    fn test_unloaded_plugin_kind_is_unavailable() {
        let plugins = PluginRegistry::new();
        assert!(matches!(
            pipeline(JobKind::Kata, &plugins).err().unwrap(),
            CradleError::Unavailable { .. }
        ));
    }

    #[test]
    fn test_restore_reads_state_and_returns_waiter() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = ProcessState {
            pid: 999,
            ..Default::default()
        };
        std::fs::write(
            dir.path().join(STATE_FILE),
            serde_json::to_vec(&state).unwrap(),
        )
        .unwrap();

        let plugins = PluginRegistry::new();
        let chain = pipeline(JobKind::Process, &plugins).unwrap();

        let mut opts = test_opts();
        let mut resp = RestoreResponse::default();
        let mut req = RestoreRequest {
            path: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let waiter = chain(&mut opts, &mut resp, &mut req).unwrap();

        // The stub engine reports PID 1.
        assert_eq!(resp.pid, 1);
        assert_eq!(resp.state.unwrap().pid, 999);
        assert!(waiter.is_some());
    }

    #[test]
    fn test_restore_without_path_rejected() {
        let plugins = PluginRegistry::new();
        let chain = pipeline(JobKind::Process, &plugins).unwrap();

        let mut opts = test_opts();
        let err = chain(
            &mut opts,
            &mut RestoreResponse::default(),
            &mut RestoreRequest::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CradleError::Validation(_)));
    }
}
