//! Run pipeline assembly.
//!
//! Starting a managed process is built in; container and batch kinds have
//! no built-in launcher and require their plugin to export one.

use std::process::{Command, Stdio};

use crate::error::{CradleError, CradleResult, ProcessError};
use crate::features;
use crate::plugins::PluginRegistry;
use crate::process::{self, ExitWaiter};
use crate::types::JobKind;

use super::{adapted, validation, Opts, RunAdapter, RunHandler, RunRequest, RunResponse};

/// Assemble the run chain for one job kind.
pub fn pipeline(kind: JobKind, plugins: &PluginRegistry) -> CradleResult<RunHandler> {
    let mut middleware: Vec<RunAdapter> = vec![validation::validate_run()];
    let mut handler: Option<RunHandler> = match kind {
        JobKind::Process => Some(Box::new(spawn_process)),
        _ => None,
    };

    if let Some(plugin) = kind.plugin_name() {
        if !plugins.is_registered(plugin) {
            return Err(CradleError::Unavailable {
                reason: format!("plugin '{plugin}' not loaded for job kind '{kind}'"),
            });
        }
        if let Some(extra) = plugins.lookup(plugin, &features::RUN_MIDDLEWARE) {
            middleware.extend(extra.into_iter().map(|a| Box::new(a) as RunAdapter));
        }
        if let Some(h) = plugins.lookup(plugin, &features::RUN_HANDLER) {
            handler = Some(Box::new(h));
        }
    }

    let handler = handler.ok_or_else(|| CradleError::Unavailable {
        reason: format!("no run handler for job kind '{kind}'"),
    })?;
    Ok(adapted(handler, middleware))
}

/// Terminal handler for bare processes: spawn detached from the daemon's
/// stdio and hand back an exit waiter that reaps the child.
fn spawn_process(
    _opts: &mut Opts,
    resp: &mut RunResponse,
    req: &mut RunRequest,
) -> CradleResult<Option<ExitWaiter>> {
    let mut cmd = Command::new(&req.command[0]);
    cmd.args(&req.command[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for (key, value) in &req.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &req.working_dir {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|e| {
        CradleError::Process(ProcessError::SpawnFailed {
            reason: format!("{}: {e}", req.command[0]),
        })
    })?;

    let pid = child.id();
    tracing::info!(pid, command = %req.command[0], "process started");
    resp.pid = pid;
    Ok(Some(process::wait_for_exit(pid)))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_opts;
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_command_rejected() {
        let plugins = PluginRegistry::new();
        let chain = pipeline(JobKind::Process, &plugins).unwrap();

        let mut opts = test_opts();
        let err = chain(
            &mut opts,
            &mut RunResponse::default(),
            &mut RunRequest::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CradleError::Validation(_)));
    }

    #[test]
    fn test_spawn_and_reap_exit_code() {
        let plugins = PluginRegistry::new();
        let chain = pipeline(JobKind::Process, &plugins).unwrap();

        let mut opts = test_opts();
        let mut resp = RunResponse::default();
        let mut req = RunRequest {
            command: vec!["sh".to_string(), "-c".to_string(), "exit 5".to_string()],
            ..Default::default()
        };
        let waiter = chain(&mut opts, &mut resp, &mut req).unwrap().unwrap();

        assert_ne!(resp.pid, 0);
        assert_eq!(waiter.wait_timeout(Duration::from_secs(5)).unwrap(), 5);
    }

    #[test]
    fn test_spawn_failure_reported() {
        let plugins = PluginRegistry::new();
        let chain = pipeline(JobKind::Process, &plugins).unwrap();

        let mut opts = test_opts();
        let mut req = RunRequest {
            command: vec!["/nonexistent/binary-xyz".to_string()],
            ..Default::default()
        };
        let err = chain(&mut opts, &mut RunResponse::default(), &mut req).unwrap_err();
        assert!(matches!(
            err,
            CradleError::Process(ProcessError::SpawnFailed { .. })
        ));
    }

    #[test]
    fn test_plugin_kind_without_run_handler_unavailable() {
        let plugins = PluginRegistry::new();
        plugins
            .register("slurm", crate::plugins::CapabilityTable::new())
            .unwrap();
        assert!(matches!(
            pipeline(JobKind::Slurm, &plugins).err().unwrap(),
            CradleError::Unavailable { .. }
        ));
    }
}
