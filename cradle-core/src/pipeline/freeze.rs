//! Freeze/unfreeze pipeline assembly.
//!
//! A freeze is the front half of a dump, so both operations ride the dump
//! envelope. Bare processes freeze with SIGSTOP/SIGCONT; container kinds
//! have no built-in handler and become freezable only through their
//! plugin's `freeze-handler`/`unfreeze-handler` exports (typically backed
//! by a cgroup freezer).

use crate::error::{CradleError, CradleResult, ValidationError};
use crate::features;
use crate::plugins::{Feature, PluginRegistry};
use crate::process::{self, ExitWaiter};
use crate::types::{JobDetails, JobKind};

use super::{adapted, validation, DumpHandler, DumpHandlerFn, DumpRequest, DumpResponse, Opts};

/// Assemble the freeze chain for one job kind.
pub fn freeze_pipeline(kind: JobKind, plugins: &PluginRegistry) -> CradleResult<DumpHandler> {
    build(kind, plugins, &features::FREEZE_HANDLER, pause_process)
}

/// Assemble the unfreeze chain for one job kind.
pub fn unfreeze_pipeline(kind: JobKind, plugins: &PluginRegistry) -> CradleResult<DumpHandler> {
    build(kind, plugins, &features::UNFREEZE_HANDLER, resume_process)
}

fn build(
    kind: JobKind,
    plugins: &PluginRegistry,
    feature: &Feature<DumpHandlerFn>,
    builtin: DumpHandlerFn,
) -> CradleResult<DumpHandler> {
    let handler: DumpHandler = match kind.plugin_name() {
        None => Box::new(builtin),
        Some(plugin) => {
            let h = plugins
                .lookup(plugin, feature)
                .ok_or_else(|| CradleError::Unavailable {
                    reason: format!(
                        "job kind '{kind}' has no {} capability",
                        feature.name()
                    ),
                })?;
            Box::new(h)
        }
    };

    Ok(adapted(handler, vec![validation::validate_dump()]))
}

fn target_pid(req: &DumpRequest) -> CradleResult<u32> {
    match &req.details {
        Some(JobDetails::Process { pid }) => Ok(*pid),
        _ => Err(ValidationError::MissingField {
            field: "details.pid",
            context: "process freeze",
        }
        .into()),
    }
}

fn pause_process(
    _opts: &mut Opts,
    _resp: &mut DumpResponse,
    req: &mut DumpRequest,
) -> CradleResult<Option<ExitWaiter>> {
    let pid = target_pid(req)?;
    process::pause(pid)?;
    tracing::info!(pid, "process frozen");
    Ok(None)
}

fn resume_process(
    _opts: &mut Opts,
    _resp: &mut DumpResponse,
    req: &mut DumpRequest,
) -> CradleResult<Option<ExitWaiter>> {
    let pid = target_pid(req)?;
    process::resume(pid)?;
    tracing::info!(pid, "process thawed");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_opts;
    use super::*;
    use crate::plugins::CapabilityTable;
    use std::process::Command;

    #[test]
    fn test_process_freeze_and_unfreeze() {
        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id();

        let plugins = PluginRegistry::new();
        let mut opts = test_opts();
        let mut req = DumpRequest {
            details: Some(JobDetails::Process { pid }),
            ..Default::default()
        };

        let freeze = freeze_pipeline(JobKind::Process, &plugins).unwrap();
        freeze(&mut opts, &mut DumpResponse::default(), &mut req).unwrap();

        let thaw = unfreeze_pipeline(JobKind::Process, &plugins).unwrap();
        thaw(&mut opts, &mut DumpResponse::default(), &mut req).unwrap();

        crate::process::signal(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid as i32), None);
    }

    #[test]
    fn test_container_kind_requires_plugin_handler() {
        let plugins = PluginRegistry::new();
        plugins.register("runc", CapabilityTable::new()).unwrap();
        assert!(matches!(
            freeze_pipeline(JobKind::Runc, &plugins).err().unwrap(),
            CradleError::Unavailable { .. }
        ));
    }

    fn plugin_freeze(
        _opts: &mut Opts,
        resp: &mut DumpResponse,
        _req: &mut DumpRequest,
    ) -> CradleResult<Option<ExitWaiter>> {
        resp.messages.push("frozen-by-plugin".to_string());
        Ok(None)
    }

    #[test]
    fn test_plugin_freeze_handler_used() {
        let plugins = PluginRegistry::new();
        plugins
            .register(
                "runc",
                CapabilityTable::new()
                    .provide(&features::FREEZE_HANDLER, plugin_freeze as DumpHandlerFn),
            )
            .unwrap();

        let chain = freeze_pipeline(JobKind::Runc, &plugins).unwrap();
        let mut opts = test_opts();
        let mut resp = DumpResponse::default();
        let mut req = DumpRequest {
            kind: JobKind::Runc,
            details: Some(JobDetails::Runc {
                id: "c1".to_string(),
                root: "/run/runc".into(),
                bundle: None,
            }),
            ..Default::default()
        };
        chain(&mut opts, &mut resp, &mut req).unwrap();
        assert_eq!(resp.messages, vec!["frozen-by-plugin"]);
    }
}
