//! Well-known plugin feature keys.
//!
//! A plugin participates in the pipeline by exporting values under these
//! keys in its capability table. Middleware features splice extra adapters
//! into an operation's chain for the plugin's job kind; handler features
//! replace the built-in terminal handler outright. Everything here is
//! optional per plugin; an absent feature just means the built-in behavior
//! (or "unavailable") applies.

use crate::error::CradleResult;
use crate::pipeline::{
    DumpAdapterFn, DumpHandlerFn, RestoreAdapterFn, RestoreHandlerFn, RunAdapterFn, RunHandlerFn,
};
use crate::plugins::Feature;
use crate::types::JobDetails;

/// Extra dump middleware for the plugin's job kind, spliced after the
/// built-in defaults and validation stages.
pub const DUMP_MIDDLEWARE: Feature<Vec<DumpAdapterFn>> = Feature::new("dump-middleware");
/// Terminal dump handler override.
pub const DUMP_HANDLER: Feature<DumpHandlerFn> = Feature::new("dump-handler");

pub const RESTORE_MIDDLEWARE: Feature<Vec<RestoreAdapterFn>> = Feature::new("restore-middleware");
pub const RESTORE_HANDLER: Feature<RestoreHandlerFn> = Feature::new("restore-handler");

pub const RUN_MIDDLEWARE: Feature<Vec<RunAdapterFn>> = Feature::new("run-middleware");
pub const RUN_HANDLER: Feature<RunHandlerFn> = Feature::new("run-handler");

// Freeze and unfreeze ride the dump envelope; container kinds have no
// built-in terminal handler for them, so these features are how a kind
// becomes freezable at all.
pub const FREEZE_HANDLER: Feature<DumpHandlerFn> = Feature::new("freeze-handler");
pub const UNFREEZE_HANDLER: Feature<DumpHandlerFn> = Feature::new("unfreeze-handler");

/// Signal to deliver on kill instead of SIGKILL.
pub const KILL_SIGNAL: Feature<i32> = Feature::new("kill-signal");

/// Constructs a [`Freezer`] for a job from its kind-specific details.
pub type FreezerFactory = fn(&JobDetails) -> CradleResult<Box<dyn Freezer>>;

/// Pause/resume control over a job's task group, typically backed by a
/// cgroup freezer file.
pub trait Freezer: Send + Sync {
    fn freeze(&self) -> CradleResult<()>;
    fn thaw(&self) -> CradleResult<()>;
    /// Whether the task group is currently frozen.
    fn frozen(&self) -> CradleResult<bool>;
}

pub const FREEZER: Feature<FreezerFactory> = Feature::new("freezer");

/// Constructs a [`Snapshotter`] for a VM job from its kind-specific
/// details.
pub type SnapshotterFactory = fn(&JobDetails) -> CradleResult<Box<dyn Snapshotter>>;

/// Hypervisor-level snapshot control for VM-backed kinds. The hypervisor
/// API socket stands in for a PID: the VM is paused, captured, and resumed
/// through it rather than through process signals.
pub trait Snapshotter: Send + Sync {
    fn snapshot(&self, dest: &std::path::Path) -> CradleResult<()>;
    fn restore(&self, path: &std::path::Path) -> CradleResult<()>;
    fn pause(&self) -> CradleResult<()>;
    fn resume(&self) -> CradleResult<()>;
    /// PID of the hypervisor process hosting the VM.
    fn pid(&self) -> CradleResult<u32>;
}

pub const SNAPSHOTTER: Feature<SnapshotterFactory> = Feature::new("snapshotter");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{CapabilityTable, PluginRegistry};
    use std::path::Path;

    struct StubVm;

    impl Snapshotter for StubVm {
        fn snapshot(&self, _dest: &Path) -> CradleResult<()> {
            Ok(())
        }
        fn restore(&self, _path: &Path) -> CradleResult<()> {
            Ok(())
        }
        fn pause(&self) -> CradleResult<()> {
            Ok(())
        }
        fn resume(&self) -> CradleResult<()> {
            Ok(())
        }
        fn pid(&self) -> CradleResult<u32> {
            Ok(9001)
        }
    }

    fn make_stub(_details: &JobDetails) -> CradleResult<Box<dyn Snapshotter>> {
        Ok(Box::new(StubVm))
    }

    #[test]
    fn test_snapshotter_capability_round_trip() {
        let registry = PluginRegistry::new();
        registry
            .register(
                "kata",
                CapabilityTable::new().provide(&SNAPSHOTTER, make_stub as SnapshotterFactory),
            )
            .unwrap();

        let details = JobDetails::Kata {
            vm_id: "vm-1".into(),
            vm_socket: "/run/kata/vm-1/api.sock".into(),
        };
        let factory = registry.lookup("kata", &SNAPSHOTTER).unwrap();
        let vm = factory(&details).unwrap();
        vm.pause().unwrap();
        vm.snapshot(Path::new("/tmp/vm-snap")).unwrap();
        vm.resume().unwrap();
        assert_eq!(vm.pid().unwrap(), 9001);
    }
}
