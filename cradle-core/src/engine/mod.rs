//! Checkpoint engine integration.
//!
//! Translates job/request metadata into engine options, invokes the
//! external dump/restore primitive, and runs registered notify hooks at
//! the right points. The engine itself is behind the [`CheckpointEngine`]
//! trait so the orchestration logic is testable without CRIU installed.

pub mod adapter;
pub mod criu;
pub mod notify;
pub mod opts;

pub use adapter::{EngineAdapter, FdStore};
pub use criu::{CheckpointEngine, CriuEngine};
pub use notify::NotifyHooks;
pub use opts::{build_dump_opts, scan_process, EngineOpts, ProcessScan};
