//! Cradle Core Library
//!
//! Checkpoint/restore orchestration core for the Cradle daemon. Provides
//! the job registry and lifecycle state machine, the middleware pipeline
//! for dump/restore/run/freeze operations, the checkpoint engine adapter
//! with notify hooks, the plugin capability registry, and the supporting
//! process-control and event-broadcast primitives.

pub mod broadcast;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod features;
pub mod job;
pub mod pipeline;
pub mod plugins;
pub mod process;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use broadcast::Broadcaster;
pub use config::DaemonConfig;
pub use daemon::{Daemon, DumpEvent};
pub use engine::{CheckpointEngine, CriuEngine, EngineAdapter, EngineOpts, FdStore, NotifyHooks};
pub use error::{CradleError, CradleResult, EngineError, ProcessError, ValidationError};
pub use job::registry::JobRegistry;
pub use job::state::{JobState, JobStateMachine};
pub use job::Job;
pub use plugins::{CapabilityTable, Feature, PluginLoader, PluginRegistry};
pub use storage::{MemoryStore, Store};
pub use types::{Jid, JobDetails, JobKind, ProcessState};
