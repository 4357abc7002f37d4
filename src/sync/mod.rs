pub mod checkpoint;
pub mod connectivity;
pub mod engine;
pub mod listener;
pub mod merge;
pub mod scheduler;
pub mod types;

pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use engine::ReconcileEngine;
pub use listener::{ChangeListener, ChangeOutcome};
pub use scheduler::ReconcileScheduler;
pub use types::{
    EngineStatus, MergeStats, PhaseCallback, ReconcileOptions, ReconcileReport,
    RemoteRepairStats, SyncErrorCallback, SyncErrorEvent, SyncErrorKind, SyncPhase, Trigger,
};
