pub mod error;
pub mod types;

pub mod backup;
pub mod clock;
pub mod config;
pub mod naming;
pub mod recovery;
pub mod repair;
pub mod schema;
pub mod storage;
pub mod sync;

pub use config::{EngineConfig, OrphanPolicy};
pub use error::{PosSyncError, ReconcileError, RecoveryError, Result};
pub use recovery::{RecoveryEngine, ReconstructionEngine};
pub use repair::RepairPass;
pub use schema::SchemaMirror;
pub use storage::memory::MemoryRemote;
#[cfg(feature = "sqlite")]
pub use storage::sqlite::SqliteStore;
pub use storage::traits::{LocalStore, RemoteStore, StaticTenant, TenantResolver};
pub use sync::{ReconcileEngine, ReconcileOptions, ReconcileReport, ReconcileScheduler};
pub use types::{Filter, OrderStatus, Record};
