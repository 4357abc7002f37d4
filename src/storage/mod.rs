pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod tombstones;
pub mod traits;

/// Key/value bookkeeping table (checkpoints, markers).
pub const META_TABLE: &str = "sync_meta";

/// Queue of local deletions awaiting remote propagation.
pub const TOMBSTONE_TABLE: &str = "sync_tombstones";
