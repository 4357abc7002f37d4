pub mod checks;
pub mod pass;

pub use checks::{AnomalyCounts, StoreView};
pub use pass::{OpReport, RepairFailure, RepairOp, RepairPass, RepairReport};
