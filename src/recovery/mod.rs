pub mod engine;
pub mod reconstruct;

pub use engine::{RecoveryEngine, RecoveryProgress, RecoveryResult};
pub use reconstruct::{ReconstructionAnalysis, ReconstructionEngine};
