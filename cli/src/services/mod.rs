//! Services layer - orchestration logic
//!
//! This module coordinates between domain logic and infrastructure.
//! Services drive domain types against a provisioning backend and handle
//! the run-time signals (approvals, cancellation).

pub mod approval;
pub mod cancel;
pub mod orchestrator;

// Re-export commonly used types
pub use approval::Approvals;
pub use cancel::CancelHandle;
pub use orchestrator::{
    PipelineOrchestrator, PipelineRun, PipelineSnapshot, RunOutcome, StageStatus,
    StageTransition,
};
