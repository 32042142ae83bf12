//! Infrastructure layer - external I/O adapters
//!
//! This module contains the seam to the resource engine:
//! - The provisioning backend trait
//! - A dry-run backend that records requests instead of applying them

pub mod backend;
pub mod dry_run;

// Re-export commonly used types
pub use backend::ProvisioningBackend;
pub use dry_run::{BackendCall, BackendOperation, DryRunBackend};
