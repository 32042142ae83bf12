//! Provisioning backend port
//!
//! The resource engine that actually creates databases and compute lives
//! outside this crate. The core only builds validated requests and hands
//! them over through this trait.

use async_trait::async_trait;

use crate::domain::database::{DatabaseHandle, DatabaseProvisioningSpec};
use crate::domain::stage::{ComputeHandle, ComputeRequest};
use crate::error::BackendError;

/// Operations the core needs from a provisioning backend.
///
/// Implementations are expected to reconcile idempotently: re-submitting a
/// request that was already applied must not create a duplicate resource.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Create or reconcile a managed database cluster
    async fn declare_database(
        &self,
        spec: &DatabaseProvisioningSpec,
    ) -> Result<DatabaseHandle, BackendError>;

    /// Create or reconcile an autoscaled compute tier
    async fn declare_compute(&self, request: &ComputeRequest)
        -> Result<ComputeHandle, BackendError>;

    /// Publish a named parameter for out-of-band consumers
    async fn publish_parameter(&self, key: &str, value: &str) -> Result<(), BackendError>;
}
