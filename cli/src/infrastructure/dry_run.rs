//! In-memory provisioning backend
//!
//! Records every request it receives and returns synthetic handles.
//! Used by `stagecraft run` and throughout the test suite.

use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::info;

use crate::domain::database::{DatabaseHandle, DatabaseProvisioningSpec};
use crate::domain::scaling::Capacity;
use crate::domain::stage::{ComputeHandle, ComputeRequest, ComputeRole};
use crate::error::BackendError;
use crate::infrastructure::backend::ProvisioningBackend;

/// Backend operation, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOperation {
    DeclareDatabase,
    PublishParameter,
    DeclareCompute,
}

/// A request as seen by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    DeclareDatabase {
        name: String,
        engine_version: String,
        min: Capacity,
        max: Capacity,
        idle_suspend: Option<Duration>,
        backup_retention: Duration,
        deletion_protected: bool,
        data_api_enabled: bool,
    },
    PublishParameter {
        key: String,
        value: String,
    },
    DeclareCompute {
        stage: String,
        role: ComputeRole,
        min: Capacity,
        max: Capacity,
        database: Option<DatabaseHandle>,
    },
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    operation: BackendOperation,
    subject: String,
}

/// Backend that applies nothing
#[derive(Debug, Default)]
pub struct DryRunBackend {
    calls: Mutex<Vec<BackendCall>>,
    failures: Vec<InjectedFailure>,
    latency: Option<Duration>,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `operation` whenever its subject contains `subject`.
    ///
    /// Subjects: the cluster name for databases, the key for parameters and
    /// `{stage}/{role}` for compute.
    pub fn fail_on(mut self, operation: BackendOperation, subject: impl Into<String>) -> Self {
        self.failures.push(InjectedFailure {
            operation,
            subject: subject.into(),
        });
        self
    }

    /// Sleep this long inside every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Calls received so far, in order
    pub fn calls(&self) -> Vec<BackendCall> {
        self.log().clone()
    }

    // A panic while holding the lock leaves the history intact, so recover it
    fn log(&self) -> MutexGuard<'_, Vec<BackendCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle(
        &self,
        operation: BackendOperation,
        subject: &str,
        call: BackendCall,
    ) -> Result<(), BackendError> {
        self.log().push(call);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let rejected = self
            .failures
            .iter()
            .any(|f| f.operation == operation && subject.contains(&f.subject));
        if rejected {
            return Err(BackendError::Rejected {
                message: format!("injected failure for {:?} on '{}'", operation, subject),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProvisioningBackend for DryRunBackend {
    async fn declare_database(
        &self,
        spec: &DatabaseProvisioningSpec,
    ) -> Result<DatabaseHandle, BackendError> {
        let call = BackendCall::DeclareDatabase {
            name: spec.name().to_string(),
            engine_version: spec.engine_version().to_string(),
            min: spec.scaling().min(),
            max: spec.scaling().max(),
            idle_suspend: spec.scaling().idle_suspend(),
            backup_retention: spec.backup_retention(),
            deletion_protected: spec.deletion_protected(),
            data_api_enabled: spec.data_api_enabled(),
        };
        self.handle(BackendOperation::DeclareDatabase, spec.name(), call)
            .await?;

        info!(
            cluster = spec.name(),
            engine = spec.engine_version(),
            capacity = %spec.scaling(),
            deletion_protected = spec.deletion_protected(),
            "[dry-run] Declared database"
        );
        Ok(DatabaseHandle {
            endpoint_ref: format!("{}.cluster.dry-run.internal", spec.name()),
            secret_ref: format!("{}-credentials", spec.name()),
        })
    }

    async fn declare_compute(
        &self,
        request: &ComputeRequest,
    ) -> Result<ComputeHandle, BackendError> {
        let subject = format!("{}/{}", request.stage, request.role.name());
        let call = BackendCall::DeclareCompute {
            stage: request.stage.clone(),
            role: request.role,
            min: request.scaling.min(),
            max: request.scaling.max(),
            database: request.database.clone(),
        };
        self.handle(BackendOperation::DeclareCompute, &subject, call)
            .await?;

        info!(
            stage = %request.stage,
            role = request.role.name(),
            capacity = %request.scaling,
            "[dry-run] Declared compute"
        );
        Ok(ComputeHandle {
            service_ref: format!("{}-{}-service", request.stage, request.role.name()),
        })
    }

    async fn publish_parameter(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let call = BackendCall::PublishParameter {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.handle(BackendOperation::PublishParameter, key, call)
            .await?;

        info!(key, "[dry-run] Published parameter");
        Ok(())
    }
}
