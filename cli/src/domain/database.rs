//! Managed relational datastore requests
//!
//! A [`DatabaseProvisioningSpec`] is a complete, validated request object.
//! It performs no I/O; the provisioning backend turns it into a
//! [`DatabaseHandle`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::scaling::{Capacity, ScalingPolicy};
use crate::error::{BackendError, ConfigurationError};
use crate::infrastructure::ProvisioningBackend;

/// Longest backup retention the backend accepts
pub const MAX_BACKUP_RETENTION: Duration = Duration::from_secs(35 * 24 * 60 * 60);

/// Serverless engine families and their capacity floors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineFamily {
    #[default]
    AuroraPostgresql,
    AuroraMysql,
}

impl EngineFamily {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AuroraPostgresql => "aurora-postgresql",
            Self::AuroraMysql => "aurora-mysql",
        }
    }

    /// Smallest capacity the backend allows for this family
    pub fn platform_floor(&self) -> Capacity {
        match self {
            Self::AuroraPostgresql => 2,
            Self::AuroraMysql => 1,
        }
    }

    /// Pinned engine version used when none is configured.
    ///
    /// Serverless clusters only support one parameter-group family per engine.
    pub fn default_engine_version(&self) -> &'static str {
        match self {
            Self::AuroraPostgresql => "aurora-postgresql10",
            Self::AuroraMysql => "aurora-mysql5.7",
        }
    }
}

/// Handle to a provisioned database.
///
/// Safe to hand to compute actions: it names the secret, never its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseHandle {
    /// Connection endpoint reference
    pub endpoint_ref: String,

    /// Reference to the secret holding connection credentials
    pub secret_ref: String,
}

/// Validated request for one environment's datastore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseProvisioningSpec {
    name: String,
    engine: EngineFamily,
    engine_version: String,
    scaling: ScalingPolicy,
    backup_retention: Duration,
    deletion_protected: bool,
    data_api_enabled: bool,
}

impl DatabaseProvisioningSpec {
    /// Build a spec with deletion protection and the data API enabled.
    ///
    /// `engine_version` falls back to the family's pinned version.
    pub fn new(
        name: impl Into<String>,
        engine: EngineFamily,
        engine_version: Option<String>,
        scaling: ScalingPolicy,
        backup_retention: Duration,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigurationError::InvalidValue {
                field: "database.name".to_string(),
                value: name,
            });
        }

        let engine_version =
            engine_version.unwrap_or_else(|| engine.default_engine_version().to_string());
        if engine_version.trim().is_empty() {
            return Err(ConfigurationError::InvalidValue {
                field: "database.engine_version".to_string(),
                value: engine_version,
            });
        }

        scaling
            .check_floor(engine.platform_floor(), engine.name())
            .map_err(|e| e.within("database"))?;

        if backup_retention > MAX_BACKUP_RETENTION {
            return Err(ConfigurationError::InvalidValue {
                field: "database.backup_retention".to_string(),
                value: format!(
                    "{} (maximum is {})",
                    humantime::format_duration(backup_retention),
                    humantime::format_duration(MAX_BACKUP_RETENTION)
                ),
            });
        }

        Ok(Self {
            name,
            engine,
            engine_version,
            scaling,
            backup_retention,
            deletion_protected: true,
            data_api_enabled: true,
        })
    }

    /// Explicitly set deletion protection. Inheritance never calls this with
    /// `false` unless the operator opted in.
    pub fn with_deletion_protection(mut self, protected: bool) -> Self {
        self.deletion_protected = protected;
        self
    }

    pub fn with_data_api(mut self, enabled: bool) -> Self {
        self.data_api_enabled = enabled;
        self
    }

    /// Cluster identifier derived from a stage name: `dbcluster{stage}`,
    /// lowercased with separators removed.
    pub fn cluster_identifier_for(stage_name: &str) -> String {
        let suffix: String = stage_name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        format!("dbcluster{}", suffix)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> EngineFamily {
        self.engine
    }

    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    /// Parameter group pinning the engine version
    pub fn parameter_group(&self) -> String {
        format!("default.{}", self.engine_version)
    }

    pub fn scaling(&self) -> &ScalingPolicy {
        &self.scaling
    }

    pub fn backup_retention(&self) -> Duration {
        self.backup_retention
    }

    pub fn deletion_protected(&self) -> bool {
        self.deletion_protected
    }

    pub fn data_api_enabled(&self) -> bool {
        self.data_api_enabled
    }

    /// Hand the request to the backend
    pub async fn provision(
        &self,
        backend: &dyn ProvisioningBackend,
    ) -> Result<DatabaseHandle, BackendError> {
        backend.declare_database(self).await
    }
}
