//! Centralized error types for stagecraft
//!
//! Uses thiserror for typed errors that can be matched on,
//! while still being compatible with anyhow for propagation.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::domain::stage::ActionId;

/// Top-level error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigurationError),

    #[error("Stage provisioning error: {0}")]
    Provisioning(#[from] StageProvisioningError),

    #[error("Illegal state transition for stage '{stage}': {from} -> {to}")]
    IllegalTransition {
        stage: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("A run is already in progress for this pipeline")]
    RunInProgress,

    #[error("Run cancelled while stage '{stage}' was waiting at its gate")]
    Cancelled { stage: String },
}

/// Build-time configuration errors. Always fatal to pipeline construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Invalid range for {field}: min {min} exceeds max {max}")]
    InvalidRange { field: String, min: u32, max: u32 },

    #[error("Duplicate step threshold {threshold} in {field}")]
    DuplicateThreshold { field: String, threshold: u64 },

    #[error("{field} minimum {min} is below the platform floor of {floor} for {platform}")]
    BelowPlatformFloor {
        field: String,
        min: u32,
        floor: u32,
        platform: String,
    },

    #[error("Duplicate stage name '{stage}' in pipeline")]
    DuplicateStageName { stage: String },

    #[error("Stages '{first}' and '{second}' both map to database cluster '{cluster}'")]
    DuplicateClusterIdentifier {
        first: String,
        second: String,
        cluster: String,
    },

    #[error("Pipeline must contain at least one stage")]
    EmptyPipeline,

    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },
}

impl ConfigurationError {
    /// Prefix the offending field with the scope it was validated in
    /// (e.g. `scaling` becomes `worker.scaling`).
    pub fn within(self, scope: &str) -> Self {
        let scoped = |field: String| format!("{}.{}", scope, field);
        match self {
            Self::InvalidRange { field, min, max } => Self::InvalidRange {
                field: scoped(field),
                min,
                max,
            },
            Self::DuplicateThreshold { field, threshold } => Self::DuplicateThreshold {
                field: scoped(field),
                threshold,
            },
            Self::BelowPlatformFloor {
                field,
                min,
                floor,
                platform,
            } => Self::BelowPlatformFloor {
                field: scoped(field),
                min,
                floor,
                platform,
            },
            Self::InvalidValue { field, value } => Self::InvalidValue {
                field: scoped(field),
                value,
            },
            other => other,
        }
    }
}

/// Non-fatal findings surfaced to the operator during configuration build
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum ConfigurationWarning {
    /// Debug mode enabled on a production-labeled stage
    DebugInSensitiveEnvironment { stage: String },

    /// An inherited or overridden `deletion_protected: false` was ignored
    /// because `allow_unprotected_database` was not set
    DeletionProtectionRetained { stage: String },

    /// Database idle suspend configured on a production-labeled stage
    IdleSuspendInSensitiveEnvironment {
        stage: String,
        #[serde(with = "crate::config::duration")]
        idle_suspend: Duration,
    },
}

impl ConfigurationWarning {
    pub fn stage(&self) -> &str {
        match self {
            Self::DebugInSensitiveEnvironment { stage }
            | Self::DeletionProtectionRetained { stage }
            | Self::IdleSuspendInSensitiveEnvironment { stage, .. } => stage,
        }
    }
}

impl fmt::Display for ConfigurationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DebugInSensitiveEnvironment { stage } => write!(
                f,
                "Stage '{}' enables debug mode in a production environment",
                stage
            ),
            Self::DeletionProtectionRetained { stage } => write!(
                f,
                "Stage '{}' requested an unprotected database without allow_unprotected_database; deletion protection kept on",
                stage
            ),
            Self::IdleSuspendInSensitiveEnvironment {
                stage,
                idle_suspend,
            } => write!(
                f,
                "Stage '{}' suspends its database after {} of inactivity in a production environment",
                stage,
                humantime::format_duration(*idle_suspend)
            ),
        }
    }
}

/// Errors reported by a provisioning backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend rejected request: {message}")]
    Rejected { message: String },

    #[error("Backend unavailable: {message}")]
    Unavailable { message: String },
}

/// Why a provisioning action did not complete
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningFailure {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("cancelled before the action started")]
    Cancelled,
}

/// Runtime failure of one action in a stage's provisioning plan.
///
/// Carries the actions that had already been applied so the operator can
/// inspect partial state. Nothing is rolled back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Stage '{stage}' failed at action {action}: {cause}")]
pub struct StageProvisioningError {
    pub stage: String,
    pub action: ActionId,
    pub cause: ProvisioningFailure,
    pub completed: Vec<ActionId>,
}

impl StageProvisioningError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, ProvisioningFailure::Cancelled)
    }
}
