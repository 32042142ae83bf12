//! Domain layer - pure business logic
//!
//! This module contains business logic with no external I/O.
//! Types and functions here can be unit tested without mocking; the only
//! side effects go through the `ProvisioningBackend` trait.

pub mod database;
pub mod environment;
pub mod pipeline;
pub mod scaling;
pub mod stage;

// Re-export commonly used types
pub use database::{DatabaseHandle, DatabaseProvisioningSpec, EngineFamily};
pub use environment::{
    BuiltEnvironment, EnvironmentBuilder, EnvironmentConfig, EnvironmentDefaults,
    EnvironmentOverrides,
};
pub use pipeline::{BuiltPipeline, ChangeEvent, ChangeSource, PipelineBuilder, PipelineDefinition};
pub use scaling::{IdleSuspend, ScalingPolicy, StepRule};
pub use stage::{
    ActionId, ActionKind, ComputeRole, DeploymentStage, FailureCause, GatePolicy,
    ProvisioningPlan, StageOutcome, StageState,
};
