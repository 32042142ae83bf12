//! Deployment stages, their provisioning plans and lifecycle states

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use tracing::{debug, info};

use crate::domain::database::DatabaseHandle;
use crate::domain::environment::EnvironmentConfig;
use crate::domain::scaling::ScalingPolicy;
use crate::error::{BackendError, ProvisioningFailure, StageProvisioningError};
use crate::infrastructure::ProvisioningBackend;
use crate::services::cancel::CancelHandle;

/// Key under which a stage's database secret reference is published
pub fn database_secret_parameter(stage_name: &str) -> String {
    format!("/{}/DatabaseSecretNameParam", stage_name)
}

/// Policy evaluated on the transition into a stage.
///
/// Pipeline files write it as `none` or `manual_approval: <label>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    #[default]
    None,
    /// Wait for an external approval signal with this label
    ManualApproval(String),
}

impl GatePolicy {
    pub fn manual(label: impl Into<String>) -> Self {
        Self::ManualApproval(label.into())
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::ManualApproval(label) => Some(label),
        }
    }
}

/// Compute tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeRole {
    Web,
    Worker,
}

impl ComputeRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Worker => "worker",
        }
    }
}

/// Kind of a provisioning action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    DeclareDatabase,
    ExportDatabaseSecret,
    DeclareCompute(ComputeRole),
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeclareDatabase => write!(f, "declare database"),
            Self::ExportDatabaseSecret => write!(f, "export database secret"),
            Self::DeclareCompute(role) => write!(f, "declare {} compute", role.name()),
        }
    }
}

/// Fixed action order. Compute depends on the database handle and the worker
/// tier may reference the web tier's queue.
pub const ACTION_SEQUENCE: [ActionKind; 4] = [
    ActionKind::DeclareDatabase,
    ActionKind::ExportDatabaseSecret,
    ActionKind::DeclareCompute(ComputeRole::Web),
    ActionKind::DeclareCompute(ComputeRole::Worker),
];

/// Identity of one action within a stage's plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId {
    pub index: usize,
    pub kind: ActionKind,
}

impl ActionId {
    pub fn new(index: usize, kind: ActionKind) -> Self {
        Self { index, kind }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.index + 1, self.kind)
    }
}

/// One entry of a [`ProvisioningPlan`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub id: ActionId,
    pub summary: String,
}

/// Ordered list of actions for one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningPlan {
    pub stage: String,
    pub actions: Vec<PlannedAction>,
}

impl ProvisioningPlan {
    pub fn kinds(&self) -> Vec<ActionKind> {
        self.actions.iter().map(|a| a.id.kind).collect()
    }
}

/// Request for one compute tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeRequest {
    pub stage: String,
    pub role: ComputeRole,
    pub scaling: ScalingPolicy,
    pub database: Option<DatabaseHandle>,
    pub environment: BTreeMap<String, String>,
}

/// Handle to a provisioned compute tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeHandle {
    pub service_ref: String,
}

/// Everything a successful stage produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: String,
    pub database: DatabaseHandle,
    pub parameter_key: String,
    pub web: ComputeHandle,
    pub worker: ComputeHandle,
    pub applied: Vec<ActionId>,
}

/// Why a stage ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Backend,
    Cancelled,
}

/// Lifecycle of one stage within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Gated,
    Approved,
    Provisioning,
    Succeeded,
    Failed(FailureCause),
}

impl StageState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Gated => "gated",
            Self::Approved => "approved",
            Self::Provisioning => "provisioning",
            Self::Succeeded => "succeeded",
            Self::Failed(FailureCause::Backend) => "failed",
            Self::Failed(FailureCause::Cancelled) => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }

    /// Legal edges of the stage state machine. `Gated` is skipped for
    /// ungated stages.
    pub fn can_transition_to(&self, next: StageState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Gated)
                | (Self::Pending, Self::Approved)
                | (Self::Gated, Self::Approved)
                | (Self::Approved, Self::Provisioning)
                | (Self::Provisioning, Self::Succeeded)
                | (Self::Provisioning, Self::Failed(_))
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One environment bound to its entry gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStage {
    config: EnvironmentConfig,
    gate: GatePolicy,
}

impl DeploymentStage {
    pub fn new(config: EnvironmentConfig, gate: GatePolicy) -> Self {
        Self { config, gate }
    }

    pub fn name(&self) -> &str {
        self.config.stage_name()
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn gate(&self) -> &GatePolicy {
        &self.gate
    }

    /// Ordered actions this stage will submit, without touching the backend
    pub fn plan(&self) -> ProvisioningPlan {
        let actions = ACTION_SEQUENCE
            .iter()
            .enumerate()
            .map(|(index, kind)| PlannedAction {
                id: ActionId::new(index, *kind),
                summary: self.summarize(*kind),
            })
            .collect();

        ProvisioningPlan {
            stage: self.name().to_string(),
            actions,
        }
    }

    fn summarize(&self, kind: ActionKind) -> String {
        let db = self.config.database();
        match kind {
            ActionKind::DeclareDatabase => format!(
                "{} ({}, {} ACU, backups {}, deletion protection {})",
                db.name(),
                db.parameter_group(),
                db.scaling(),
                humantime::format_duration(db.backup_retention()),
                if db.deletion_protected() { "on" } else { "off" }
            ),
            ActionKind::ExportDatabaseSecret => {
                database_secret_parameter(self.name())
            }
            ActionKind::DeclareCompute(ComputeRole::Web) => format!(
                "{} tasks serving {}",
                self.config.web_scaling(),
                self.config.fqdn()
            ),
            ActionKind::DeclareCompute(ComputeRole::Worker) => {
                format!("{} tasks", self.config.worker_scaling())
            }
        }
    }

    /// Submit this stage's plan to the backend.
    ///
    /// Actions run strictly in plan order. Cancellation is checked between
    /// actions only; an action that has started always runs to completion.
    /// The first failure aborts the rest and nothing already applied is
    /// rolled back.
    pub async fn resolve(
        &self,
        backend: &dyn ProvisioningBackend,
        cancel: &CancelHandle,
    ) -> Result<StageOutcome, StageProvisioningError> {
        let mut run = PlanExecution::new(self.name(), cancel);
        info!(stage = self.name(), "Provisioning stage");

        let database = run
            .step(
                ActionKind::DeclareDatabase,
                self.config.database().provision(backend),
            )
            .await?;

        let parameter_key = database_secret_parameter(self.name());
        run.step(
            ActionKind::ExportDatabaseSecret,
            backend.publish_parameter(&parameter_key, &database.secret_ref),
        )
        .await?;

        let web_request = self.compute_request(ComputeRole::Web, &database);
        let web = run
            .step(
                ActionKind::DeclareCompute(ComputeRole::Web),
                backend.declare_compute(&web_request),
            )
            .await?;

        let worker_request = self.compute_request(ComputeRole::Worker, &database);
        let worker = run
            .step(
                ActionKind::DeclareCompute(ComputeRole::Worker),
                backend.declare_compute(&worker_request),
            )
            .await?;

        Ok(StageOutcome {
            stage: self.name().to_string(),
            database,
            parameter_key,
            web,
            worker,
            applied: run.completed,
        })
    }

    fn compute_request(&self, role: ComputeRole, database: &DatabaseHandle) -> ComputeRequest {
        let scaling = match role {
            ComputeRole::Web => self.config.web_scaling(),
            ComputeRole::Worker => self.config.worker_scaling(),
        };
        ComputeRequest {
            stage: self.name().to_string(),
            role,
            scaling: scaling.clone(),
            database: Some(database.clone()),
            environment: self.config.application_environment(),
        }
    }
}

/// Tracks progress through a plan and turns failures into stage errors
struct PlanExecution<'a> {
    stage: &'a str,
    cancel: &'a CancelHandle,
    completed: Vec<ActionId>,
}

impl<'a> PlanExecution<'a> {
    fn new(stage: &'a str, cancel: &'a CancelHandle) -> Self {
        Self {
            stage,
            cancel,
            completed: Vec::new(),
        }
    }

    async fn step<T, F>(&mut self, kind: ActionKind, action: F) -> Result<T, StageProvisioningError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        let id = ActionId::new(self.completed.len(), kind);

        if self.cancel.is_cancelled() {
            info!(stage = self.stage, action = %id, "Cancellation requested, stopping before action");
            return Err(self.failure(id, ProvisioningFailure::Cancelled));
        }

        debug!(stage = self.stage, action = %id, "Starting action");
        match action.await {
            Ok(value) => {
                self.completed.push(id);
                Ok(value)
            }
            Err(e) => Err(self.failure(id, e.into())),
        }
    }

    fn failure(&self, action: ActionId, cause: ProvisioningFailure) -> StageProvisioningError {
        StageProvisioningError {
            stage: self.stage.to_string(),
            action,
            cause,
            completed: self.completed.clone(),
        }
    }
}
