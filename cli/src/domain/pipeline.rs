//! Pipeline definitions: ordered stages plus the change source that triggers them

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::domain::environment::BuiltEnvironment;
use crate::domain::stage::{DeploymentStage, GatePolicy};
use crate::error::{ConfigurationError, ConfigurationWarning};

/// Repository and branch whose pushes start a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeSource {
    /// Repository in `owner/name` form
    pub repository: String,

    pub branch: String,

    #[serde(default = "default_trigger_on_push")]
    pub trigger_on_push: bool,

    /// Parameter holding the source-control connection identifier
    #[serde(default = "default_connection_param")]
    pub connection_param: String,
}

fn default_trigger_on_push() -> bool {
    true
}

fn default_connection_param() -> String {
    "/stagecraft/source-connection".to_string()
}

impl ChangeSource {
    pub fn new(repository: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
            trigger_on_push: default_trigger_on_push(),
            connection_param: default_connection_param(),
        }
    }

    /// Validate the source reference
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let valid_repository = self
            .repository
            .split_once('/')
            .map(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'))
            .unwrap_or(false);
        if !valid_repository {
            return Err(ConfigurationError::InvalidValue {
                field: "source.repository".to_string(),
                value: self.repository.clone(),
            });
        }
        if self.branch.trim().is_empty() {
            return Err(ConfigurationError::InvalidValue {
                field: "source.branch".to_string(),
                value: self.branch.clone(),
            });
        }
        if !self.connection_param.starts_with('/') {
            return Err(ConfigurationError::InvalidValue {
                field: "source.connection_param".to_string(),
                value: self.connection_param.clone(),
            });
        }
        Ok(())
    }

    /// Whether a push event should start a run
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.trigger_on_push && event.repository == self.repository && event.branch == self.branch
    }
}

/// A push observed on some repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub repository: String,
    pub branch: String,
}

impl ChangeEvent {
    pub fn push(repository: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
        }
    }
}

/// Validated, immutable pipeline: at least one stage, unique stage names
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    source: ChangeSource,
    stages: Vec<DeploymentStage>,
}

impl PipelineDefinition {
    pub fn builder(source: ChangeSource) -> PipelineBuilder {
        PipelineBuilder {
            source,
            stages: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn source(&self) -> &ChangeSource {
        &self.source
    }

    pub fn stages(&self) -> &[DeploymentStage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&DeploymentStage> {
        self.stages.iter().find(|s| s.name() == name)
    }
}

/// A built pipeline together with every stage's warnings
#[derive(Debug, Clone)]
pub struct BuiltPipeline {
    pub definition: PipelineDefinition,
    pub warnings: Vec<ConfigurationWarning>,
}

/// Assembles stages in deploy order
#[derive(Debug)]
pub struct PipelineBuilder {
    source: ChangeSource,
    stages: Vec<DeploymentStage>,
    warnings: Vec<ConfigurationWarning>,
}

impl PipelineBuilder {
    /// Append a stage. `gate` guards the transition into it.
    pub fn stage(mut self, environment: impl Into<BuiltEnvironment>, gate: GatePolicy) -> Self {
        let BuiltEnvironment { config, warnings } = environment.into();
        self.warnings.extend(warnings);
        self.stages.push(DeploymentStage::new(config, gate));
        self
    }

    pub fn build(self) -> Result<BuiltPipeline, ConfigurationError> {
        self.source.validate()?;

        if self.stages.is_empty() {
            return Err(ConfigurationError::EmptyPipeline);
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name()) {
                return Err(ConfigurationError::DuplicateStageName {
                    stage: stage.name().to_string(),
                });
            }
        }

        // Distinct names can still derive the same cluster (`stage-1`, `Stage1`)
        let mut clusters: HashMap<&str, &str> = HashMap::new();
        for stage in &self.stages {
            let cluster = stage.config().database().name();
            if let Some(first) = clusters.insert(cluster, stage.name()) {
                return Err(ConfigurationError::DuplicateClusterIdentifier {
                    first: first.to_string(),
                    second: stage.name().to_string(),
                    cluster: cluster.to_string(),
                });
            }
        }

        for stage in &self.stages {
            if let GatePolicy::ManualApproval(label) = stage.gate() {
                if label.trim().is_empty() {
                    return Err(ConfigurationError::InvalidValue {
                        field: format!("{}.gate", stage.name()),
                        value: label.clone(),
                    });
                }
            }
        }

        for warning in &self.warnings {
            warn!(stage = warning.stage(), "{}", warning);
        }

        Ok(BuiltPipeline {
            definition: PipelineDefinition {
                source: self.source,
                stages: self.stages,
            },
            warnings: self.warnings,
        })
    }
}
