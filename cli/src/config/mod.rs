//! # Pipeline Configuration
//!
//! A pipeline is declared in one YAML file:
//!
//! ```yaml
//! source:
//!   repository: owner/app
//!   branch: main
//! defaults:
//!   domain: example.com
//! stages:
//!   - name: staging
//!     overrides:
//!       subdomain: stage
//!       debug_enabled: true
//!   - name: production
//!     gate:
//!       manual_approval: PromoteToProduction
//! ```
//!
//! `defaults` apply to every stage; each stage's `overrides` replace them
//! key by key. Unknown keys are rejected at every level.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let file = load_pipeline_file(Path::new("pipeline.yaml"))?;
//! let built = file.build()?;
//! for warning in &built.warnings {
//!     println!("{}", warning);
//! }
//! ```

pub mod duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::domain::environment::{EnvironmentConfig, EnvironmentDefaults, EnvironmentOverrides};
use crate::domain::pipeline::{BuiltPipeline, ChangeSource, PipelineDefinition};
use crate::domain::stage::GatePolicy;
use crate::error::ConfigurationError;

/// Default pipeline file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "pipeline.yaml";

/// Top-level pipeline file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
    pub source: ChangeSource,

    #[serde(default)]
    pub defaults: EnvironmentDefaults,

    /// Stages in deploy order
    pub stages: Vec<StageFile>,
}

/// One stage entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageFile {
    pub name: String,

    /// Gate on the transition into this stage
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub gate: GatePolicy,

    #[serde(default)]
    pub overrides: EnvironmentOverrides,
}

impl PipelineFile {
    /// Parse a pipeline file from YAML text
    pub fn from_yaml(content: &str) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(content).map_err(|e| ConfigurationError::ParseError {
            message: e.to_string(),
        })
    }

    /// Build every stage and assemble the pipeline
    pub fn build(&self) -> Result<BuiltPipeline, ConfigurationError> {
        let mut builder = PipelineDefinition::builder(self.source.clone());

        for stage in &self.stages {
            let environment = EnvironmentConfig::builder(stage.name.as_str(), &self.defaults)
                .overrides(stage.overrides.clone())
                .build()?;
            builder = builder.stage(environment, stage.gate.clone());
        }

        builder.build()
    }
}

/// Load and parse a pipeline file from disk
pub fn load_pipeline_file(path: &Path) -> Result<PipelineFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    PipelineFile::from_yaml(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load a pipeline file and build it in one step
pub fn load_pipeline(path: &Path) -> Result<BuiltPipeline> {
    let file = load_pipeline_file(path)?;
    file.build()
        .with_context(|| format!("Invalid pipeline in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::scaling::StepRule;
    use crate::error::ConfigurationWarning;
    use std::io::Write;
    use std::time::Duration;

    const PIPELINE: &str = r#"
source:
  repository: owner/app
  branch: main
defaults:
  domain: example.com
stages:
  - name: staging
    overrides:
      settings_profile: app.settings.stage
      debug_enabled: true
      subdomain: stage
      db_min_capacity: 2
      db_max_capacity: 2
      db_idle_suspend: 5m
      worker_scaling_steps:
        - { threshold: 0, delta: 0 }
        - { threshold: 10, delta: 1 }
  - name: production
    gate:
      manual_approval: PromoteToProduction
    overrides:
      settings_profile: app.settings.prod
      db_idle_suspend: never
"#;

    #[test]
    fn test_parse_and_build() {
        let file = PipelineFile::from_yaml(PIPELINE).unwrap();
        assert!(file.source.trigger_on_push);
        assert_eq!(file.stages.len(), 2);

        let built = file.build().unwrap();
        let staging = built.definition.stage("staging").unwrap().config();
        assert!(staging.debug_enabled());
        assert_eq!(staging.fqdn(), "stage.example.com");
        assert_eq!(staging.database().scaling().min(), 2);
        assert_eq!(staging.database().scaling().max(), 2);
        assert_eq!(
            staging.database().scaling().idle_suspend(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            staging.worker_scaling().step_rules(),
            &[StepRule::new(0, 0), StepRule::new(10, 1)]
        );

        let production = built.definition.stage("production").unwrap();
        assert_eq!(production.gate().label(), Some("PromoteToProduction"));
        assert_eq!(production.config().database().scaling().idle_suspend(), None);
        assert!(production.config().database().deletion_protected());
        assert_eq!(
            production.config().database().backup_retention(),
            Duration::from_secs(86_400)
        );
        assert!(built.warnings.is_empty());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let yaml = PIPELINE.replace("subdomain: stage", "subdomian: stage");
        let err = PipelineFile::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigurationError::ParseError { .. }));
    }

    #[test]
    fn test_negative_duration_rejected_at_parse() {
        let yaml = PIPELINE.replace("db_idle_suspend: 5m", "db_backup_retention: -1day");
        let err = PipelineFile::from_yaml(&yaml).unwrap_err();
        match err {
            ConfigurationError::ParseError { message } => assert!(message.contains("negative")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_stage_in_file() {
        let yaml = PIPELINE.replace("name: production", "name: staging");
        let err = PipelineFile::from_yaml(&yaml).unwrap().build().unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::DuplicateStageName {
                stage: "staging".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_range_scoped_to_tier() {
        let yaml = PIPELINE.replace("db_max_capacity: 2", "db_max_capacity: 1");
        let err = PipelineFile::from_yaml(&yaml).unwrap().build().unwrap_err();
        match err {
            ConfigurationError::InvalidRange { field, min, max } => {
                assert!(field.starts_with("database"));
                assert_eq!((min, max), (2, 1));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unprotected_database_requires_opt_in() {
        let yaml = PIPELINE.replace(
            "settings_profile: app.settings.prod",
            "settings_profile: app.settings.prod\n      db_deletion_protected: false",
        );
        let built = PipelineFile::from_yaml(&yaml).unwrap().build().unwrap();
        let production = built.definition.stage("production").unwrap();
        assert!(production.config().database().deletion_protected());
        assert!(built.warnings.iter().any(|w| matches!(
            w,
            ConfigurationWarning::DeletionProtectionRetained { stage } if stage == "production"
        )));
    }

    #[test]
    fn test_gate_forms() {
        let yaml = "name: production\ngate:\n  manual_approval: PromoteToProduction\n";
        let gated: StageFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(gated.gate, GatePolicy::manual("PromoteToProduction"));

        let explicit: StageFile = serde_yaml::from_str("name: staging\ngate: none\n").unwrap();
        assert_eq!(explicit.gate, GatePolicy::None);

        let omitted: StageFile = serde_yaml::from_str("name: staging\n").unwrap();
        assert_eq!(omitted.gate, GatePolicy::None);
    }

    #[test]
    fn test_gated_stage_round_trip() {
        let stage = StageFile {
            name: "production".to_string(),
            gate: GatePolicy::manual("PromoteToProduction"),
            overrides: EnvironmentOverrides::default(),
        };
        let yaml = serde_yaml::to_string(&stage).unwrap();
        assert!(yaml.contains("manual_approval: PromoteToProduction"));
        assert!(!yaml.contains('!'));

        let parsed: StageFile = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.name, "production");
        assert_eq!(parsed.gate, stage.gate);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PIPELINE.as_bytes()).unwrap();

        let built = load_pipeline(file.path()).unwrap();
        assert_eq!(built.definition.stages().len(), 2);
    }

    #[test]
    fn test_missing_file_has_context() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_pipeline_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read"));
    }
}
