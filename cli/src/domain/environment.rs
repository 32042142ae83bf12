//! Per-environment configuration
//!
//! Built in two steps: nested value objects (scaling policies, database spec)
//! are validated first, then the aggregate is assembled and cross-field checks
//! run once. The resulting [`EnvironmentConfig`] is immutable; use
//! [`EnvironmentConfig::derive`] to get a modified copy.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use crate::domain::database::{DatabaseProvisioningSpec, EngineFamily};
use crate::domain::scaling::{
    Capacity, IdleSuspend, ScalingPolicy, StepRule, COMPUTE_PLATFORM_FLOOR,
};
use crate::domain::stage::database_secret_parameter;
use crate::error::{ConfigurationError, ConfigurationWarning};

/// Pipeline-wide defaults applied to every stage before its overrides.
///
/// Passed explicitly into the builder; nothing is read from the process
/// environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentDefaults {
    /// Application settings profile (e.g. "app.settings.prod")
    #[serde(default = "default_settings_profile")]
    pub settings_profile: String,

    #[serde(default)]
    pub debug_enabled: bool,

    /// Apex domain the web tier is served under
    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    pub subdomain: Option<String>,

    #[serde(default)]
    pub db_engine: EngineFamily,

    /// Pinned engine version; the engine family's default when unset
    #[serde(default)]
    pub db_engine_version: Option<String>,

    #[serde(default = "default_db_min_capacity")]
    pub db_min_capacity: Capacity,

    #[serde(default = "default_db_max_capacity")]
    pub db_max_capacity: Capacity,

    #[serde(default = "default_db_idle_suspend")]
    pub db_idle_suspend: IdleSuspend,

    #[serde(
        default = "default_db_backup_retention",
        with = "crate::config::duration"
    )]
    pub db_backup_retention: Duration,

    #[serde(default = "default_true")]
    pub db_deletion_protected: bool,

    #[serde(default = "default_true")]
    pub db_data_api_enabled: bool,

    #[serde(default = "default_min_tasks")]
    pub web_min_tasks: Capacity,

    #[serde(default = "default_max_tasks")]
    pub web_max_tasks: Capacity,

    #[serde(default = "default_min_tasks")]
    pub worker_min_tasks: Capacity,

    #[serde(default = "default_max_tasks")]
    pub worker_max_tasks: Capacity,

    /// Queue-depth step rules for the worker tier
    #[serde(default = "default_worker_scaling_steps")]
    pub worker_scaling_steps: Vec<StepRule>,
}

fn default_settings_profile() -> String {
    "app.settings.prod".to_string()
}

fn default_db_min_capacity() -> Capacity {
    2
}

fn default_db_max_capacity() -> Capacity {
    4 // Limit scaling to limit costs
}

fn default_db_idle_suspend() -> IdleSuspend {
    IdleSuspend::After(Duration::from_secs(30 * 60))
}

fn default_db_backup_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_true() -> bool {
    true
}

fn default_min_tasks() -> Capacity {
    1
}

fn default_max_tasks() -> Capacity {
    4
}

fn default_worker_scaling_steps() -> Vec<StepRule> {
    vec![StepRule::new(0, 0), StepRule::new(10, 1)]
}

impl Default for EnvironmentDefaults {
    fn default() -> Self {
        Self {
            settings_profile: default_settings_profile(),
            debug_enabled: false,
            domain: String::new(),
            subdomain: None,
            db_engine: EngineFamily::default(),
            db_engine_version: None,
            db_min_capacity: default_db_min_capacity(),
            db_max_capacity: default_db_max_capacity(),
            db_idle_suspend: default_db_idle_suspend(),
            db_backup_retention: default_db_backup_retention(),
            db_deletion_protected: true,
            db_data_api_enabled: true,
            web_min_tasks: default_min_tasks(),
            web_max_tasks: default_max_tasks(),
            worker_min_tasks: default_min_tasks(),
            worker_max_tasks: default_max_tasks(),
            worker_scaling_steps: default_worker_scaling_steps(),
        }
    }
}

/// Per-stage overrides. Every field is optional; unset fields inherit the
/// pipeline defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_profile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_min_capacity: Option<Capacity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_max_capacity: Option<Capacity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_idle_suspend: Option<IdleSuspend>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::config::duration::option"
    )]
    pub db_backup_retention: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_deletion_protected: Option<bool>,

    /// Required for `db_deletion_protected: false` to take effect
    #[serde(default)]
    pub allow_unprotected_database: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_min_tasks: Option<Capacity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_max_tasks: Option<Capacity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_min_tasks: Option<Capacity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_max_tasks: Option<Capacity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_scaling_steps: Option<Vec<StepRule>>,
}

/// Immutable configuration of one deployment target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    stage_name: String,
    settings_profile: String,
    debug_enabled: bool,
    domain: String,
    subdomain: Option<String>,
    database: DatabaseProvisioningSpec,
    web_scaling: ScalingPolicy,
    worker_scaling: ScalingPolicy,
}

/// A built environment together with the warnings raised while building it
#[derive(Debug, Clone)]
pub struct BuiltEnvironment {
    pub config: EnvironmentConfig,
    pub warnings: Vec<ConfigurationWarning>,
}

impl From<EnvironmentConfig> for BuiltEnvironment {
    fn from(config: EnvironmentConfig) -> Self {
        Self {
            config,
            warnings: Vec::new(),
        }
    }
}

/// Whether a stage name marks a production-like, publicly reachable target
pub fn is_production_label(stage_name: &str) -> bool {
    stage_name.to_ascii_lowercase().contains("prod")
}

fn stage_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9-]*$").expect("stage name pattern is a valid regex")
    })
}

fn require_non_empty(field: &str, value: String) -> Result<String, ConfigurationError> {
    if value.trim().is_empty() {
        return Err(ConfigurationError::InvalidValue {
            field: field.to_string(),
            value,
        });
    }
    Ok(value)
}

/// Staged builder for [`EnvironmentConfig`]
#[derive(Debug)]
pub struct EnvironmentBuilder<'a> {
    stage_name: String,
    defaults: &'a EnvironmentDefaults,
    overrides: EnvironmentOverrides,
}

impl<'a> EnvironmentBuilder<'a> {
    pub fn overrides(mut self, overrides: EnvironmentOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Validate nested values, assemble the aggregate, run cross-field checks.
    pub fn build(self) -> Result<BuiltEnvironment, ConfigurationError> {
        let Self {
            stage_name,
            defaults,
            overrides: o,
        } = self;

        if !stage_name_pattern().is_match(&stage_name) {
            return Err(ConfigurationError::InvalidValue {
                field: "stage_name".to_string(),
                value: stage_name,
            });
        }

        let settings_profile = require_non_empty(
            "settings_profile",
            o.settings_profile
                .unwrap_or_else(|| defaults.settings_profile.clone()),
        )?;
        let domain = require_non_empty(
            "domain",
            o.domain.unwrap_or_else(|| defaults.domain.clone()),
        )?;
        let subdomain = match o.subdomain.or_else(|| defaults.subdomain.clone()) {
            Some(sub) => Some(require_non_empty("subdomain", sub)?),
            None => None,
        };
        let debug_enabled = o.debug_enabled.unwrap_or(defaults.debug_enabled);

        // (a) nested values, bottom-up
        let idle_suspend = o
            .db_idle_suspend
            .unwrap_or(defaults.db_idle_suspend)
            .as_duration();
        let db_scaling = ScalingPolicy::new(
            o.db_min_capacity.unwrap_or(defaults.db_min_capacity),
            o.db_max_capacity.unwrap_or(defaults.db_max_capacity),
        )
        .map_err(|e| e.within("database"))?
        .with_idle_suspend(idle_suspend);

        let requested_protection = o
            .db_deletion_protected
            .unwrap_or(defaults.db_deletion_protected);
        let deletion_protected = requested_protection || !o.allow_unprotected_database;

        let database = DatabaseProvisioningSpec::new(
            DatabaseProvisioningSpec::cluster_identifier_for(&stage_name),
            defaults.db_engine,
            defaults.db_engine_version.clone(),
            db_scaling,
            o.db_backup_retention.unwrap_or(defaults.db_backup_retention),
        )?
        .with_deletion_protection(deletion_protected)
        .with_data_api(defaults.db_data_api_enabled);

        let web_scaling = compute_policy(
            "web",
            o.web_min_tasks.unwrap_or(defaults.web_min_tasks),
            o.web_max_tasks.unwrap_or(defaults.web_max_tasks),
            Vec::new(),
        )?;
        let worker_scaling = compute_policy(
            "worker",
            o.worker_min_tasks.unwrap_or(defaults.worker_min_tasks),
            o.worker_max_tasks.unwrap_or(defaults.worker_max_tasks),
            o.worker_scaling_steps
                .unwrap_or_else(|| defaults.worker_scaling_steps.clone()),
        )?;

        // (b) cross-field checks, exactly once
        let mut warnings = Vec::new();
        let production = is_production_label(&stage_name);

        if debug_enabled && production {
            warnings.push(ConfigurationWarning::DebugInSensitiveEnvironment {
                stage: stage_name.clone(),
            });
        }
        if !requested_protection && deletion_protected {
            warnings.push(ConfigurationWarning::DeletionProtectionRetained {
                stage: stage_name.clone(),
            });
        }
        if let (true, Some(idle)) = (production, idle_suspend) {
            warnings.push(ConfigurationWarning::IdleSuspendInSensitiveEnvironment {
                stage: stage_name.clone(),
                idle_suspend: idle,
            });
        }

        Ok(BuiltEnvironment {
            config: EnvironmentConfig {
                stage_name,
                settings_profile,
                debug_enabled,
                domain,
                subdomain,
                database,
                web_scaling,
                worker_scaling,
            },
            warnings,
        })
    }
}

fn compute_policy(
    tier: &str,
    min: Capacity,
    max: Capacity,
    steps: Vec<StepRule>,
) -> Result<ScalingPolicy, ConfigurationError> {
    let policy = ScalingPolicy::new(min, max)
        .and_then(|p| p.with_step_rules(steps))
        .map_err(|e| e.within(tier))?;
    policy
        .check_floor(COMPUTE_PLATFORM_FLOOR, "compute")
        .map_err(|e| e.within(tier))?;
    Ok(policy)
}

impl EnvironmentConfig {
    pub fn builder(
        stage_name: impl Into<String>,
        defaults: &EnvironmentDefaults,
    ) -> EnvironmentBuilder<'_> {
        EnvironmentBuilder {
            stage_name: stage_name.into(),
            defaults,
            overrides: EnvironmentOverrides::default(),
        }
    }

    /// Build a new environment that inherits from this one.
    ///
    /// Deletion protection is never inherited as `false`: the new stage needs
    /// its own `allow_unprotected_database` to turn it off.
    pub fn derive(
        &self,
        stage_name: impl Into<String>,
        overrides: EnvironmentOverrides,
    ) -> Result<BuiltEnvironment, ConfigurationError> {
        let defaults = self.as_defaults();
        EnvironmentConfig::builder(stage_name, &defaults)
            .overrides(overrides)
            .build()
    }

    /// This configuration expressed as a defaults object
    pub fn as_defaults(&self) -> EnvironmentDefaults {
        EnvironmentDefaults {
            settings_profile: self.settings_profile.clone(),
            debug_enabled: self.debug_enabled,
            domain: self.domain.clone(),
            subdomain: self.subdomain.clone(),
            db_engine: self.database.engine(),
            db_engine_version: Some(self.database.engine_version().to_string()),
            db_min_capacity: self.database.scaling().min(),
            db_max_capacity: self.database.scaling().max(),
            db_idle_suspend: self.database.scaling().idle_suspend().into(),
            db_backup_retention: self.database.backup_retention(),
            db_deletion_protected: self.database.deletion_protected(),
            db_data_api_enabled: self.database.data_api_enabled(),
            web_min_tasks: self.web_scaling.min(),
            web_max_tasks: self.web_scaling.max(),
            worker_min_tasks: self.worker_scaling.min(),
            worker_max_tasks: self.worker_scaling.max(),
            worker_scaling_steps: self.worker_scaling.step_rules().to_vec(),
        }
    }

    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    pub fn settings_profile(&self) -> &str {
        &self.settings_profile
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug_enabled
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn subdomain(&self) -> Option<&str> {
        self.subdomain.as_deref()
    }

    pub fn database(&self) -> &DatabaseProvisioningSpec {
        &self.database
    }

    pub fn web_scaling(&self) -> &ScalingPolicy {
        &self.web_scaling
    }

    pub fn worker_scaling(&self) -> &ScalingPolicy {
        &self.worker_scaling
    }

    /// Fully qualified host name the web tier answers on
    pub fn fqdn(&self) -> String {
        match &self.subdomain {
            Some(sub) => format!("{}.{}", sub, self.domain),
            None => self.domain.clone(),
        }
    }

    /// Runtime variables handed to both compute tiers
    pub fn application_environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "SETTINGS_MODULE".to_string(),
            self.settings_profile.clone(),
        );
        env.insert(
            "DEBUG".to_string(),
            if self.debug_enabled { "True" } else { "False" }.to_string(),
        );
        env.insert("DOMAIN_NAME".to_string(), self.domain.clone());
        if let Some(sub) = &self.subdomain {
            env.insert("SUBDOMAIN".to_string(), sub.clone());
        }
        env.insert(
            "DB_SECRET_PARAM".to_string(),
            database_secret_parameter(&self.stage_name),
        );
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> EnvironmentDefaults {
        EnvironmentDefaults {
            domain: "scalabledjango.com".to_string(),
            ..EnvironmentDefaults::default()
        }
    }

    fn staging_overrides() -> EnvironmentOverrides {
        EnvironmentOverrides {
            settings_profile: Some("app.settings.stage".to_string()),
            debug_enabled: Some(true),
            subdomain: Some("stage".to_string()),
            db_min_capacity: Some(2),
            db_max_capacity: Some(2),
            db_idle_suspend: Some(IdleSuspend::After(Duration::from_secs(300))),
            web_min_tasks: Some(1),
            web_max_tasks: Some(2),
            worker_min_tasks: Some(1),
            worker_max_tasks: Some(2),
            worker_scaling_steps: Some(vec![StepRule::new(0, 0), StepRule::new(10, 1)]),
            ..EnvironmentOverrides::default()
        }
    }

    #[test]
    fn test_defaults_apply_when_not_overridden() {
        let defaults = defaults();
        let built = EnvironmentConfig::builder("production", &defaults)
            .build()
            .unwrap();
        let config = built.config;

        assert_eq!(config.settings_profile(), "app.settings.prod");
        assert!(!config.debug_enabled());
        assert_eq!(config.fqdn(), "scalabledjango.com");
        assert_eq!(config.database().scaling().min(), 2);
        assert_eq!(config.database().scaling().max(), 4);
        assert_eq!(config.database().name(), "dbclusterproduction");
        assert!(config.database().deletion_protected());
        assert_eq!(config.worker_scaling().step_rules().len(), 2);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let defaults = defaults();
        let built = EnvironmentConfig::builder("staging", &defaults)
            .overrides(staging_overrides())
            .build()
            .unwrap();
        let config = built.config;

        assert!(built.warnings.is_empty());
        assert_eq!(config.fqdn(), "stage.scalabledjango.com");
        assert!(config.database().scaling().is_fixed());
        assert_eq!(
            config.database().scaling().idle_suspend(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.web_scaling().max(), 2);
        assert_eq!(config.worker_scaling().resolve(10), 2);
    }

    #[test]
    fn test_debug_in_production_warns() {
        let defaults = defaults();
        let built = EnvironmentConfig::builder("production", &defaults)
            .overrides(EnvironmentOverrides {
                debug_enabled: Some(true),
                db_idle_suspend: Some(IdleSuspend::Never),
                ..EnvironmentOverrides::default()
            })
            .build()
            .unwrap();

        assert_eq!(
            built.warnings,
            vec![ConfigurationWarning::DebugInSensitiveEnvironment {
                stage: "production".to_string()
            }]
        );
    }

    #[test]
    fn test_idle_suspend_in_production_warns() {
        let defaults = defaults();
        let built = EnvironmentConfig::builder("prod-eu", &defaults)
            .build()
            .unwrap();
        assert!(matches!(
            built.warnings.as_slice(),
            [ConfigurationWarning::IdleSuspendInSensitiveEnvironment { .. }]
        ));
    }

    #[test]
    fn test_unprotect_without_flag_is_retained() {
        let defaults = defaults();
        let built = EnvironmentConfig::builder("staging", &defaults)
            .overrides(EnvironmentOverrides {
                db_deletion_protected: Some(false),
                ..EnvironmentOverrides::default()
            })
            .build()
            .unwrap();

        assert!(built.config.database().deletion_protected());
        assert_eq!(
            built.warnings,
            vec![ConfigurationWarning::DeletionProtectionRetained {
                stage: "staging".to_string()
            }]
        );
    }

    #[test]
    fn test_inherited_unprotect_is_retained() {
        let defaults = EnvironmentDefaults {
            db_deletion_protected: false,
            ..defaults()
        };
        let built = EnvironmentConfig::builder("staging", &defaults)
            .build()
            .unwrap();
        assert!(built.config.database().deletion_protected());
        assert_eq!(built.warnings.len(), 1);
    }

    #[test]
    fn test_explicit_unprotect_honored() {
        let defaults = defaults();
        let built = EnvironmentConfig::builder("staging", &defaults)
            .overrides(EnvironmentOverrides {
                db_deletion_protected: Some(false),
                allow_unprotected_database: true,
                ..EnvironmentOverrides::default()
            })
            .build()
            .unwrap();
        assert!(!built.config.database().deletion_protected());
        assert!(built.warnings.is_empty());
    }

    #[test]
    fn test_derive_does_not_inherit_unprotected_database() {
        let defaults = defaults();
        let scratch = EnvironmentConfig::builder("scratch", &defaults)
            .overrides(EnvironmentOverrides {
                db_deletion_protected: Some(false),
                allow_unprotected_database: true,
                ..EnvironmentOverrides::default()
            })
            .build()
            .unwrap()
            .config;

        let derived = scratch
            .derive("scratch-two", EnvironmentOverrides::default())
            .unwrap();
        assert!(derived.config.database().deletion_protected());
        assert!(!scratch.database().deletion_protected());
        assert_eq!(derived.config.database().name(), "dbclusterscratchtwo");
    }

    #[test]
    fn test_retention_and_protection_round_trip() {
        let defaults = defaults();
        let staging = EnvironmentConfig::builder("staging", &defaults)
            .overrides(EnvironmentOverrides {
                db_backup_retention: Some(Duration::from_secs(24 * 60 * 60)),
                ..EnvironmentOverrides::default()
            })
            .build()
            .unwrap()
            .config;

        let derived = staging
            .derive("staging-copy", EnvironmentOverrides::default())
            .unwrap()
            .config;
        assert_eq!(
            derived.database().backup_retention(),
            Duration::from_secs(24 * 60 * 60)
        );
        assert!(derived.database().deletion_protected());
        assert_eq!(derived.web_scaling(), staging.web_scaling());
    }

    #[test]
    fn test_invalid_scaling_scoped_by_tier() {
        let defaults = defaults();
        let err = EnvironmentConfig::builder("staging", &defaults)
            .overrides(EnvironmentOverrides {
                worker_min_tasks: Some(5),
                worker_max_tasks: Some(2),
                ..EnvironmentOverrides::default()
            })
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::InvalidRange {
                field: "worker.scaling".to_string(),
                min: 5,
                max: 2,
            }
        );
    }

    #[test]
    fn test_zero_web_tasks_below_floor() {
        let defaults = defaults();
        let err = EnvironmentConfig::builder("staging", &defaults)
            .overrides(EnvironmentOverrides {
                web_min_tasks: Some(0),
                ..EnvironmentOverrides::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::BelowPlatformFloor { .. }));
    }

    #[test]
    fn test_database_below_floor() {
        let defaults = defaults();
        let err = EnvironmentConfig::builder("staging", &defaults)
            .overrides(EnvironmentOverrides {
                db_min_capacity: Some(1),
                ..EnvironmentOverrides::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::BelowPlatformFloor { floor: 2, .. }
        ));
    }

    #[test]
    fn test_missing_domain_rejected() {
        let defaults = EnvironmentDefaults::default();
        let err = EnvironmentConfig::builder("staging", &defaults)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InvalidValue { ref field, .. } if field == "domain"
        ));
    }

    #[test]
    fn test_stage_name_must_be_parameter_safe() {
        let defaults = defaults();
        for bad in ["", "9lives", "staging/eu", "two words"] {
            assert!(
                EnvironmentConfig::builder(bad, &defaults).build().is_err(),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_application_environment() {
        let defaults = defaults();
        let config = EnvironmentConfig::builder("staging", &defaults)
            .overrides(staging_overrides())
            .build()
            .unwrap()
            .config;
        let env = config.application_environment();
        assert_eq!(env["SETTINGS_MODULE"], "app.settings.stage");
        assert_eq!(env["DEBUG"], "True");
        assert_eq!(env["SUBDOMAIN"], "stage");
        assert_eq!(env["DB_SECRET_PARAM"], "/staging/DatabaseSecretNameParam");
    }

    #[test]
    fn test_overrides_reject_unknown_keys() {
        let err = serde_yaml::from_str::<EnvironmentOverrides>("db_min_capacty: 2").unwrap_err();
        assert!(err.to_string().contains("db_min_capacty"));
    }
}
