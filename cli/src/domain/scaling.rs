//! Autoscaling ranges and queue-depth step rules
//!
//! A [`ScalingPolicy`] is validated when it is constructed. Everything after
//! construction is a pure function of its fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ConfigurationError;

/// Abstract unit of provisioned capacity (database ACUs or compute tasks)
pub type Capacity = u32;

/// Absolute minimum task count for a web or worker tier
pub const COMPUTE_PLATFORM_FLOOR: Capacity = 1;

/// One step of a step-scaling function.
///
/// The rule applies once the load metric reaches `threshold`. Metrics are
/// unsigned, so the first interval always starts at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepRule {
    /// Lower bound of the metric interval (e.g. queued messages)
    pub threshold: u64,

    /// Capacity change applied when the metric is at or above `threshold`
    pub delta: i32,
}

impl StepRule {
    pub fn new(threshold: u64, delta: i32) -> Self {
        Self { threshold, delta }
    }
}

/// Idle-suspend setting as written in configuration: a duration or `never`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IdleSuspend {
    After(Duration),
    Never,
}

impl IdleSuspend {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::After(duration) => Some(*duration),
            Self::Never => None,
        }
    }
}

impl From<Option<Duration>> for IdleSuspend {
    fn from(value: Option<Duration>) -> Self {
        value.map_or(Self::Never, Self::After)
    }
}

impl TryFrom<String> for IdleSuspend {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().eq_ignore_ascii_case("never") {
            return Ok(Self::Never);
        }
        crate::config::duration::parse(&value).map(Self::After)
    }
}

impl From<IdleSuspend> for String {
    fn from(value: IdleSuspend) -> Self {
        match value {
            IdleSuspend::After(duration) => humantime::format_duration(duration).to_string(),
            IdleSuspend::Never => "never".to_string(),
        }
    }
}

/// Bounded capacity range for one autoscaled resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingPolicy {
    min: Capacity,
    max: Capacity,
    idle_suspend: Option<Duration>,
    step_rules: Vec<StepRule>,
}

impl ScalingPolicy {
    /// Create a policy without step rules. Fails fast when `min > max`.
    pub fn new(min: Capacity, max: Capacity) -> Result<Self, ConfigurationError> {
        if min > max {
            return Err(ConfigurationError::InvalidRange {
                field: "scaling".to_string(),
                min,
                max,
            });
        }

        Ok(Self {
            min,
            max,
            idle_suspend: None,
            step_rules: Vec::new(),
        })
    }

    /// Attach step rules, sorting them by threshold.
    ///
    /// Two rules with the same threshold are ambiguous and rejected.
    pub fn with_step_rules(
        mut self,
        rules: impl IntoIterator<Item = StepRule>,
    ) -> Result<Self, ConfigurationError> {
        let mut rules: Vec<StepRule> = rules.into_iter().collect();
        rules.sort_by_key(|rule| rule.threshold);

        if let Some(pair) = rules.windows(2).find(|w| w[0].threshold == w[1].threshold) {
            return Err(ConfigurationError::DuplicateThreshold {
                field: "scaling.step_rules".to_string(),
                threshold: pair[0].threshold,
            });
        }

        self.step_rules = rules;
        Ok(self)
    }

    pub fn with_idle_suspend(mut self, idle_suspend: Option<Duration>) -> Self {
        self.idle_suspend = idle_suspend;
        self
    }

    /// Check `min` against a backend-imposed floor
    pub fn check_floor(&self, floor: Capacity, platform: &str) -> Result<(), ConfigurationError> {
        if self.min < floor {
            return Err(ConfigurationError::BelowPlatformFloor {
                field: "scaling.min".to_string(),
                min: self.min,
                floor,
                platform: platform.to_string(),
            });
        }
        Ok(())
    }

    pub fn min(&self) -> Capacity {
        self.min
    }

    pub fn max(&self) -> Capacity {
        self.max
    }

    pub fn idle_suspend(&self) -> Option<Duration> {
        self.idle_suspend
    }

    pub fn step_rules(&self) -> &[StepRule] {
        &self.step_rules
    }

    /// Whether the range allows no scaling at all
    pub fn is_fixed(&self) -> bool {
        self.min == self.max
    }

    /// Target capacity for a load metric value.
    ///
    /// Starts at `min`, adds the delta of every rule whose threshold is at or
    /// below `load_metric`, then clamps into `[min, max]`.
    pub fn resolve(&self, load_metric: u64) -> Capacity {
        let adjustment: i64 = self
            .step_rules
            .iter()
            .take_while(|rule| rule.threshold <= load_metric)
            .map(|rule| i64::from(rule.delta))
            .sum();

        let target = i64::from(self.min) + adjustment;
        target.clamp(i64::from(self.min), i64::from(self.max)) as Capacity
    }
}

impl fmt::Display for ScalingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)?;
        if let Some(idle) = self.idle_suspend {
            write!(f, ", suspend after {}", humantime::format_duration(idle))?;
        }
        if !self.step_rules.is_empty() {
            let steps: Vec<String> = self
                .step_rules
                .iter()
                .map(|rule| format!("{}:{:+}", rule.threshold, rule.delta))
                .collect();
            write!(f, ", steps [{}]", steps.join(", "))?;
        }
        Ok(())
    }
}
