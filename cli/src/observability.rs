//! # Pipeline Observability Module
//!
//! Structured run events for log collectors.
//!
//! ## Event Flow
//!
//! ```text
//! stagecraft → JSON stdout → log shipper → dashboards
//! ```
//!
//! Every event is a single line of JSON prefixed with `STAGECRAFT_EVENT:` so it
//! can be picked out of ordinary tracing output. Emission is opt-in; the
//! library keeps quiet unless the orchestrator is told otherwise.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

/// Event prefix for log collectors to identify structured events
const EVENT_PREFIX: &str = "STAGECRAFT_EVENT:";

/// Pipeline event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum PipelineEvent {
    /// Run started
    RunStarted(RunStartedEvent),
    /// Stage is waiting for an approval
    StageGated(StageGateEvent),
    /// Approval received for a gated stage
    StageApproved(StageGateEvent),
    /// Database secret reference exported
    ParameterPublished(ParameterPublishedEvent),
    /// All actions of a stage applied
    StageSucceeded(StageSucceededEvent),
    /// Stage stopped on a backend failure or cancellation
    StageFailed(StageFailedEvent),
    /// Run finished, whatever the outcome
    RunCompleted(RunCompletedEvent),
}

/// Common fields for all events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Timestamp in RFC3339 format
    pub timestamp: String,
    pub run_id: Uuid,
    /// Repository the run was triggered from
    pub repository: String,
    pub branch: String,
    /// Hostname of the machine driving the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl EventMetadata {
    pub fn new(run_id: Uuid, repository: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            run_id,
            repository: repository.into(),
            branch: branch.into(),
            hostname: std::env::var("HOSTNAME").ok(),
        }
    }

    /// Copy with the timestamp set to now
    fn stamped(&self) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedEvent {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    /// Stages in deploy order
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageGateEvent {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub stage: String,
    /// Approval label
    pub gate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterPublishedEvent {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub stage: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSucceededEvent {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub stage: String,
    /// Provisioning duration in seconds
    pub duration_secs: f64,
    pub actions_applied: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFailedEvent {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub stage: String,
    /// Duration until failure
    pub duration_secs: f64,
    /// Action that failed
    pub failed_action: String,
    /// Actions applied before the failure
    pub actions_applied: usize,
    pub cancelled: bool,
    /// Error message
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedEvent {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    /// Total duration in seconds
    pub duration_secs: f64,
    pub outcome: RunStatus,
    /// Individual stage durations
    pub stage_durations: Vec<StageDuration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDuration {
    pub stage: String,
    pub duration_secs: f64,
    pub status: StageResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageResult {
    Succeeded,
    Failed,
    Cancelled,
}

/// Render an event as a single prefixed line
pub fn format_event(event: &PipelineEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(format!("{}{}", EVENT_PREFIX, json)),
        Err(e) => {
            tracing::error!("Failed to serialize event: {}", e);
            None
        }
    }
}

/// Emits a structured event as JSON to stdout
///
/// Events are prefixed with `STAGECRAFT_EVENT:`.
pub fn emit_event(event: PipelineEvent) {
    if let Some(line) = format_event(&event) {
        println!("{}", line);
    }
}

/// Helper to track stage timing
pub struct StageTimer {
    stage: String,
    start: Instant,
}

impl StageTimer {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn finish(self, status: StageResult) -> StageDuration {
        StageDuration {
            duration_secs: self.elapsed_secs(),
            stage: self.stage,
            status,
        }
    }
}

/// Per-run event tracker
pub struct RunTracker {
    metadata: EventMetadata,
    start: Instant,
    stages: Vec<StageDuration>,
    current: Option<StageTimer>,
    enabled: bool,
}

impl RunTracker {
    pub fn new(metadata: EventMetadata, enabled: bool) -> Self {
        Self {
            metadata,
            start: Instant::now(),
            stages: Vec::new(),
            current: None,
            enabled,
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if self.enabled {
            emit_event(event);
        }
    }

    pub fn emit_started(&self, stages: Vec<String>) {
        self.emit(PipelineEvent::RunStarted(RunStartedEvent {
            metadata: self.metadata.stamped(),
            stages,
        }));
    }

    pub fn stage_gated(&self, stage: &str, gate: &str) {
        self.emit(PipelineEvent::StageGated(StageGateEvent {
            metadata: self.metadata.stamped(),
            stage: stage.to_string(),
            gate: gate.to_string(),
        }));
    }

    pub fn stage_approved(&self, stage: &str, gate: &str) {
        self.emit(PipelineEvent::StageApproved(StageGateEvent {
            metadata: self.metadata.stamped(),
            stage: stage.to_string(),
            gate: gate.to_string(),
        }));
    }

    /// Start timing a stage's provisioning
    pub fn start_stage(&mut self, stage: &str) {
        self.current = Some(StageTimer::new(stage));
    }

    pub fn parameter_published(&self, stage: &str, key: &str) {
        self.emit(PipelineEvent::ParameterPublished(ParameterPublishedEvent {
            metadata: self.metadata.stamped(),
            stage: stage.to_string(),
            key: key.to_string(),
        }));
    }

    pub fn stage_succeeded(&mut self, stage: &str, actions_applied: usize) {
        let duration = self.finish_current(stage, StageResult::Succeeded);
        self.emit(PipelineEvent::StageSucceeded(StageSucceededEvent {
            metadata: self.metadata.stamped(),
            stage: stage.to_string(),
            duration_secs: duration,
            actions_applied,
        }));
    }

    pub fn stage_failed(
        &mut self,
        stage: &str,
        failed_action: String,
        actions_applied: usize,
        cancelled: bool,
        error: String,
    ) {
        let status = if cancelled {
            StageResult::Cancelled
        } else {
            StageResult::Failed
        };
        let duration = self.finish_current(stage, status);
        self.emit(PipelineEvent::StageFailed(StageFailedEvent {
            metadata: self.metadata.stamped(),
            stage: stage.to_string(),
            duration_secs: duration,
            failed_action,
            actions_applied,
            cancelled,
            error,
        }));
    }

    fn finish_current(&mut self, stage: &str, status: StageResult) -> f64 {
        let timer = self
            .current
            .take()
            .unwrap_or_else(|| StageTimer::new(stage));
        let duration = timer.finish(status);
        let secs = duration.duration_secs;
        self.stages.push(duration);
        secs
    }

    /// Emit the run completed event and return the recorded stage durations
    pub fn emit_completed(self, outcome: RunStatus) -> Vec<StageDuration> {
        self.emit(PipelineEvent::RunCompleted(RunCompletedEvent {
            metadata: self.metadata.stamped(),
            duration_secs: self.start.elapsed().as_secs_f64(),
            outcome,
            stage_durations: self.stages.clone(),
        }));
        self.stages
    }
}
