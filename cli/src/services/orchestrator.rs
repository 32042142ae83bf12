//! Pipeline orchestrator - drives stages in order
//!
//! Per stage: wait at the gate (if any), then resolve the stage's plan
//! against the backend. Stage N+1 never starts before stage N succeeded.
//! The first failure ends the run and leaves later stages `Pending`.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::pipeline::{ChangeEvent, PipelineDefinition};
use crate::domain::stage::{
    database_secret_parameter, ActionKind, FailureCause, StageOutcome, StageState,
};
use crate::error::{PipelineError, StageProvisioningError};
use crate::infrastructure::ProvisioningBackend;
use crate::observability::{EventMetadata, RunStatus, RunTracker, StageDuration};
use crate::services::approval::Approvals;
use crate::services::cancel::CancelHandle;

/// Current state of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub name: String,
    pub state: StageState,
}

/// Point-in-time view of every stage, published on each transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSnapshot {
    /// Run the states belong to; `None` before the first run
    pub run_id: Option<Uuid>,
    pub stages: Vec<StageStatus>,
}

impl PipelineSnapshot {
    pub fn state_of(&self, stage: &str) -> Option<StageState> {
        self.stages
            .iter()
            .find(|s| s.name == stage)
            .map(|s| s.state)
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTransition {
    pub stage: String,
    pub from: StageState,
    pub to: StageState,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    /// A stage failed; carries the partial state
    Failed(StageProvisioningError),
    /// Cancelled while `stage` was waiting at its gate
    Cancelled { stage: String },
}

/// Report of a finished run
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// Outcomes of the stages that succeeded, in order
    pub stages: Vec<StageOutcome>,
    pub transitions: Vec<StageTransition>,
    pub durations: Vec<StageDuration>,
}

impl PipelineRun {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Succeeded)
    }

    /// Collapse the report into the stage outcomes or the error that ended the run
    pub fn into_result(self) -> Result<Vec<StageOutcome>, PipelineError> {
        match self.outcome {
            RunOutcome::Succeeded => Ok(self.stages),
            RunOutcome::Failed(e) => Err(e.into()),
            RunOutcome::Cancelled { stage } => Err(PipelineError::Cancelled { stage }),
        }
    }
}

/// Owns the stage list and drives runs against a backend
pub struct PipelineOrchestrator {
    definition: PipelineDefinition,
    backend: Arc<dyn ProvisioningBackend>,
    approvals: Approvals,
    cancel: CancelHandle,
    snapshot: watch::Sender<PipelineSnapshot>,
    run_lock: Mutex<()>,
    emit_events: bool,
}

impl PipelineOrchestrator {
    pub fn new(definition: PipelineDefinition, backend: Arc<dyn ProvisioningBackend>) -> Self {
        let initial = PipelineSnapshot {
            run_id: None,
            stages: definition
                .stages()
                .iter()
                .map(|s| StageStatus {
                    name: s.name().to_string(),
                    state: StageState::Pending,
                })
                .collect(),
        };
        let (snapshot, _rx) = watch::channel(initial);

        Self {
            definition,
            backend,
            approvals: Approvals::new(),
            cancel: CancelHandle::new(),
            snapshot,
            run_lock: Mutex::new(()),
            emit_events: false,
        }
    }

    /// Print structured run events to stdout
    pub fn emit_events(mut self, enabled: bool) -> Self {
        self.emit_events = enabled;
        self
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Handle for recording approvals
    pub fn approvals(&self) -> Approvals {
        self.approvals.clone()
    }

    /// Handle for requesting cancellation of the active run
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Observe stage states as they change
    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.snapshot.subscribe()
    }

    /// Whether a push event should start a run
    pub fn should_trigger(&self, event: &ChangeEvent) -> bool {
        self.definition.source().matches(event)
    }

    /// Execute one run over every stage.
    ///
    /// Returns `Err` only for conditions that prevent or corrupt the run
    /// itself. Stage failures and cancellation are reported in the
    /// [`PipelineRun`].
    pub async fn run(&self) -> Result<PipelineRun, PipelineError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| PipelineError::RunInProgress)?;
        self.cancel.reset();

        let run_id = Uuid::new_v4();
        let stages = self.definition.stages();
        let source = self.definition.source();
        let mut progress = RunProgress::start(run_id, &self.definition, &self.snapshot);
        let mut tracker = RunTracker::new(
            EventMetadata::new(run_id, &source.repository, &source.branch),
            self.emit_events,
        );
        let mut outcomes = Vec::new();

        info!(run_id = %run_id, stages = stages.len(), "Starting pipeline run");
        tracker.emit_started(stages.iter().map(|s| s.name().to_string()).collect());

        for (index, stage) in stages.iter().enumerate() {
            let name = stage.name();

            if let Some(label) = stage.gate().label() {
                progress.transition(index, StageState::Gated)?;
                tracker.stage_gated(name, label);
                info!(stage = name, gate = label, "Waiting for approval");

                let approved = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => false,
                    _ = self.approvals.wait_for(label) => true,
                };
                if !approved {
                    warn!(stage = name, "Run cancelled at gate");
                    return Ok(progress.finish(
                        tracker,
                        RunOutcome::Cancelled {
                            stage: name.to_string(),
                        },
                        outcomes,
                    ));
                }

                self.approvals.consume(label);
                tracker.stage_approved(name, label);
                info!(stage = name, gate = label, "Gate approved");
            }

            progress.transition(index, StageState::Approved)?;
            progress.transition(index, StageState::Provisioning)?;
            tracker.start_stage(name);

            match stage.resolve(self.backend.as_ref(), &self.cancel).await {
                Ok(outcome) => {
                    tracker.parameter_published(name, &outcome.parameter_key);
                    progress.transition(index, StageState::Succeeded)?;
                    tracker.stage_succeeded(name, outcome.applied.len());
                    info!(stage = name, "Stage succeeded");
                    outcomes.push(outcome);
                }
                Err(e) => {
                    let exported = e
                        .completed
                        .iter()
                        .any(|a| a.kind == ActionKind::ExportDatabaseSecret);
                    if exported {
                        tracker.parameter_published(name, &database_secret_parameter(name));
                    }

                    let cause = if e.is_cancelled() {
                        FailureCause::Cancelled
                    } else {
                        FailureCause::Backend
                    };
                    progress.transition(index, StageState::Failed(cause))?;
                    error!(
                        stage = name,
                        action = %e.action,
                        completed = e.completed.len(),
                        "Stage failed: {}",
                        e.cause
                    );
                    tracker.stage_failed(
                        name,
                        e.action.to_string(),
                        e.completed.len(),
                        e.is_cancelled(),
                        e.cause.to_string(),
                    );
                    return Ok(progress.finish(tracker, RunOutcome::Failed(e), outcomes));
                }
            }
        }

        info!(run_id = %run_id, "Pipeline run succeeded");
        Ok(progress.finish(tracker, RunOutcome::Succeeded, outcomes))
    }
}

/// Per-run state table; validates each transition and republishes the snapshot
struct RunProgress<'a> {
    run_id: Uuid,
    names: Vec<String>,
    states: Vec<StageState>,
    transitions: Vec<StageTransition>,
    snapshot: &'a watch::Sender<PipelineSnapshot>,
}

impl<'a> RunProgress<'a> {
    fn start(
        run_id: Uuid,
        definition: &PipelineDefinition,
        snapshot: &'a watch::Sender<PipelineSnapshot>,
    ) -> Self {
        let names: Vec<String> = definition
            .stages()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        let progress = Self {
            run_id,
            states: vec![StageState::Pending; names.len()],
            names,
            transitions: Vec::new(),
            snapshot,
        };
        progress.publish();
        progress
    }

    fn transition(&mut self, index: usize, to: StageState) -> Result<(), PipelineError> {
        let from = self.states[index];
        if !from.can_transition_to(to) {
            return Err(PipelineError::IllegalTransition {
                stage: self.names[index].clone(),
                from: from.name(),
                to: to.name(),
            });
        }

        self.states[index] = to;
        self.transitions.push(StageTransition {
            stage: self.names[index].clone(),
            from,
            to,
        });
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        let stages = self
            .names
            .iter()
            .zip(&self.states)
            .map(|(name, state)| StageStatus {
                name: name.clone(),
                state: *state,
            })
            .collect();
        self.snapshot.send_replace(PipelineSnapshot {
            run_id: Some(self.run_id),
            stages,
        });
    }

    fn finish(
        self,
        tracker: RunTracker,
        outcome: RunOutcome,
        stages: Vec<StageOutcome>,
    ) -> PipelineRun {
        let status = match &outcome {
            RunOutcome::Succeeded => RunStatus::Succeeded,
            RunOutcome::Failed(e) if e.is_cancelled() => RunStatus::Cancelled,
            RunOutcome::Failed(_) => RunStatus::Failed,
            RunOutcome::Cancelled { .. } => RunStatus::Cancelled,
        };
        let durations = tracker.emit_completed(status);

        PipelineRun {
            run_id: self.run_id,
            outcome,
            stages,
            transitions: self.transitions,
            durations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::environment::{EnvironmentConfig, EnvironmentDefaults, EnvironmentOverrides};
    use crate::domain::pipeline::ChangeSource;
    use crate::domain::stage::GatePolicy;
    use crate::infrastructure::{BackendCall, BackendOperation, DryRunBackend};
    use std::time::Duration;

    const GATE: &str = "PromoteToProduction";

    fn definition() -> PipelineDefinition {
        let defaults = EnvironmentDefaults {
            domain: "example.com".to_string(),
            ..EnvironmentDefaults::default()
        };
        let staging = EnvironmentConfig::builder("staging", &defaults)
            .overrides(EnvironmentOverrides {
                subdomain: Some("stage".to_string()),
                ..EnvironmentOverrides::default()
            })
            .build()
            .unwrap();
        let production = EnvironmentConfig::builder("production", &defaults)
            .build()
            .unwrap();

        PipelineDefinition::builder(ChangeSource::new("owner/app", "main"))
            .stage(staging, GatePolicy::None)
            .stage(production, GatePolicy::manual(GATE))
            .build()
            .unwrap()
            .definition
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<PipelineSnapshot>,
        stage: &str,
        state: StageState,
    ) {
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.state_of(stage) == Some(state)),
        )
        .await
        .expect("timed out waiting for stage state")
        .expect("snapshot channel closed");
    }

    #[tokio::test]
    async fn test_staging_provisions_before_production_moves() {
        let orchestrator = PipelineOrchestrator::new(definition(), Arc::new(DryRunBackend::new()));
        orchestrator.approvals().approve(GATE);

        let run = orchestrator.run().await.unwrap();
        assert!(run.is_success());
        assert_eq!(run.stages.len(), 2);

        let staging_provisioning = run
            .transitions
            .iter()
            .position(|t| t.stage == "staging" && t.to == StageState::Provisioning)
            .unwrap();
        let first_production = run
            .transitions
            .iter()
            .position(|t| t.stage == "production")
            .unwrap();
        assert!(staging_provisioning < first_production);

        let production: Vec<StageState> = run
            .transitions
            .iter()
            .filter(|t| t.stage == "production")
            .map(|t| t.to)
            .collect();
        assert_eq!(
            production,
            vec![
                StageState::Gated,
                StageState::Approved,
                StageState::Provisioning,
                StageState::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn test_production_waits_for_approval() {
        let backend = Arc::new(DryRunBackend::new());
        let orchestrator = Arc::new(PipelineOrchestrator::new(definition(), backend.clone()));
        let mut rx = orchestrator.subscribe();

        let handle = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run().await })
        };

        wait_for_state(&mut rx, "production", StageState::Gated).await;
        assert_eq!(
            rx.borrow().state_of("staging"),
            Some(StageState::Succeeded)
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            rx.borrow().state_of("production"),
            Some(StageState::Gated)
        );
        assert_eq!(backend.calls().len(), 4);

        orchestrator.approvals().approve(GATE);
        let run = handle.await.unwrap().unwrap();
        assert!(run.is_success());
        assert_eq!(backend.calls().len(), 8);

        // the approval was consumed by this run
        assert!(!orchestrator.approvals().is_approved(GATE));
    }

    #[tokio::test]
    async fn test_staging_failure_leaves_production_pending() {
        let backend = Arc::new(
            DryRunBackend::new().fail_on(BackendOperation::DeclareCompute, "staging/web"),
        );
        let orchestrator = PipelineOrchestrator::new(definition(), backend.clone());
        orchestrator.approvals().approve(GATE);

        let run = orchestrator.run().await.unwrap();
        match &run.outcome {
            RunOutcome::Failed(e) => {
                assert_eq!(e.stage, "staging");
                assert_eq!(e.completed.len(), 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let snapshot = orchestrator.subscribe().borrow().clone();
        assert_eq!(
            snapshot.state_of("staging"),
            Some(StageState::Failed(FailureCause::Backend))
        );
        assert_eq!(snapshot.state_of("production"), Some(StageState::Pending));
        assert!(run.transitions.iter().all(|t| t.stage == "staging"));

        let touched_production = backend.calls().iter().any(|c| match c {
            BackendCall::DeclareDatabase { name, .. } => name.contains("production"),
            BackendCall::PublishParameter { key, .. } => key.contains("production"),
            BackendCall::DeclareCompute { stage, .. } => stage == "production",
        });
        assert!(!touched_production);

        assert!(matches!(
            run.into_result(),
            Err(PipelineError::Provisioning(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_provisioning() {
        let backend = Arc::new(DryRunBackend::new().with_latency(Duration::from_millis(50)));
        let orchestrator = Arc::new(PipelineOrchestrator::new(definition(), backend.clone()));
        let mut rx = orchestrator.subscribe();
        let cancel = orchestrator.cancel_handle();

        let handle = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run().await })
        };

        wait_for_state(&mut rx, "staging", StageState::Provisioning).await;
        cancel.cancel();

        let run = handle.await.unwrap().unwrap();
        let err = match run.outcome {
            RunOutcome::Failed(e) => e,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert!(err.is_cancelled());
        assert!(err.completed.len() < 4);
        // nothing after the cancelled boundary was submitted
        assert_eq!(err.action.index, err.completed.len());
        assert_eq!(backend.calls().len(), err.completed.len());

        assert_eq!(
            rx.borrow().state_of("staging"),
            Some(StageState::Failed(FailureCause::Cancelled))
        );
        assert_eq!(
            rx.borrow().state_of("production"),
            Some(StageState::Pending)
        );
    }

    #[tokio::test]
    async fn test_cancel_while_gated() {
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            definition(),
            Arc::new(DryRunBackend::new()),
        ));
        let mut rx = orchestrator.subscribe();

        let handle = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run().await })
        };

        wait_for_state(&mut rx, "production", StageState::Gated).await;
        orchestrator.cancel_handle().cancel();

        let run = handle.await.unwrap().unwrap();
        assert_eq!(
            run.outcome,
            RunOutcome::Cancelled {
                stage: "production".to_string()
            }
        );
        assert_eq!(run.stages.len(), 1);
        assert_eq!(
            rx.borrow().state_of("production"),
            Some(StageState::Gated)
        );
        assert!(matches!(
            run.into_result(),
            Err(PipelineError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_run_rejected() {
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            definition(),
            Arc::new(DryRunBackend::new()),
        ));
        let mut rx = orchestrator.subscribe();

        let handle = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run().await })
        };
        wait_for_state(&mut rx, "production", StageState::Gated).await;

        assert!(matches!(
            orchestrator.run().await,
            Err(PipelineError::RunInProgress)
        ));

        orchestrator.approvals().approve(GATE);
        assert!(handle.await.unwrap().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_new_run_resets_cancellation() {
        let orchestrator = PipelineOrchestrator::new(definition(), Arc::new(DryRunBackend::new()));
        orchestrator.cancel_handle().cancel();
        orchestrator.approvals().approve(GATE);

        let run = orchestrator.run().await.unwrap();
        assert!(run.is_success());
    }

    #[test]
    fn test_should_trigger() {
        let orchestrator = PipelineOrchestrator::new(definition(), Arc::new(DryRunBackend::new()));
        assert!(orchestrator.should_trigger(&ChangeEvent::push("owner/app", "main")));
        assert!(!orchestrator.should_trigger(&ChangeEvent::push("owner/app", "develop")));
    }

    #[test]
    fn test_initial_snapshot_is_pending() {
        let orchestrator = PipelineOrchestrator::new(definition(), Arc::new(DryRunBackend::new()));
        let snapshot = orchestrator.subscribe().borrow().clone();
        assert_eq!(snapshot.run_id, None);
        assert!(snapshot
            .stages
            .iter()
            .all(|s| s.state == StageState::Pending));
    }
}
