//! Run command - drive a pipeline run against the dry-run backend
//!
//! Gates are satisfied by `--approve LABEL`, by answering the prompt, or not
//! at all: with `--non-interactive` an unapproved gate stops the run there.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use stagecraft::config::load_pipeline;
use stagecraft::domain::stage::StageState;
use stagecraft::infrastructure::DryRunBackend;
use stagecraft::services::{
    Approvals, CancelHandle, PipelineOrchestrator, PipelineSnapshot, RunOutcome,
};

use crate::ui;

pub async fn execute(
    config: &Path,
    approvals: Vec<String>,
    non_interactive: bool,
    emit_events: bool,
) -> Result<()> {
    let built = load_pipeline(config)?;
    ui::print_header("Pipeline run (dry run)");
    ui::print_warnings(&built.warnings);

    let gates: Vec<(String, String)> = built
        .definition
        .stages()
        .iter()
        .filter_map(|s| s.gate().label().map(|l| (s.name().to_string(), l.to_string())))
        .collect();

    let orchestrator = PipelineOrchestrator::new(built.definition, Arc::new(DryRunBackend::new()))
        .emit_events(emit_events);
    for label in &approvals {
        orchestrator.approvals().approve(label);
    }
    // The orchestrator consumes approvals as gates pass, so the watcher keeps its own copy.
    let pre_approved: HashSet<String> = approvals.into_iter().collect();

    let cancel = orchestrator.cancel_handle();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling at the next action boundary");
                cancel.cancel();
            }
        }
    });
    let gatekeeper = tokio::spawn(watch_gates(
        orchestrator.subscribe(),
        gates,
        pre_approved,
        orchestrator.approvals(),
        cancel,
        !non_interactive,
    ));

    let result = orchestrator.run().await;
    gatekeeper.abort();
    interrupt.abort();
    let run = result?;

    println!();
    let snapshot = orchestrator.subscribe().borrow().clone();
    for stage in &snapshot.stages {
        ui::print_stage_state(&stage.name, stage.state);
    }
    println!();

    match &run.outcome {
        RunOutcome::Succeeded => {
            for outcome in &run.stages {
                ui::print_info(&format!(
                    "{}: {} exported as {}",
                    outcome.stage, outcome.database.secret_ref, outcome.parameter_key
                ));
            }
            ui::print_success(&format!("Run {} succeeded", run.run_id));
        }
        RunOutcome::Failed(e) => {
            ui::print_error(&e.to_string());
            let applied: Vec<String> = e.completed.iter().map(|a| a.to_string()).collect();
            if !applied.is_empty() {
                ui::print_info(&format!("Already applied: {}", applied.join(", ")));
            }
        }
        RunOutcome::Cancelled { stage } => {
            ui::print_warning(&format!("Run stopped at the gate into '{}'", stage));
        }
    }

    run.into_result()
        .map(|_| ())
        .with_context(|| format!("Pipeline run failed ({})", config.display()))
}

/// Resolve gates as stages reach them: prompt, or cancel when prompting is off
async fn watch_gates(
    mut rx: watch::Receiver<PipelineSnapshot>,
    gates: Vec<(String, String)>,
    pre_approved: HashSet<String>,
    approvals: Approvals,
    cancel: CancelHandle,
    interactive: bool,
) {
    let mut handled = HashSet::new();

    while rx.changed().await.is_ok() {
        let gated: Vec<String> = rx
            .borrow_and_update()
            .stages
            .iter()
            .filter(|s| s.state == StageState::Gated)
            .map(|s| s.name.clone())
            .collect();

        for stage in gated {
            if !handled.insert(stage.clone()) {
                continue;
            }
            let Some((_, label)) = gates.iter().find(|(name, _)| *name == stage) else {
                continue;
            };
            if pre_approved.contains(label) || approvals.is_approved(label) {
                continue;
            }

            if !interactive {
                warn!(stage = %stage, gate = %label, "No approval given, stopping at gate");
                cancel.cancel();
                return;
            }

            match prompt(stage.clone(), label.clone()).await {
                Ok(true) => {
                    approvals.approve(label);
                }
                Ok(false) => {
                    info!(stage = %stage, "Approval declined");
                    cancel.cancel();
                    return;
                }
                Err(e) => {
                    warn!("Failed to read approval: {:#}", e);
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

async fn prompt(stage: String, label: String) -> Result<bool> {
    print!("Approve '{}' to promote into '{}'? [y/N] ", label, stage);
    std::io::stdout().flush()?;
    let answer = read_answer(BufReader::new(std::io::stdin())).await?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Read one line on a detached thread. An unanswered read must not hold up
/// runtime shutdown after the run ends or is interrupted.
async fn read_answer<R>(mut reader: R) -> Result<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut answer = String::new();
        let read = reader.read_line(&mut answer).map(|_| answer);
        let _ = tx.send(read);
    });
    let answer = rx.await.context("Approval prompt exited without an answer")??;
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use std::time::{Duration, Instant};

    struct NeverAnswers;

    impl Read for NeverAnswers {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_secs(3600));
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_read_answer() {
        let answer = read_answer(Cursor::new(b"yes\n".to_vec())).await.unwrap();
        assert_eq!(answer.trim(), "yes");
    }

    #[test]
    fn test_unanswered_prompt_does_not_block_shutdown() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let started = Instant::now();
        runtime.block_on(async {
            let pending = tokio::spawn(read_answer(BufReader::new(NeverAnswers)));
            tokio::time::sleep(Duration::from_millis(20)).await;
            pending.abort();
        });
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
