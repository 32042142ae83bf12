//! Validate command - build a pipeline file and report what it declares

use anyhow::{bail, Result};
use std::path::Path;
use tracing::info;

use stagecraft::config::load_pipeline;

use crate::ui;

pub fn execute(config: &Path, strict: bool) -> Result<()> {
    ui::print_header("Validating pipeline");

    let built = load_pipeline(config)?;
    let definition = &built.definition;
    info!(
        config = %config.display(),
        stages = definition.stages().len(),
        "Pipeline built"
    );

    ui::print_info(&format!(
        "Source: {} @ {} (trigger on push: {})",
        definition.source().repository,
        definition.source().branch,
        definition.source().trigger_on_push
    ));

    for stage in definition.stages() {
        let cfg = stage.config();
        let gate = stage
            .gate()
            .label()
            .map(|l| format!(", gate {}", l))
            .unwrap_or_default();
        ui::print_info(&format!(
            "{}: {} | db {} ACU | web {} | worker {}{}",
            stage.name(),
            cfg.fqdn(),
            cfg.database().scaling(),
            cfg.web_scaling(),
            cfg.worker_scaling(),
            gate
        ));
    }

    ui::print_warnings(&built.warnings);

    if strict && !built.warnings.is_empty() {
        bail!(
            "{} configuration warning(s) with --strict",
            built.warnings.len()
        );
    }

    ui::print_success(&format!(
        "Pipeline valid: {} stage(s), {} warning(s)",
        definition.stages().len(),
        built.warnings.len()
    ));
    Ok(())
}
