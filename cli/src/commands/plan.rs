//! Plan command - print each stage's provisioning actions without applying them

use anyhow::{bail, Result};
use std::path::Path;

use stagecraft::config::load_pipeline;

use crate::ui;

pub fn execute(config: &Path, stage: Option<&str>, show_env: bool) -> Result<()> {
    let built = load_pipeline(config)?;
    let definition = &built.definition;

    let stages: Vec<_> = match stage {
        Some(name) => match definition.stage(name) {
            Some(s) => vec![s],
            None => bail!("No stage named '{}' in {}", name, config.display()),
        },
        None => definition.stages().iter().collect(),
    };

    ui::print_header("Provisioning plan");
    ui::print_warnings(&built.warnings);

    for stage in stages {
        ui::print_plan(&stage.plan(), stage.gate().label());
        if show_env {
            for (key, value) in stage.config().application_environment() {
                println!("      {}={}", key, value);
            }
        }
        println!();
    }

    Ok(())
}
