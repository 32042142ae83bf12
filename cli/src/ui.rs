// Terminal UI utilities

use colored::Colorize;

use stagecraft::domain::stage::{ProvisioningPlan, StageState};
use stagecraft::error::ConfigurationWarning;

pub fn print_header(title: &str) {
    println!();
    println!(
        "{}",
        "╔════════════════════════════════════════════════════════════╗".bright_blue()
    );
    println!("{}", format!("║  {:<58}║", title).bright_blue());
    println!(
        "{}",
        "╚════════════════════════════════════════════════════════════╝".bright_blue()
    );
    println!();
}

pub fn print_success(message: &str) {
    println!("{}", format!("✅ {}", message).bright_green().bold());
}

pub fn print_error(message: &str) {
    eprintln!("{}", format!("❌ {}", message).bright_red().bold());
}

pub fn print_info(message: &str) {
    println!("{}", format!("ℹ️  {}", message).bright_cyan());
}

pub fn print_warning(message: &str) {
    println!("{}", format!("⚠️  {}", message).bright_yellow());
}

pub fn print_warnings(warnings: &[ConfigurationWarning]) {
    for warning in warnings {
        print_warning(&warning.to_string());
    }
}

/// Numbered action list for one stage
pub fn print_plan(plan: &ProvisioningPlan, gate: Option<&str>) {
    match gate {
        Some(label) => println!(
            "{} {}",
            plan.stage.bold(),
            format!("(gate: {})", label).dimmed()
        ),
        None => println!("{}", plan.stage.bold()),
    }
    for action in &plan.actions {
        println!(
            "  {:>2}. {:<24} {}",
            action.id.index + 1,
            action.id.kind.to_string(),
            action.summary.dimmed()
        );
    }
}

pub fn print_stage_state(stage: &str, state: StageState) {
    let label = match state {
        StageState::Succeeded => state.name().bright_green(),
        StageState::Failed(_) => state.name().bright_red(),
        StageState::Gated => state.name().bright_yellow(),
        StageState::Pending => state.name().dimmed(),
        _ => state.name().bright_cyan(),
    };
    println!("  {:<20} {}", stage, label);
}
