use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod ui;

use cli::{Cli, Commands};
use commands::{plan, run, validate};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with LOGGING env var support
    // LOGGING=debug,info,warn,error or just LOGGING=debug
    let log_level = std::env::var("LOGGING")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| {
            if cli.verbose {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(false) // Disable ANSI escape codes for cleaner output
        .init();

    // Execute command
    match cli.command {
        Commands::Validate { config, strict } => validate::execute(&config, strict),
        Commands::Plan {
            config,
            stage,
            show_env,
        } => plan::execute(&config, stage.as_deref(), show_env),
        Commands::Run {
            config,
            approvals,
            non_interactive,
            no_events,
        } => run::execute(&config, approvals, non_interactive, !no_events).await,
    }
}
