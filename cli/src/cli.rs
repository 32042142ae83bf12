//! CLI definitions for stagecraft
//!
//! This module contains all CLI argument parsing structures using clap.

use clap::{Parser, Subcommand};
use stagecraft::config::DEFAULT_CONFIG_FILE;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "stagecraft",
    version,
    about = "Environment configuration and promotion pipelines",
    long_about = "Validates per-environment pipeline definitions, prints provisioning plans\nand drives gated promotion runs against a dry-run backend."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a pipeline file and report warnings
    Validate {
        /// Pipeline file
        #[arg(long, env = "STAGECRAFT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Treat configuration warnings as errors
        #[arg(long)]
        strict: bool,
    },

    /// Print the provisioning plan of each stage
    Plan {
        /// Pipeline file
        #[arg(long, env = "STAGECRAFT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Only show this stage
        #[arg(long)]
        stage: Option<String>,

        /// Also print the runtime environment passed to compute
        #[arg(long)]
        show_env: bool,
    },

    /// Run the pipeline against the dry-run backend
    Run {
        /// Pipeline file
        #[arg(long, env = "STAGECRAFT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Pre-approve a gate label (repeatable)
        #[arg(long = "approve", value_name = "LABEL")]
        approvals: Vec<String>,

        /// Never prompt; a gate without a pre-approval stops the run
        #[arg(long)]
        non_interactive: bool,

        /// Do not print STAGECRAFT_EVENT lines
        #[arg(long)]
        no_events: bool,
    },
}
