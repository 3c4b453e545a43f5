//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod check;
mod run;
mod validate;

pub use run::RunArgs;

use anyhow::{Context, Result};
use clap::Subcommand;
use sluice_core::domain::PipelineSpec;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline definition
    Run(RunArgs),
    /// Validate a pipeline definition and print its stages
    Validate {
        /// Pipeline definition (JSON)
        file: PathBuf,
    },
    /// Check that the container runtime is available
    Check,
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module and returns the
/// process exit code.
pub async fn handle_command(command: Commands, config: &Config) -> Result<ExitCode> {
    match command {
        Commands::Run(args) => run::run_pipeline(args, config).await,
        Commands::Validate { file } => validate::validate_pipeline(&file),
        Commands::Check => check::check_runtime(config).await,
    }
}

/// Reads and parses a pipeline definition file
pub fn load_pipeline(path: &Path) -> Result<PipelineSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;

    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse pipeline file {}", path.display()))
}

/// Maps a pipeline exit code onto a process exit code
pub fn exit_code(code: i32) -> ExitCode {
    match u8::try_from(code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}
