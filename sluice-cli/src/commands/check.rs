//! Check command handler
//!
//! Verifies the configured container runtime answers.

use anyhow::{Context, Result};
use colored::*;
use sluice_runner::PodmanRuntime;
use std::process::ExitCode;

use crate::config::Config;

pub async fn check_runtime(config: &Config) -> Result<ExitCode> {
    let binary = &config.engine.podman_binary;
    let runtime = PodmanRuntime::new(binary.clone());

    let version = runtime
        .check_available()
        .await
        .with_context(|| format!("Failed to execute '{} --version'. Is podman installed?", binary))?;

    println!("{} {}", "✓".green(), version);
    Ok(ExitCode::SUCCESS)
}
