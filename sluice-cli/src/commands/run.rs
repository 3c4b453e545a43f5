//! Run command handler
//!
//! Runs a pipeline definition against podman, streaming every output line
//! as it arrives. Ctrl-C cancels the pipeline and tears it down.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use sluice_core::domain::{Line, LineKind, Outcome};
use sluice_runner::service::EnvTracer;
use sluice_runner::{EngineConfig, PipelineBuilder, PodmanRuntime, drive};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{exit_code, load_pipeline};
use crate::config::Config;

/// Arguments of `sluice run`
#[derive(Args)]
pub struct RunArgs {
    /// Pipeline definition (JSON)
    pub file: PathBuf,

    /// Print output lines and the summary as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Do not stamp CI_* status variables into step environments
    #[arg(long)]
    pub no_env: bool,

    /// Value to mask in all output (repeatable)
    #[arg(long = "mask", value_name = "VALUE")]
    pub masks: Vec<String>,

    /// Log pipe capacity in lines
    #[arg(long)]
    pub pipe_capacity: Option<usize>,

    /// Grace period in seconds when stopping containers
    #[arg(long)]
    pub stop_timeout: Option<u64>,

    /// Default per-step timeout in seconds
    #[arg(long)]
    pub step_timeout: Option<u64>,
}

impl RunArgs {
    /// Applies the flags given on the command line; SLUICE_* variables are
    /// already part of `engine`
    fn apply(&self, engine: &mut EngineConfig) {
        if let Some(capacity) = self.pipe_capacity {
            engine.pipe_capacity = capacity;
        }
        if let Some(secs) = self.stop_timeout {
            engine.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.step_timeout {
            engine.step_timeout = Some(Duration::from_secs(secs));
        }
    }
}

pub async fn run_pipeline(args: RunArgs, config: &Config) -> Result<ExitCode> {
    let spec = load_pipeline(&args.file)?;

    let mut engine = config.engine.clone();
    args.apply(&mut engine);
    engine.validate()?;

    let runtime = PodmanRuntime::new(engine.podman_binary.clone());
    runtime
        .check_available()
        .await
        .context("Container runtime is not available")?;

    let mut builder = PipelineBuilder::new(Arc::new(runtime))
        .config(engine.clone())
        .mask(args.masks);
    if !args.no_env {
        builder = builder.tracer(Arc::new(EnvTracer::new(engine.machine.clone())));
    }

    let (pipeline, pipe) = builder
        .build(&spec)
        .await
        .with_context(|| format!("Failed to set up pipeline '{}'", spec.name))?;

    let stop = pipeline.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if stop.stop() {
                warn!("Interrupted, cancelling pipeline");
            } else {
                info!("Pipeline already finished");
            }
        }
    });

    let json = args.json;
    let outcome = drive(pipeline, pipe, |line| {
        if json {
            print_json_line(&line);
        } else {
            println!("{}", format_line(&line));
        }
    })
    .await;

    if json {
        print_json_outcome(&outcome);
    } else {
        print_outcome(&outcome);
    }

    Ok(exit_code(outcome.exit_code))
}

/// Renders one output line for the terminal
fn format_line(line: &Line) -> String {
    let prefix = format!("[{}]", line.step).cyan();
    match line.kind {
        LineKind::Stdout | LineKind::Progress => format!("{} {}", prefix, line.out),
        LineKind::Stderr => format!("{} {}", prefix, line.out.yellow()),
        LineKind::Metadata => format!("{} {}", prefix, line.out.dimmed()),
        LineKind::ExitCode => {
            let status = format!("exit code {}", line.out);
            if line.out == "0" {
                format!("{} {}", prefix, status.green())
            } else {
                format!("{} {}", prefix, status.red())
            }
        }
    }
}

fn print_json_line(line: &Line) {
    match serde_json::to_string(line) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Failed to serialize line: {}", e),
    }
}

fn print_outcome(outcome: &Outcome) {
    println!();
    if outcome.success() {
        println!("{}", "✓ Pipeline succeeded".green().bold());
    } else {
        println!(
            "{} (exit code {})",
            format!("✗ Pipeline {}", outcome.state.to_string().to_lowercase())
                .red()
                .bold(),
            outcome.exit_code
        );
    }

    if let Some(error) = outcome.error_message() {
        println!("  {}", error.red());
    }
}

fn print_json_outcome(outcome: &Outcome) {
    let summary = serde_json::json!({
        "state": outcome.state,
        "exit_code": outcome.exit_code,
        "error": outcome.error_message(),
    });
    println!("{}", summary);
}
