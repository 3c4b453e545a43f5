//! Validate command handler
//!
//! Parses a pipeline definition, validates it and prints the execution plan
//! without touching the container runtime.

use anyhow::{Context, Result};
use colored::*;
use sluice_core::domain::{Stage, Step};
use std::path::Path;
use std::process::ExitCode;

use super::load_pipeline;

pub fn validate_pipeline(path: &Path) -> Result<ExitCode> {
    let spec = load_pipeline(path)?;
    spec.validate()
        .with_context(|| format!("Pipeline {} is invalid", path.display()))?;

    println!(
        "{} {}",
        "✓".green(),
        format!("Pipeline '{}' is valid", spec.name).bold()
    );
    if !spec.networks.is_empty() {
        println!("  Networks: {}", spec.networks.join(", ").dimmed());
    }
    if !spec.volumes.is_empty() {
        println!("  Volumes:  {}", spec.volumes.join(", ").dimmed());
    }
    println!();

    for (index, stage) in spec.stages().iter().enumerate() {
        print_stage(index + 1, stage);
    }

    Ok(ExitCode::SUCCESS)
}

fn print_stage(number: usize, stage: &Stage) {
    let kind = if stage.is_concurrent() {
        "parallel".yellow()
    } else {
        "serial".dimmed()
    };
    println!("  {} Stage {}: {} ({})", "▸".cyan(), number, stage.name.bold(), kind);

    for step in &stage.steps {
        println!("    - {} {}{}", step.name, step.image.dimmed(), flags(step).dimmed());
    }
}

fn flags(step: &Step) -> String {
    let mut flags = Vec::new();
    if step.detached {
        flags.push("detached".to_string());
    }
    if step.run_on_failure {
        flags.push(if step.run_on_success {
            "always".to_string()
        } else {
            "on failure".to_string()
        });
    }
    if step.ignore_error {
        flags.push("ignore errors".to_string());
    }
    if let Some(secs) = step.timeout_seconds {
        flags.push(format!("timeout {}s", secs));
    }

    if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        assert_eq!(flags(&Step::new("a", "alpine")), "");

        let mut step = Step::new("notify", "alpine").on_failure();
        step.timeout_seconds = Some(30);
        assert_eq!(flags(&step), " [always, timeout 30s]");

        let mut cleanup = Step::new("cleanup", "alpine").on_failure();
        cleanup.run_on_success = false;
        cleanup.ignore_error = true;
        assert_eq!(flags(&cleanup), " [on failure, ignore errors]");
    }
}
