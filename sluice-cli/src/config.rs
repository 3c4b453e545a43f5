//! Configuration module
//!
//! Handles CLI configuration: engine settings from the environment plus
//! command-line overrides.

use anyhow::Result;
use sluice_runner::EngineConfig;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine settings shared by every command
    pub engine: EngineConfig,
}

impl Config {
    /// Reads SLUICE_* variables and applies the global `--podman` flag
    pub fn load(podman: Option<String>) -> Result<Self> {
        let mut engine = EngineConfig::from_env()?;
        if let Some(binary) = podman {
            engine.podman_binary = binary;
        }
        Ok(Self { engine })
    }
}
