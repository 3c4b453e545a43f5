//! Engine configuration
//!
//! Defines the tunables of one pipeline execution: log pipe capacity,
//! teardown grace period, step timeouts, the runtime binary and the labels
//! stamped on every container.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Engine configuration
///
/// All timeouts are configurable to allow tuning for different hosts
/// (laptops vs shared CI machines).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the bounded log pipe; producers wait when it is full
    pub pipe_capacity: usize,

    /// Grace period given to containers between SIGTERM and SIGKILL
    pub stop_timeout: Duration,

    /// Upper bound for steps that do not declare their own timeout
    pub step_timeout: Option<Duration>,

    /// Runtime executable (e.g., "podman" or "/usr/bin/podman")
    pub podman_binary: String,

    /// Host name reported to steps as CI_MACHINE
    pub machine: String,

    /// Extra labels attached to every container, network and volume owner
    pub labels: BTreeMap<String, String>,
}

impl EngineConfig {
    /// Creates a new configuration with defaults
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            pipe_capacity: 1024,
            stop_timeout: Duration::from_secs(15),
            step_timeout: None,
            podman_binary: "podman".to_string(),
            machine: machine.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - SLUICE_PIPE_CAPACITY (lines, default: 1024)
    /// - SLUICE_STOP_TIMEOUT (seconds, default: 15)
    /// - SLUICE_STEP_TIMEOUT (seconds, default: unlimited)
    /// - SLUICE_PODMAN (default: podman)
    /// - SLUICE_MACHINE (default: $HOSTNAME or "localhost")
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(capacity) = env_parse::<usize>("SLUICE_PIPE_CAPACITY")? {
            config.pipe_capacity = capacity;
        }
        if let Some(secs) = env_parse::<u64>("SLUICE_STOP_TIMEOUT")? {
            config.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SLUICE_STEP_TIMEOUT")? {
            config.step_timeout = Some(Duration::from_secs(secs));
        }
        if let Ok(binary) = std::env::var("SLUICE_PODMAN") {
            config.podman_binary = binary;
        }
        if let Ok(machine) = std::env::var("SLUICE_MACHINE") {
            config.machine = machine;
        }

        Ok(config)
    }

    /// Adds a label stamped on every container
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipe_capacity == 0 {
            anyhow::bail!("pipe_capacity must be greater than 0");
        }

        if self.podman_binary.trim().is_empty() {
            anyhow::bail!("podman_binary cannot be empty");
        }

        if self.step_timeout.is_some_and(|t| t.is_zero()) {
            anyhow::bail!("step_timeout must be greater than 0 when set");
        }

        if let Some(key) = self.labels.keys().find(|k| k.starts_with("io.sluice.")) {
            anyhow::bail!("label '{}' uses the reserved io.sluice. prefix", key);
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let machine = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self::new(machine)
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e)),
        Err(_) => Ok(None),
    }
}
