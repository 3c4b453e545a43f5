//! Step domain types
//!
//! A step is one container-backed unit of pipeline work. Steps are immutable
//! once execution starts; the engine only reads their scheduling flags.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One container-backed unit of pipeline work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique execution ID, generated when the definition omits it
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub network_mode: Option<String>,
    /// Volume bindings in `source:target[:options]` form
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    /// Credentials used for the implicit image pull
    #[serde(default)]
    pub auth: Option<RegistryAuth>,

    #[serde(default = "default_true")]
    pub run_on_success: bool,
    #[serde(default)]
    pub run_on_failure: bool,
    /// Fire-and-forget: started but never waited on
    #[serde(default)]
    pub detached: bool,
    /// A failing exit is logged but does not fail the pipeline
    #[serde(default)]
    pub ignore_error: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Consecutive steps sharing a group run concurrently
    #[serde(default)]
    pub group: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Step {
    /// Creates a step with default scheduling flags
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            entrypoint: Vec::new(),
            working_dir: None,
            environment: BTreeMap::new(),
            resources: Resources::default(),
            network_mode: None,
            volumes: Vec::new(),
            devices: Vec::new(),
            privileged: false,
            auth: None,
            run_on_success: true,
            run_on_failure: false,
            detached: false,
            ignore_error: false,
            timeout_seconds: None,
            group: None,
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn on_failure(mut self) -> Self {
        self.run_on_failure = true;
        self
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Evaluates the scheduling flags against the pipeline's failure state
    ///
    /// A failed pipeline only admits steps that opted into `run_on_failure`;
    /// a healthy one only admits steps with `run_on_success`.
    pub fn should_run(&self, failed: bool) -> bool {
        if failed {
            self.run_on_failure
        } else {
            self.run_on_success
        }
    }
}

/// Container resource limits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu_shares: Option<u64>,
    #[serde(default)]
    pub cpu_quota: Option<i64>,
    /// Memory limit in bytes
    #[serde(default)]
    pub memory_limit: Option<u64>,
}

/// Registry credentials for pulling private images
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub registry: Option<String>,
}
