//! Pipeline domain types

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::domain::step::Step;
use crate::error::EngineError;

/// Pipeline definition
///
/// The in-memory result of parsing a pipeline file. Services are started
/// first and detached; steps follow in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub services: Vec<Step>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Pipeline-scoped networks, created before the first step
    #[serde(default)]
    pub networks: Vec<String>,
    /// Pipeline-scoped named volumes, created before the first step
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Values masked out of every output line
    #[serde(default)]
    pub masked: Vec<String>,
}

/// A set of steps executed together before the pipeline proceeds
#[derive(Debug, Clone, Serialize)]
pub struct Stage {
    pub name: String,
    pub group: Option<String>,
    pub steps: Vec<Step>,
}

impl Stage {
    pub fn is_concurrent(&self) -> bool {
        self.steps.len() > 1
    }
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            services: Vec::new(),
            steps: Vec::new(),
            networks: Vec::new(),
            volumes: Vec::new(),
            masked: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_service(mut self, service: Step) -> Self {
        self.services.push(service);
        self
    }

    /// Splits the pipeline into execution stages
    ///
    /// Services form one leading stage with every member forced detached.
    /// Consecutive steps that share a `group` collapse into one stage; any
    /// other step is a stage of its own.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = Vec::new();

        if !self.services.is_empty() {
            stages.push(Stage {
                name: "services".to_string(),
                group: None,
                steps: self
                    .services
                    .iter()
                    .cloned()
                    .map(|mut service| {
                        service.detached = true;
                        service
                    })
                    .collect(),
            });
        }

        for step in &self.steps {
            if let (Some(group), Some(last)) = (&step.group, stages.last_mut()) {
                if last.group.as_ref() == Some(group) {
                    last.steps.push(step.clone());
                    continue;
                }
            }

            stages.push(Stage {
                name: step.group.clone().unwrap_or_else(|| step.name.clone()),
                group: step.group.clone(),
                steps: vec![step.clone()],
            });
        }

        stages
    }

    /// Checks the definition before any container is touched
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Invalid("pipeline name cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for step in self.services.iter().chain(&self.steps) {
            if step.name.trim().is_empty() {
                return Err(EngineError::Invalid("step name cannot be empty".into()));
            }
            if step.image.trim().is_empty() {
                return Err(EngineError::Invalid(format!(
                    "step '{}' has no image",
                    step.name
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(EngineError::Invalid(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }

        Ok(())
    }
}
