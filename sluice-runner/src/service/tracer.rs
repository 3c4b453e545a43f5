//! Step tracing hooks
//!
//! A tracer is invoked twice per executed step: once before the container
//! is created (`process` is `None`) and once after it exits. The pre-run
//! call may rewrite the step, veto it with [`EngineError::Skip`], or abort
//! the whole pipeline by returning any other error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::EngineError;
use sluice_core::domain::{ExitState, Step};

/// Snapshot handed to a tracer
#[derive(Debug, Clone)]
pub struct State {
    /// When the pipeline started
    pub started: DateTime<Utc>,
    /// First error recorded by the pipeline so far
    pub error: Option<EngineError>,
    /// Copy of the step; changes made before the run are used to create
    /// the container
    pub step: Step,
    /// 1-based position of the step in the pipeline
    pub number: usize,
    /// Final process state, set only for the post-run call
    pub process: Option<ExitState>,
}

impl State {
    pub fn is_pre_run(&self) -> bool {
        self.process.is_none()
    }
}

#[async_trait]
pub trait Tracer: Send + Sync {
    async fn trace(&self, state: &mut State) -> Result<(), EngineError>;
}

/// Adapts a plain closure into a [`Tracer`]
pub struct TraceFn<F>(pub F);

#[async_trait]
impl<F> Tracer for TraceFn<F>
where
    F: Fn(&mut State) -> Result<(), EngineError> + Send + Sync,
{
    async fn trace(&self, state: &mut State) -> Result<(), EngineError> {
        (self.0)(state)
    }
}

/// Stamps CI status variables into each step's environment
///
/// Status is `failure` once the pipeline has recorded an error, so
/// `run_on_failure` steps can tell why they are running.
#[derive(Debug, Clone)]
pub struct EnvTracer {
    machine: String,
}

impl EnvTracer {
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
        }
    }
}

#[async_trait]
impl Tracer for EnvTracer {
    async fn trace(&self, state: &mut State) -> Result<(), EngineError> {
        if !state.is_pre_run() {
            return Ok(());
        }

        let status = if state.error.is_some() {
            "failure"
        } else {
            "success"
        };
        let started = state.started.timestamp().to_string();
        let finished = Utc::now().timestamp().to_string();
        let name = state.step.name.clone();

        let env = &mut state.step.environment;
        for prefix in ["CI_BUILD", "CI_JOB"] {
            env.insert(format!("{prefix}_STATUS"), status.to_string());
            env.insert(format!("{prefix}_STARTED"), started.clone());
            env.insert(format!("{prefix}_FINISHED"), finished.clone());
        }
        env.insert("CI_STEP_NAME".to_string(), name);
        env.insert("CI_STEP_NUMBER".to_string(), state.number.to_string());
        env.insert("CI_MACHINE".to_string(), self.machine.clone());

        Ok(())
    }
}
