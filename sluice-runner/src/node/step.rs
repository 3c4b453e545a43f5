//! Step node
//!
//! Runs one step's container from creation to exit:
//! - Run policy and pre-run tracing (which may skip or rewrite the step)
//! - Create, pulling the image once if it is missing
//! - Start; detached steps stop here
//! - Log multiplexing, wait (bounded by the step timeout) and exit evaluation
//! - Post-run tracing

use async_trait::async_trait;
use sluice_core::domain::{ExitState, LineKind, Step};
use sluice_core::{EngineError, RuntimeError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::Node;
use crate::context::BuildContext;
use crate::runtime::ContainerSpec;
use crate::service::LogMultiplexer;

/// Exit code recorded for a step killed by its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code recorded for an OOM kill that reported success
pub const OOM_EXIT_CODE: i32 = 137;

const KILL_SIGNAL: &str = "SIGKILL";

enum Finished {
    Detached,
    Exited(ExitState),
    TimedOut(u64),
}

/// Leaf node wrapping one step
pub struct StepNode {
    step: Step,
    number: usize,
}

impl StepNode {
    /// `number` is the 1-based position reported to tracers
    pub fn new(step: Step, number: usize) -> Self {
        Self { step, number }
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    fn timeout(&self, ctx: &BuildContext) -> Option<Duration> {
        self.step
            .timeout_seconds
            .map(Duration::from_secs)
            .or(ctx.config().step_timeout)
    }

    async fn create(&self, ctx: &BuildContext, spec: &ContainerSpec) -> Result<String, EngineError> {
        let runtime = ctx.runtime();
        let name = self.step.name.as_str();

        match runtime.container_create(spec).await {
            Ok(id) => Ok(id),
            Err(RuntimeError::ImageNotFound(image)) => {
                info!(step = %name, "Image {} not found locally, pulling", image);
                runtime
                    .image_pull(&spec.image, self.step.auth.as_ref())
                    .await
                    .map_err(|e| EngineError::runtime(name, e))?;
                runtime
                    .container_create(spec)
                    .await
                    .map_err(|e| EngineError::runtime(name, e))
            }
            Err(e) => Err(EngineError::runtime(name, e)),
        }
    }

    /// Drives the container; `step` may carry tracer rewrites
    async fn launch(&self, ctx: &BuildContext, step: &Step) -> Result<Finished, EngineError> {
        let runtime = ctx.runtime();
        let name = step.name.as_str();

        let spec = ctx.container_spec(step);
        let id = self.create(ctx, &spec).await?;
        ctx.register_container(id.clone());

        runtime
            .container_start(&id)
            .await
            .map_err(|e| EngineError::runtime(name, e))?;
        info!(step = %name, container = %id, "Container started");

        if step.detached {
            ctx.emit(name, LineKind::Metadata, "detached").await;
            return Ok(Finished::Detached);
        }

        let logs = runtime
            .container_logs(&id)
            .await
            .map_err(|e| EngineError::runtime(name, e))?;
        let (exit_tx, exit_rx) = oneshot::channel();
        let multiplexer = LogMultiplexer::new(name, ctx.pipe(), ctx.clock(), ctx.masker().clone());
        ctx.spawn_log_task(multiplexer.run(logs, exit_rx));

        let waited = match self.timeout(ctx) {
            Some(limit) => match tokio::time::timeout(limit, runtime.container_wait(&id)).await {
                Ok(waited) => waited,
                Err(_) => {
                    warn!(step = %name, "Step timed out after {:?}, killing", limit);
                    if let Err(e) = runtime.container_kill(&id, KILL_SIGNAL).await {
                        warn!(step = %name, "Failed to kill container {}: {}", id, e);
                    }
                    let _ = exit_tx.send(ExitState::exited(TIMEOUT_EXIT_CODE));
                    return Ok(Finished::TimedOut(limit.as_secs()));
                }
            },
            None => runtime.container_wait(&id).await,
        };

        let exit = waited.map_err(|e| EngineError::runtime(name, e))?;
        let reported = ExitState {
            exit_code: exit_code(&exit),
            ..exit
        };
        if exit_tx.send(reported).is_err() {
            debug!(step = %name, "Log task gone before exit state was known");
        }

        Ok(Finished::Exited(exit))
    }

    /// Turns the process result into the step's outcome
    fn evaluate(&self, ctx: &BuildContext, finished: &Finished) -> Result<(), EngineError> {
        let step = self.step.name.clone();

        let (code, failure) = match *finished {
            Finished::Detached => return Ok(()),
            Finished::TimedOut(seconds) => {
                (TIMEOUT_EXIT_CODE, EngineError::Timeout { step, seconds })
            }
            Finished::Exited(exit) if exit.oom_killed => (exit_code(&exit), EngineError::Oom { step }),
            Finished::Exited(exit) if exit.exit_code != 0 => {
                let code = exit.exit_code;
                (code, EngineError::Exit { step, code })
            }
            Finished::Exited(_) => {
                debug!(step = %self.step.name, "Step succeeded");
                return Ok(());
            }
        };

        if self.step.ignore_error {
            warn!(step = %self.step.name, "Step failed, error ignored: {}", failure);
            return Ok(());
        }

        info!(step = %self.step.name, "Step failed: {}", failure);
        ctx.record_exit(code);
        ctx.record_error(failure.clone());
        Err(failure)
    }
}

/// Exit code reported for a finished process; an OOM kill never reads as 0
fn exit_code(exit: &ExitState) -> i32 {
    if exit.oom_killed && exit.exit_code == 0 {
        OOM_EXIT_CODE
    } else {
        exit.exit_code
    }
}

/// Tracer errors other than skip abort the pipeline
fn abort(err: EngineError) -> EngineError {
    if err.is_fatal() {
        err
    } else {
        EngineError::Trace(err.to_string())
    }
}

#[async_trait]
impl Node for StepNode {
    fn name(&self) -> &str {
        &self.step.name
    }

    fn should_run(&self, ctx: &BuildContext) -> bool {
        self.step.should_run(ctx.failed())
    }

    async fn skip(&self, ctx: &BuildContext) {
        info!(step = %self.step.name, "Step skipped");
        ctx.emit(&self.step.name, LineKind::Metadata, "skipped").await;
    }

    async fn execute(&self, ctx: Arc<BuildContext>) -> Result<(), EngineError> {
        let name = self.step.name.as_str();

        let mut state = ctx.trace_state(&self.step, self.number);
        match ctx.trace(&mut state).await {
            Ok(()) => {}
            Err(EngineError::Skip) => {
                info!(step = %name, "Step skipped by tracer");
                ctx.emit(name, LineKind::Metadata, "skipped").await;
                return Ok(());
            }
            Err(e) => {
                let e = abort(e);
                error!(step = %name, "Tracer aborted pipeline: {}", e);
                ctx.record_error(e.clone());
                return Err(e);
            }
        }

        let finished = match self.launch(&ctx, &state.step).await {
            Ok(finished) => finished,
            Err(e) => {
                error!(step = %name, "Step could not run: {}", e);
                ctx.record_error(e.clone());
                return Err(e);
            }
        };

        let result = self.evaluate(&ctx, &finished);

        state.process = match finished {
            Finished::Exited(exit) => Some(ExitState {
                exit_code: exit_code(&exit),
                ..exit
            }),
            Finished::TimedOut(_) => Some(ExitState::exited(TIMEOUT_EXIT_CODE)),
            Finished::Detached => return result,
        };
        state.error = ctx.first_error();

        match ctx.trace(&mut state).await {
            Err(e) if !e.is_skip() && result.is_ok() => {
                let e = abort(e);
                error!(step = %name, "Tracer aborted pipeline: {}", e);
                ctx.record_error(e.clone());
                Err(e)
            }
            _ => result,
        }
    }
}
