//! Build context shared by every node of one pipeline
//!
//! Holds everything a running step needs:
//! - The runtime and the optional tracer
//! - The sending half of the log pipe and the secret masker
//! - The aggregate exit code and the first recorded error
//! - Every container, network and volume created, for teardown
//! - The handles of all log tasks, joined before the pipeline completes

use chrono::{DateTime, Utc};
use sluice_core::EngineError;
use sluice_core::domain::{ExecutionState, Line, LineKind, Step};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::runtime::{ContainerSpec, Runtime};
use crate::service::{Masker, State, Tracer};

pub const LABEL_PIPELINE: &str = "io.sluice.pipeline";
pub const LABEL_STEP: &str = "io.sluice.step";

/// Mutable bookkeeping; never held across an await
#[derive(Default)]
struct Record {
    state: ExecutionState,
    exit_code: i32,
    error: Option<EngineError>,
    containers: Vec<String>,
    networks: Vec<String>,
    volumes: Vec<String>,
}

/// Execution context shared across one pipeline run
pub struct BuildContext {
    pipeline_id: Uuid,
    name: String,
    started: DateTime<Utc>,
    clock: Instant,
    runtime: Arc<dyn Runtime>,
    tracer: Option<Arc<dyn Tracer>>,
    config: EngineConfig,
    network: Option<String>,
    masker: Masker,
    pipe: mpsc::Sender<Line>,
    record: Mutex<Record>,
    log_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BuildContext {
    /// Creates a context and the receiving half of its log pipe
    pub(crate) fn new(
        pipeline_id: Uuid,
        name: impl Into<String>,
        runtime: Arc<dyn Runtime>,
        tracer: Option<Arc<dyn Tracer>>,
        config: EngineConfig,
        masker: Masker,
        network: Option<String>,
    ) -> (Arc<Self>, mpsc::Receiver<Line>) {
        let (pipe, rx) = mpsc::channel(config.pipe_capacity.max(1));

        let ctx = Arc::new(Self {
            pipeline_id,
            name: name.into(),
            started: Utc::now(),
            clock: Instant::now(),
            runtime,
            tracer,
            config,
            network,
            masker,
            pipe,
            record: Mutex::new(Record::default()),
            log_tasks: Mutex::new(Vec::new()),
        });

        (ctx, rx)
    }

    fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pipeline_id(&self) -> Uuid {
        self.pipeline_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn clock(&self) -> Instant {
        self.clock
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Network every step joins unless it declares its own
    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub fn masker(&self) -> &Masker {
        &self.masker
    }

    pub fn pipe(&self) -> mpsc::Sender<Line> {
        self.pipe.clone()
    }

    /// Whether any step has failed so far
    pub fn failed(&self) -> bool {
        let record = self.record();
        record.exit_code != 0 || record.error.is_some()
    }

    pub fn exit_code(&self) -> i32 {
        self.record().exit_code
    }

    pub fn first_error(&self) -> Option<EngineError> {
        self.record().error.clone()
    }

    pub fn state(&self) -> ExecutionState {
        self.record().state
    }

    /// Records a step's non-zero exit code; the first one wins
    pub fn record_exit(&self, code: i32) {
        let mut record = self.record();
        if record.exit_code == 0 && code != 0 {
            record.exit_code = code;
        }
    }

    /// Records a pipeline error; the first one wins
    pub fn record_error(&self, error: EngineError) {
        if error.is_skip() {
            return;
        }
        let mut record = self.record();
        if record.error.is_none() {
            debug!(pipeline = %self.pipeline_id, "First error recorded: {}", error);
            record.error = Some(error);
        }
    }

    /// Moves the pipeline to `next` if the transition is legal
    pub fn set_state(&self, next: ExecutionState) -> bool {
        let mut record = self.record();
        if record.state == next {
            return true;
        }
        if !record.state.can_transition_to(next) {
            debug!(
                pipeline = %self.pipeline_id,
                "Ignoring state transition {} -> {}", record.state, next
            );
            return false;
        }
        record.state = next;
        true
    }

    pub fn register_container(&self, id: impl Into<String>) {
        self.record().containers.push(id.into());
    }

    pub fn register_network(&self, name: impl Into<String>) {
        self.record().networks.push(name.into());
    }

    pub fn register_volume(&self, name: impl Into<String>) {
        self.record().volumes.push(name.into());
    }

    pub fn containers(&self) -> Vec<String> {
        self.record().containers.clone()
    }

    /// Spawns a log task the pipeline waits for before completing
    pub fn spawn_log_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.log_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn take_log_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.log_tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Sends a status line (skipped, detached) for a step
    pub async fn emit(&self, step: &str, kind: LineKind, out: impl Into<String>) {
        let line = Line::new(step, self.clock.elapsed().as_secs(), kind, 0, out);
        if self.pipe.send(line).await.is_err() {
            debug!(step = %step, "Log pipe closed, status line dropped");
        }
    }

    /// Container name, unique per step execution
    pub fn container_name(&self, step: &Step) -> String {
        format!("sluice-{}", step.id.simple())
    }

    pub fn labels(&self, step: &Step) -> BTreeMap<String, String> {
        let mut labels = self.config.labels.clone();
        labels.insert(LABEL_PIPELINE.to_string(), self.pipeline_id.to_string());
        labels.insert(LABEL_STEP.to_string(), step.name.clone());
        labels
    }

    /// Full container description for `step`
    pub fn container_spec(&self, step: &Step) -> ContainerSpec {
        let spec = ContainerSpec::from_step(step, self.container_name(step))
            .with_labels(self.labels(step));
        match &self.network {
            Some(network) => spec.with_network(network, &step.name),
            None => spec,
        }
    }

    /// Builds the tracer snapshot for a step about to run
    pub fn trace_state(&self, step: &Step, number: usize) -> State {
        State {
            started: self.started,
            error: self.first_error(),
            step: step.clone(),
            number,
            process: None,
        }
    }

    /// Invokes the tracer, if any
    pub async fn trace(&self, state: &mut State) -> Result<(), EngineError> {
        match &self.tracer {
            Some(tracer) => tracer.trace(state).await,
            None => Ok(()),
        }
    }

    /// Completes a pipeline after its last node
    ///
    /// Stops every container still running (detached steps) and waits for
    /// all log tasks to drain. Returns the first recorded error.
    pub async fn finalize(&self) -> Result<(), EngineError> {
        let timeout = self.config.stop_timeout.as_secs();
        for id in self.containers() {
            if let Err(e) = self.runtime.container_stop(&id, timeout).await {
                debug!("Failed to stop container {}: {}", id, e);
            }
        }

        // Loop: a task may be registered while earlier ones are joined
        loop {
            let tasks = self.take_log_tasks();
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        warn!(pipeline = %self.pipeline_id, "Log task panicked: {}", e);
                    }
                }
            }
        }

        match self.first_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Releases every resource the pipeline created
    ///
    /// Best effort: failures are logged and never returned. Safe to call
    /// more than once.
    pub async fn teardown(&self) {
        let (containers, volumes, networks) = {
            let mut record = self.record();
            (
                std::mem::take(&mut record.containers),
                std::mem::take(&mut record.volumes),
                std::mem::take(&mut record.networks),
            )
        };

        if !containers.is_empty() {
            info!(
                "Cleaning up {} container(s) for pipeline {}",
                containers.len(),
                self.pipeline_id
            );
        }

        for id in &containers {
            match self.runtime.container_remove(id, true, true).await {
                Ok(()) => debug!("Container {} removed", id),
                Err(e) => warn!("Failed to remove container {}: {}", id, e),
            }
        }

        for task in self.take_log_tasks() {
            task.abort();
        }

        for volume in &volumes {
            if let Err(e) = self.runtime.volume_remove(volume).await {
                warn!("Failed to remove volume {}: {}", volume, e);
            }
        }
        for network in &networks {
            if let Err(e) = self.runtime.network_remove(network).await {
                warn!("Failed to remove network {}: {}", network, e);
            }
        }

        debug!("Teardown complete for pipeline {}", self.pipeline_id);
    }
}
