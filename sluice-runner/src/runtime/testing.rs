//! In-memory runtime for tests
//!
//! Containers are keyed by the step name found in their labels, so a test
//! scripts behaviour per step and asserts on the recorded calls.

use async_trait::async_trait;
use sluice_core::domain::{ExecutionState, ExitState, Line, RegistryAuth};
use sluice_core::{EngineError, RuntimeError};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{ContainerSpec, LogStream, Runtime};
use crate::context::LABEL_STEP;
use crate::scheduler::{Event, Pipeline};

/// Scripted behaviour of one step's container
#[derive(Debug, Clone, Default)]
pub(crate) struct Script {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
    pub oom_killed: bool,
    /// `container_wait` never returns
    pub hang: bool,
    pub delay: Option<Duration>,
    pub fail_start: bool,
}

impl Script {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn oom() -> Self {
        Self {
            exit_code: 137,
            oom_killed: true,
            ..Self::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn stdout<I: IntoIterator<Item = &'static str>>(mut self, lines: I) -> Self {
        self.stdout = lines.into_iter().map(str::to_string).collect();
        self
    }

    pub fn stderr<I: IntoIterator<Item = &'static str>>(mut self, lines: I) -> Self {
        self.stderr = lines.into_iter().map(str::to_string).collect();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Runtime call, recorded with the step name (or raw id/name)
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Create(String),
    Pull(String),
    Start(String),
    Wait(String),
    Logs(String),
    Stop(String),
    Kill(String),
    Remove(String),
    NetworkCreate(String),
    NetworkRemove(String),
    VolumeCreate(String),
    VolumeRemove(String),
}

#[derive(Default)]
pub(crate) struct ScriptedRuntime {
    scripts: Mutex<HashMap<String, Script>>,
    missing: Mutex<HashSet<String>>,
    failing_networks: Mutex<HashSet<String>>,
    containers: Mutex<HashMap<String, String>>,
    specs: Mutex<Vec<ContainerSpec>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, step: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(step.to_string(), script);
        self
    }

    /// The image is absent until pulled
    pub fn missing_image(self, image: &str) -> Self {
        self.missing.lock().unwrap().insert(image.to_string());
        self
    }

    pub fn failing_network(self, name: &str) -> Self {
        self.failing_networks
            .lock()
            .unwrap()
            .insert(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn created(&self, step: &str) -> bool {
        self.calls().contains(&Call::Create(step.to_string()))
    }

    pub fn spec_for(&self, step: &str) -> Option<ContainerSpec> {
        self.specs
            .lock()
            .unwrap()
            .iter()
            .find(|spec| spec.labels.get(LABEL_STEP).map(String::as_str) == Some(step))
            .cloned()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn step_of(&self, id: &str) -> String {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    fn script_of(&self, id: &str) -> Script {
        let step = self.step_of(id);
        self.scripts
            .lock()
            .unwrap()
            .get(&step)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Runtime for ScriptedRuntime {
    async fn container_create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        if self.missing.lock().unwrap().contains(&spec.image) {
            return Err(RuntimeError::ImageNotFound(spec.image.clone()));
        }

        let step = spec
            .labels
            .get(LABEL_STEP)
            .cloned()
            .unwrap_or_else(|| spec.name.clone());
        let id = format!("{}-id", spec.name);

        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), step.clone());
        self.specs.lock().unwrap().push(spec.clone());
        self.record(Call::Create(step));
        Ok(id)
    }

    async fn image_pull(
        &self,
        image: &str,
        _auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        self.missing.lock().unwrap().remove(image);
        self.record(Call::Pull(image.to_string()));
        Ok(())
    }

    async fn container_start(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(Call::Start(self.step_of(id)));
        if self.script_of(id).fail_start {
            return Err(RuntimeError::command("podman start", 125, "boom"));
        }
        Ok(())
    }

    async fn container_wait(&self, id: &str) -> Result<ExitState, RuntimeError> {
        self.record(Call::Wait(self.step_of(id)));
        let script = self.script_of(id);

        if script.hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }

        Ok(ExitState {
            exit_code: script.exit_code,
            oom_killed: script.oom_killed,
        })
    }

    async fn container_logs(&self, id: &str) -> Result<LogStream, RuntimeError> {
        self.record(Call::Logs(self.step_of(id)));
        let script = self.script_of(id);

        let join = |lines: &[String]| {
            let mut text = lines.join("\n");
            if !text.is_empty() {
                text.push('\n');
            }
            Cursor::new(text.into_bytes())
        };

        Ok(LogStream::split(
            Box::new(join(&script.stdout)),
            Box::new(join(&script.stderr)),
        ))
    }

    async fn container_stop(&self, id: &str, _timeout_secs: u64) -> Result<(), RuntimeError> {
        self.record(Call::Stop(self.step_of(id)));
        Ok(())
    }

    async fn container_kill(&self, id: &str, _signal: &str) -> Result<(), RuntimeError> {
        self.record(Call::Kill(self.step_of(id)));
        Ok(())
    }

    async fn container_remove(
        &self,
        id: &str,
        _force: bool,
        _remove_volumes: bool,
    ) -> Result<(), RuntimeError> {
        self.record(Call::Remove(self.step_of(id)));
        Ok(())
    }

    async fn network_create(&self, name: &str) -> Result<(), RuntimeError> {
        if self.failing_networks.lock().unwrap().contains(name) {
            return Err(RuntimeError::command("podman network", 125, "address in use"));
        }
        self.record(Call::NetworkCreate(name.to_string()));
        Ok(())
    }

    async fn network_remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(Call::NetworkRemove(name.to_string()));
        Ok(())
    }

    async fn volume_create(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(Call::VolumeCreate(name.to_string()));
        Ok(())
    }

    async fn volume_remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(Call::VolumeRemove(name.to_string()));
        Ok(())
    }
}

/// Everything observed while driving a pipeline to completion
pub(crate) struct Run {
    pub nexts: Vec<usize>,
    pub lines: Vec<Line>,
    pub result: Result<(), EngineError>,
    pub state: ExecutionState,
    pub exit_code: i32,
}

impl Run {
    pub fn lines_of(&self, step: &str) -> Vec<&Line> {
        self.lines.iter().filter(|l| l.step == step).collect()
    }
}

/// Consumer loop: exec every Next, collect lines, tear down after Done
pub(crate) async fn run_to_end(mut pipeline: Pipeline, mut pipe: mpsc::Receiver<Line>) -> Run {
    let mut nexts = Vec::new();
    let mut lines = Vec::new();

    let result = loop {
        tokio::select! {
            Some(line) = pipe.recv() => lines.push(line),
            event = pipeline.next() => match event {
                Some(Event::Next(index)) => {
                    nexts.push(index);
                    pipeline.exec();
                }
                Some(Event::Done(result)) => break result,
                None => panic!("sequencer ended without Done"),
            },
        }
    };

    while let Ok(line) = pipe.try_recv() {
        lines.push(line);
    }

    let state = pipeline.state();
    let exit_code = pipeline.exit_code();
    pipeline.teardown().await;

    Run {
        nexts,
        lines,
        result,
        state,
        exit_code,
    }
}
