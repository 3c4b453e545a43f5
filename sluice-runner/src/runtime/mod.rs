//! Container runtime abstraction
//!
//! The engine drives containers exclusively through the [`Runtime`] trait.
//! [`PodmanRuntime`] talks to a local podman installation; tests use a
//! scripted in-memory runtime.

mod podman;
#[cfg(test)]
pub(crate) mod testing;

pub use podman::PodmanRuntime;

use async_trait::async_trait;
use sluice_core::RuntimeError;
use sluice_core::domain::{ExitState, RegistryAuth, Resources, Step};
use std::collections::BTreeMap;
use tokio::io::AsyncRead;

/// Byte stream of container output
pub type LogReader = Box<dyn AsyncRead + Send + Unpin>;

/// Output streams of one container
///
/// Runtimes that cannot separate the streams return everything on
/// `stdout` and leave `stderr` empty.
pub struct LogStream {
    pub stdout: LogReader,
    pub stderr: Option<LogReader>,
}

impl LogStream {
    pub fn combined(reader: LogReader) -> Self {
        Self {
            stdout: reader,
            stderr: None,
        }
    }

    pub fn split(stdout: LogReader, stderr: LogReader) -> Self {
        Self {
            stdout,
            stderr: Some(stderr),
        }
    }
}

/// Everything a runtime needs to create one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    pub working_dir: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub resources: Resources,
    pub network_mode: Option<String>,
    pub network_aliases: Vec<String>,
    pub volumes: Vec<String>,
    pub devices: Vec<String>,
    pub privileged: bool,
}

impl ContainerSpec {
    /// Translates a step descriptor verbatim
    pub fn from_step(step: &Step, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: step.image.clone(),
            command: step.command.clone(),
            entrypoint: step.entrypoint.clone(),
            working_dir: step.working_dir.clone(),
            environment: step.environment.clone(),
            labels: BTreeMap::new(),
            resources: step.resources.clone(),
            network_mode: step.network_mode.clone(),
            network_aliases: Vec::new(),
            volumes: step.volumes.clone(),
            devices: step.devices.clone(),
            privileged: step.privileged,
        }
    }

    pub fn with_labels<I>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.labels.extend(labels);
        self
    }

    /// Attaches the container to a pipeline network under `alias`
    ///
    /// A step that declares its own network mode keeps it.
    pub fn with_network(mut self, network: &str, alias: &str) -> Self {
        if self.network_mode.is_none() {
            self.network_mode = Some(network.to_string());
            self.network_aliases.push(alias.to_string());
        }
        self
    }
}

/// Operations the engine needs from a container runtime
///
/// `container_create` must be safe to retry once after an implicit pull;
/// it reports a missing image as [`RuntimeError::ImageNotFound`].
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Creates a container and returns its identifier
    async fn container_create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn image_pull(&self, image: &str, auth: Option<&RegistryAuth>)
    -> Result<(), RuntimeError>;

    async fn container_start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Blocks until the container exits
    async fn container_wait(&self, id: &str) -> Result<ExitState, RuntimeError>;

    /// Follows the container's output until it exits
    async fn container_logs(&self, id: &str) -> Result<LogStream, RuntimeError>;

    async fn container_stop(&self, id: &str, timeout_secs: u64) -> Result<(), RuntimeError>;

    async fn container_kill(&self, id: &str, signal: &str) -> Result<(), RuntimeError>;

    async fn container_remove(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), RuntimeError>;

    async fn network_create(&self, name: &str) -> Result<(), RuntimeError>;

    async fn network_remove(&self, name: &str) -> Result<(), RuntimeError>;

    async fn volume_create(&self, name: &str) -> Result<(), RuntimeError>;

    async fn volume_remove(&self, name: &str) -> Result<(), RuntimeError>;
}
