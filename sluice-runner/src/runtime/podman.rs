//! Podman runtime
//!
//! Drives a local podman installation through its CLI:
//! - Creating, starting and waiting on step containers
//! - Following container output with separate stdout/stderr streams
//! - Stopping, killing and removing containers during teardown
//! - Managing pipeline-scoped networks and volumes

use async_trait::async_trait;
use sluice_core::RuntimeError;
use sluice_core::domain::{ExitState, RegistryAuth};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ContainerSpec, LogStream, Runtime};

/// Runtime backed by the `podman` command line
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    binary: String,
}

impl PodmanRuntime {
    /// Creates a runtime invoking `binary` (usually just `podman`)
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Checks that podman is installed and answers
    ///
    /// Returns the reported version string.
    pub async fn check_available(&self) -> Result<String, RuntimeError> {
        let version = self.run(&["--version".to_string()]).await?;
        info!("Podman is available: {}", version);
        Ok(version)
    }

    /// Runs one podman command to completion and returns its trimmed stdout
    async fn run(&self, args: &[String]) -> Result<String, RuntimeError> {
        let subcommand = args.first().map(String::as_str).unwrap_or_default();

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !stdout.is_empty() {
            debug!("podman {} stdout: {}", subcommand, stdout);
        }
        if !stderr.is_empty() {
            debug!("podman {} stderr: {}", subcommand, stderr);
        }

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            return Err(RuntimeError::command(
                format!("{} {}", self.binary, subcommand),
                code,
                stderr,
            ));
        }

        Ok(stdout)
    }

    /// Like `run`, but maps "no such object" failures to `NotFound`
    async fn run_on(&self, object: &str, args: &[String]) -> Result<String, RuntimeError> {
        self.run(args).await.map_err(|err| match err {
            RuntimeError::Command { ref stderr, .. } if is_missing_object(stderr) => {
                RuntimeError::NotFound(object.to_string())
            }
            other => other,
        })
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new("podman")
    }
}

#[async_trait]
impl Runtime for PodmanRuntime {
    async fn container_create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        debug!("Creating container {} from image {}", spec.name, spec.image);

        let id = self
            .run(&create_args(spec))
            .await
            .map_err(|err| match err {
                RuntimeError::Command { ref stderr, .. } if is_missing_image(stderr) => {
                    RuntimeError::ImageNotFound(spec.image.clone())
                }
                other => other,
            })?;

        // podman may print pull progress before the ID
        id.lines()
            .last()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .ok_or_else(|| RuntimeError::Parse(format!("no container ID for {}", spec.name)))
    }

    async fn image_pull(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        info!("Pulling image {}", image);
        self.run(&pull_args(image, auth)).await.map(|_| ())
    }

    async fn container_start(&self, id: &str) -> Result<(), RuntimeError> {
        self.run_on(id, &["start".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }

    async fn container_wait(&self, id: &str) -> Result<ExitState, RuntimeError> {
        self.run_on(id, &["wait".to_string(), id.to_string()])
            .await?;

        let state = self
            .run_on(
                id,
                &[
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{.State.ExitCode}} {{.State.OOMKilled}}".to_string(),
                    id.to_string(),
                ],
            )
            .await?;

        parse_state(&state)
    }

    async fn container_logs(&self, id: &str) -> Result<LogStream, RuntimeError> {
        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Io("podman logs stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::Io("podman logs stderr not captured".to_string()))?;

        let id = id.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    warn!("podman logs for {} exited with {}", id, status);
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to reap podman logs for {}: {}", id, e),
            }
        });

        Ok(LogStream::split(Box::new(stdout), Box::new(stderr)))
    }

    async fn container_stop(&self, id: &str, timeout_secs: u64) -> Result<(), RuntimeError> {
        debug!("Stopping container {} (timeout {}s)", id, timeout_secs);
        self.run_on(
            id,
            &[
                "stop".to_string(),
                "--time".to_string(),
                timeout_secs.to_string(),
                id.to_string(),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn container_kill(&self, id: &str, signal: &str) -> Result<(), RuntimeError> {
        debug!("Killing container {} with {}", id, signal);
        self.run_on(
            id,
            &[
                "kill".to_string(),
                "--signal".to_string(),
                signal.to_string(),
                id.to_string(),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn container_remove(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), RuntimeError> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        if remove_volumes {
            args.push("--volumes".to_string());
        }
        args.push(id.to_string());

        self.run_on(id, &args).await.map(|_| ())
    }

    async fn network_create(&self, name: &str) -> Result<(), RuntimeError> {
        debug!("Creating network {}", name);
        self.run(&["network".to_string(), "create".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    async fn network_remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.run_on(
            name,
            &["network".to_string(), "rm".to_string(), name.to_string()],
        )
        .await
        .map(|_| ())
    }

    async fn volume_create(&self, name: &str) -> Result<(), RuntimeError> {
        debug!("Creating volume {}", name);
        self.run(&["volume".to_string(), "create".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    async fn volume_remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.run_on(
            name,
            &["volume".to_string(), "rm".to_string(), name.to_string()],
        )
        .await
        .map(|_| ())
    }
}

/// Builds the `podman create` argument list for a container
///
/// Images are never pulled implicitly; the engine pulls on demand after a
/// missing-image failure.
pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--pull=never".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &spec.environment {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }

    if let Some(dir) = &spec.working_dir {
        args.push("--workdir".to_string());
        args.push(dir.clone());
    }
    if !spec.entrypoint.is_empty() {
        // JSON form keeps multi-word entrypoints intact
        args.push("--entrypoint".to_string());
        args.push(serde_json::to_string(&spec.entrypoint).unwrap_or_default());
    }

    if let Some(shares) = spec.resources.cpu_shares {
        args.push("--cpu-shares".to_string());
        args.push(shares.to_string());
    }
    if let Some(quota) = spec.resources.cpu_quota {
        args.push("--cpu-quota".to_string());
        args.push(quota.to_string());
    }
    if let Some(memory) = spec.resources.memory_limit {
        args.push("--memory".to_string());
        args.push(format!("{memory}b"));
    }

    if let Some(network) = &spec.network_mode {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    for alias in &spec.network_aliases {
        args.push("--network-alias".to_string());
        args.push(alias.clone());
    }
    for volume in &spec.volumes {
        args.push("--volume".to_string());
        args.push(volume.clone());
    }
    for device in &spec.devices {
        args.push("--device".to_string());
        args.push(device.clone());
    }
    if spec.privileged {
        args.push("--privileged".to_string());
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

fn pull_args(image: &str, auth: Option<&RegistryAuth>) -> Vec<String> {
    let mut args = vec!["pull".to_string()];
    if let Some(auth) = auth {
        args.push("--creds".to_string());
        args.push(format!("{}:{}", auth.username, auth.password));
    }
    args.push(image.to_string());
    args
}

/// Parses `inspect` output of the form `"<exit code> <oom killed>"`
pub(crate) fn parse_state(raw: &str) -> Result<ExitState, RuntimeError> {
    let mut fields = raw.split_whitespace();

    let exit_code = fields
        .next()
        .and_then(|code| code.parse::<i32>().ok())
        .ok_or_else(|| RuntimeError::Parse(format!("container state '{raw}'")))?;
    let oom_killed = fields
        .next()
        .and_then(|oom| oom.parse::<bool>().ok())
        .ok_or_else(|| RuntimeError::Parse(format!("container state '{raw}'")))?;

    Ok(ExitState {
        exit_code,
        oom_killed,
    })
}

pub(crate) fn is_missing_image(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    [
        "image not known",
        "no such image",
        "manifest unknown",
        "unable to find image",
    ]
    .iter()
    .any(|needle| stderr.contains(needle))
}

fn is_missing_object(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such container")
        || stderr.contains("no such network")
        || stderr.contains("no such volume")
        || stderr.contains("network not found")
}
