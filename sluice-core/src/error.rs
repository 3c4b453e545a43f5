//! Error types for the Sluice engine

use thiserror::Error;

/// Errors reported by a container runtime
///
/// Payloads are plain strings so the error can be cloned into the
/// pipeline's first-error slot and into tracer snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The image is not present locally; callers may pull and retry
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The container, network or volume does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A runtime command exited unsuccessfully
    #[error("`{command}` failed with exit code {code}: {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The runtime produced output that could not be understood
    #[error("unexpected runtime output: {0}")]
    Parse(String),

    /// Spawning or talking to the runtime failed
    #[error("I/O error: {0}")]
    Io(String),
}

impl RuntimeError {
    pub fn command(command: impl Into<String>, code: i32, stderr: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            code,
            stderr: stderr.into(),
        }
    }

    pub fn is_image_not_found(&self) -> bool {
        matches!(self, Self::ImageNotFound(_))
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors that terminate a step or a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Sentinel: do not execute this step. Never a failure.
    #[error("step skipped")]
    Skip,

    /// Sentinel: cancellation was requested from outside
    #[error("pipeline cancelled")]
    Cancelled,

    #[error("step {step} exited with code {code}")]
    Exit { step: String, code: i32 },

    #[error("step {step} was killed: out of memory")]
    Oom { step: String },

    #[error("step {step} timed out after {seconds}s")]
    Timeout { step: String, seconds: u64 },

    /// The runtime failed while driving a step
    #[error("step {step}: {source}")]
    Runtime {
        step: String,
        #[source]
        source: RuntimeError,
    },

    /// Pipeline-scoped networks or volumes could not be created
    #[error("pipeline setup failed: {0}")]
    Setup(#[source] RuntimeError),

    /// A tracer vetoed the pipeline
    #[error("aborted by tracer: {0}")]
    Trace(String),

    /// A step or branch task panicked
    #[error("task panicked: {0}")]
    Panic(String),

    #[error("invalid pipeline: {0}")]
    Invalid(String),
}

impl EngineError {
    pub fn runtime(step: impl Into<String>, source: RuntimeError) -> Self {
        Self::Runtime {
            step: step.into(),
            source,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this is an expected step failure (exit, OOM, timeout)
    ///
    /// Step failures let `run_on_failure` steps proceed.
    pub fn is_step_failure(&self) -> bool {
        matches!(
            self,
            Self::Exit { .. } | Self::Oom { .. } | Self::Timeout { .. }
        )
    }

    /// Whether this error aborts the pipeline outright
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Runtime { .. }
                | Self::Setup(_)
                | Self::Trace(_)
                | Self::Panic(_)
                | Self::Invalid(_)
        )
    }

    /// Process exit code conventionally associated with this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Skip => 0,
            Self::Exit { code, .. } => *code,
            Self::Oom { .. } => 137,
            Self::Timeout { .. } => 124,
            Self::Cancelled => 130,
            _ => 1,
        }
    }
}
