//! Sluice Runner
//!
//! The engine that executes pipelines as sequences of containers.
//!
//! Architecture:
//! - Configuration: engine settings from environment or defaults
//! - Runtime: the container runtime trait and its podman implementation
//! - Context: shared per-pipeline state, resource tracking and teardown
//! - Nodes: single steps and their serial/parallel compositions
//! - Services: log multiplexing with secret masking, tracer hooks
//! - Scheduler: pipeline construction, the step sequencer and the driver loop
//!
//! Front-ends build a [`scheduler::Pipeline`] with
//! [`scheduler::PipelineBuilder`] and either run it with
//! [`scheduler::drive`] or consume its `next`/`exec` protocol directly.

pub mod config;
pub mod context;
pub mod node;
pub mod runtime;
pub mod scheduler;
pub mod service;

pub use config::EngineConfig;
pub use context::BuildContext;
pub use runtime::{PodmanRuntime, Runtime};
pub use scheduler::{Event, Pipeline, PipelineBuilder, StopHandle, drive};
