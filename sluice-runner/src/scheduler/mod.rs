//! Scheduler layer for the engine
//!
//! This layer turns pipeline definitions into sequencers and drives them:
//! the builder creates pipeline-scoped resources and nodes, the sequencer
//! exposes the step-by-step control protocol, and the driver loop consumes
//! it while draining the log pipe.

mod builder;
mod driver;
mod sequencer;

pub use builder::PipelineBuilder;
pub use driver::drive;
pub use sequencer::{Event, Pipeline, StopHandle};
