//! Core domain types
//!
//! The fundamental entities of a pipeline run. Shared between the engine
//! (which executes them) and front-ends (which load and display them).

pub mod line;
pub mod pipeline;
pub mod state;
pub mod step;

pub use line::{Line, LineKind};
pub use pipeline::{PipelineSpec, Stage};
pub use state::{ExecutionState, ExitState, Outcome};
pub use step::{RegistryAuth, Resources, Step};
