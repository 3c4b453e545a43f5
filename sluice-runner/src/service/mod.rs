//! Service layer
//!
//! Services the scheduler wires into each step: log multiplexing with
//! secret masking, and the tracer hooks that run around every container.
//!
//! Tracers are trait-based so embedders can inject their own policies.

mod multiplexer;
mod tracer;

// Re-export traits
pub use tracer::Tracer;

// Re-export implementations
pub use multiplexer::{LogMultiplexer, MASK, Masker};
pub use tracer::{EnvTracer, State, TraceFn};
