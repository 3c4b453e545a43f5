//! Sluice Core
//!
//! Core types for the Sluice pipeline engine.
//!
//! This crate contains:
//! - Domain types: steps, pipeline definitions, output lines, execution state
//! - The error taxonomy shared by the engine and its front-ends

pub mod domain;
pub mod error;

pub use error::{EngineError, RuntimeError};
