//! Executable pipeline nodes
//!
//! A node is anything the sequencer can run against a build context: a
//! single step, or a [`Serial`]/[`Parallel`] composition of other nodes.

mod combinator;
mod step;

pub use combinator::{Parallel, Serial};
pub use step::StepNode;

use async_trait::async_trait;
use sluice_core::EngineError;
use std::sync::Arc;

use crate::context::BuildContext;

#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the node's run policy admits it given the pipeline state
    fn should_run(&self, _ctx: &BuildContext) -> bool {
        true
    }

    /// Reports the node as not run
    ///
    /// Steps emit a `skipped` status line; composites forward to children.
    async fn skip(&self, _ctx: &BuildContext) {}

    /// Runs the node without consulting its run policy
    ///
    /// Step failures are recorded in `ctx` before they are returned, so a
    /// caller may ignore the value and still observe the failure.
    async fn execute(&self, ctx: Arc<BuildContext>) -> Result<(), EngineError>;

    /// Runs the node if its run policy admits it, otherwise skips it
    async fn run(&self, ctx: Arc<BuildContext>) -> Result<(), EngineError> {
        if !self.should_run(&ctx) {
            self.skip(&ctx).await;
            return Ok(());
        }
        self.execute(ctx).await
    }
}
