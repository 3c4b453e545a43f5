//! Node combinators
//!
//! [`Serial`] runs children in order and stops admitting them once the
//! pipeline has failed, except for children that run on failure.
//! [`Parallel`] runs every child on its own task and joins them all;
//! which branches run is decided once, before any of them starts, so a
//! failing branch never vetoes or aborts a sibling.

use async_trait::async_trait;
use sluice_core::EngineError;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info_span};

use super::Node;
use crate::context::BuildContext;

/// Children run one after another
pub struct Serial {
    name: String,
    nodes: Vec<Arc<dyn Node>>,
}

impl Serial {
    pub fn new(nodes: Vec<Arc<dyn Node>>) -> Self {
        Self::named("serial", nodes)
    }

    pub fn named(name: impl Into<String>, nodes: Vec<Arc<dyn Node>>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }
}

#[async_trait]
impl Node for Serial {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_run(&self, ctx: &BuildContext) -> bool {
        self.nodes.iter().any(|node| node.should_run(ctx))
    }

    async fn skip(&self, ctx: &BuildContext) {
        for node in &self.nodes {
            node.skip(ctx).await;
        }
    }

    async fn execute(&self, ctx: Arc<BuildContext>) -> Result<(), EngineError> {
        for node in &self.nodes {
            match node.run(Arc::clone(&ctx)).await {
                Ok(()) => {}
                // Already recorded in ctx; keep going for on-failure nodes
                Err(e) if e.is_step_failure() || e.is_skip() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Children run concurrently and are all joined
pub struct Parallel {
    name: String,
    nodes: Vec<Arc<dyn Node>>,
}

impl Parallel {
    pub fn new(nodes: Vec<Arc<dyn Node>>) -> Self {
        Self::named("parallel", nodes)
    }

    pub fn named(name: impl Into<String>, nodes: Vec<Arc<dyn Node>>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }
}

#[async_trait]
impl Node for Parallel {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_run(&self, ctx: &BuildContext) -> bool {
        self.nodes.iter().any(|node| node.should_run(ctx))
    }

    async fn skip(&self, ctx: &BuildContext) {
        for node in &self.nodes {
            node.skip(ctx).await;
        }
    }

    /// Returns the first branch error in declaration order, preferring
    /// fatal errors over step failures
    async fn execute(&self, ctx: Arc<BuildContext>) -> Result<(), EngineError> {
        let admitted: Vec<bool> = self.nodes.iter().map(|node| node.should_run(&ctx)).collect();

        let handles: Vec<_> = self
            .nodes
            .iter()
            .zip(admitted)
            .map(|(node, admitted)| {
                let node = Arc::clone(node);
                let ctx = Arc::clone(&ctx);
                let span = info_span!("branch", node = %node.name());
                tokio::spawn(
                    async move {
                        if !admitted {
                            debug!(node = %node.name(), "Branch not admitted by run policy");
                            node.skip(&ctx).await;
                            return Ok(());
                        }
                        node.execute(ctx).await
                    }
                    .instrument(span),
                )
            })
            .collect();

        let mut first: Option<EngineError> = None;
        for (node, handle) in self.nodes.iter().zip(handles) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(node = %node.name(), "Branch task panicked: {}", e);
                    let panic = EngineError::Panic(format!("{}: {}", node.name(), e));
                    ctx.record_error(panic.clone());
                    Err(panic)
                }
            };

            let Err(e) = result else { continue };
            if e.is_skip() {
                continue;
            }
            first = match first {
                None => Some(e),
                Some(prev) if !prev.is_fatal() && e.is_fatal() => Some(e),
                keep => keep,
            };
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
