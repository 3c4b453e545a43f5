//! Pipeline construction
//!
//! Turns a [`PipelineSpec`] into a runnable [`Pipeline`]: validates the
//! definition, creates pipeline-scoped networks and volumes, and maps every
//! stage onto a node.

use sluice_core::EngineError;
use sluice_core::domain::{Line, PipelineSpec, Stage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Pipeline;
use crate::config::EngineConfig;
use crate::context::BuildContext;
use crate::node::{Node, Parallel, StepNode};
use crate::runtime::Runtime;
use crate::service::{Masker, Tracer};

/// Assembles pipelines against one runtime
pub struct PipelineBuilder {
    runtime: Arc<dyn Runtime>,
    config: EngineConfig,
    tracer: Option<Arc<dyn Tracer>>,
    masked: Vec<String>,
}

impl PipelineBuilder {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            runtime,
            config: EngineConfig::default(),
            tracer: None,
            masked: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Adds values to mask in every output line
    pub fn mask<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.masked.extend(values.into_iter().map(Into::into));
        self
    }

    /// Builds a pipeline from its definition
    ///
    /// Returns the pipeline and the receiving half of its log pipe. Networks
    /// and volumes created before a failure are removed again.
    pub async fn build(
        self,
        spec: &PipelineSpec,
    ) -> Result<(Pipeline, mpsc::Receiver<Line>), EngineError> {
        spec.validate()?;

        let network = spec.networks.first().cloned();
        let masker = Masker::new(self.masked.iter().chain(&spec.masked).cloned());
        let (ctx, rx) = BuildContext::new(
            spec.id,
            spec.name.clone(),
            self.runtime,
            self.tracer,
            self.config,
            masker,
            network,
        );

        if let Err(e) = create_resources(&ctx, spec).await {
            ctx.teardown().await;
            return Err(e);
        }

        let nodes = nodes_for(spec.stages());
        info!(
            pipeline = %spec.id,
            "Pipeline '{}' built with {} node(s)", spec.name, nodes.len()
        );

        Ok((Pipeline::new(ctx, nodes), rx))
    }

    /// Builds a pipeline from an explicit node list
    ///
    /// No networks or volumes are created.
    pub fn assemble(
        self,
        name: impl Into<String>,
        nodes: Vec<Arc<dyn Node>>,
    ) -> (Pipeline, mpsc::Receiver<Line>) {
        let (ctx, rx) = BuildContext::new(
            Uuid::new_v4(),
            name,
            self.runtime,
            self.tracer,
            self.config,
            Masker::new(self.masked),
            None,
        );
        (Pipeline::new(ctx, nodes), rx)
    }
}

async fn create_resources(ctx: &BuildContext, spec: &PipelineSpec) -> Result<(), EngineError> {
    let runtime = ctx.runtime();

    for network in &spec.networks {
        debug!(pipeline = %spec.id, "Creating network {}", network);
        runtime.network_create(network).await.map_err(|e| {
            warn!(pipeline = %spec.id, "Failed to create network {}: {}", network, e);
            EngineError::Setup(e)
        })?;
        ctx.register_network(network.clone());
    }

    for volume in &spec.volumes {
        debug!(pipeline = %spec.id, "Creating volume {}", volume);
        runtime.volume_create(volume).await.map_err(|e| {
            warn!(pipeline = %spec.id, "Failed to create volume {}: {}", volume, e);
            EngineError::Setup(e)
        })?;
        ctx.register_volume(volume.clone());
    }

    Ok(())
}

/// One node per stage; steps are numbered from 1 across the pipeline
fn nodes_for(stages: Vec<Stage>) -> Vec<Arc<dyn Node>> {
    let mut number = 0;
    stages
        .into_iter()
        .map(|stage| {
            let mut steps: Vec<Arc<dyn Node>> = stage
                .steps
                .into_iter()
                .map(|step| {
                    number += 1;
                    Arc::new(StepNode::new(step, number)) as Arc<dyn Node>
                })
                .collect();

            if steps.len() == 1 {
                steps.remove(0)
            } else {
                Arc::new(Parallel::named(stage.name, steps)) as Arc<dyn Node>
            }
        })
        .collect()
}
