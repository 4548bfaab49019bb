/// Execution engine context
///
/// Bundles the engine configuration, the plugin registry and the execution
/// listeners. Every pipeline and job run receives the engine explicitly; there is
/// no global registry.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::job::engine::Job;
use crate::job::types::JobDefinition;
use crate::listener::{ExecutionListener, Listeners};
use crate::pipeline::engine::{Pipeline, PipelineResult, RunOptions};
use crate::pipeline::types::PipelineDefinition;
use crate::plugins::registry::PluginRegistry;
use crate::result::{JobResult, RunOutcome};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct EngineInner {
    config: EngineConfig,
    registry: PluginRegistry,
    listeners: Listeners,
}

/// Cheaply cloneable handle to the engine context
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig, registry: PluginRegistry) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry,
                listeners: Listeners::new(),
            }),
        }
    }

    /// Engine with the built-in plugins and the given configuration
    pub fn with_config(config: EngineConfig) -> Self {
        Self::new(config, PluginRegistry::with_builtins())
    }

    /// Engine with the built-in plugins and the default configuration
    pub fn with_builtins() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    pub fn listeners(&self) -> &Listeners {
        &self.inner.listeners
    }

    pub fn add_listener(&self, listener: Arc<dyn ExecutionListener>) {
        self.inner.listeners.add(listener);
    }

    /// Validate and wire a pipeline without running it
    pub fn prepare_pipeline(&self, def: &PipelineDefinition, options: RunOptions) -> Result<Pipeline, EngineError> {
        Pipeline::prepare(self, def, options)
    }

    /// Run a pipeline to completion
    pub async fn run_pipeline(&self, def: &PipelineDefinition) -> RunOutcome<PipelineResult> {
        let pipeline = match self.prepare_pipeline(def, RunOptions::default()) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                tracing::error!("❌ Pipeline '{}' rejected: {}", def.name, e);
                return RunOutcome::failed(PipelineResult::empty(&def.name), e);
            }
        };
        let outcome = pipeline.run().await;
        pipeline.dispose().await;
        outcome
    }

    /// Validate a job without running it
    pub fn prepare_job(&self, def: &JobDefinition, parent_stop: Option<CancellationToken>) -> Result<Job, EngineError> {
        Job::prepare(self, def, parent_stop)
    }

    /// Run a job to completion, starting from `initial`
    pub async fn run_job(&self, def: &JobDefinition, initial: JobResult) -> RunOutcome<JobResult> {
        match self.prepare_job(def, None) {
            Ok(job) => job.run(initial).await,
            Err(e) => {
                tracing::error!("❌ Job '{}' rejected: {}", def.name, e);
                let mut result = initial;
                result.success = false;
                RunOutcome::failed(result, e)
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::with_builtins()
    }
}
