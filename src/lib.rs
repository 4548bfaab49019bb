/// Hopline: ETL execution engine
///
/// This library provides the execution core for row-streaming pipelines and
/// control-flow jobs: bounded row sets with backpressure, one task per transform,
/// petgraph-based scheduling, conditional and parallel job hops, and result
/// aggregation.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by pipelines and jobs
pub mod error;

// Typed row values and schemas
pub mod row;

// Lifecycle flags and status text
pub mod status;

// Job results and run outcomes
pub mod result;

// Variables and parameter inheritance between nested runs
pub mod variables;

// Execution listeners for lifecycle events
pub mod listener;

// Pipeline layer - row sets, transform runtimes and the scheduler
pub mod pipeline;

// Job layer - entry graph executor, hops and tracker
pub mod job;

// Plugin registry and built-in transforms / job entries
pub mod plugins;

// Engine context handed to every run
pub mod engine;

// HTTP API layer - remote submission and control of executions
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use engine::Engine;
pub use error::{ChannelError, EngineError};
pub use job::{Job, JobDefinition};
pub use pipeline::{Pipeline, PipelineDefinition, PipelineResult};
pub use result::{JobResult, RunOutcome};
pub use server::start_server;
pub use variables::Variables;
