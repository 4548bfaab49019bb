/// Pipeline execution layer
///
/// Row-streaming dataflow graphs. It provides:
/// - Pipeline definition types (transforms, hops)
/// - Bounded row sets with backpressure between transforms
/// - The per-transform runtime loop
/// - The scheduler that wires, runs and monitors a whole pipeline

// Pipeline definition types
pub mod types;

// Bounded row set between two transforms
pub mod rowset;

// Transform trait, context and runtime loop
pub mod transform;

// Petgraph-based pipeline scheduler
pub mod engine;

// Re-export commonly used types
pub use engine::{NodeFailure, Pipeline, PipelineResult, RunOptions};
pub use rowset::RowSet;
pub use transform::{
    CounterSnapshot, NodeState, ProcessOutcome, Transform, TransformContext, TransformError, TransformStatus,
};
pub use types::{PipelineDefinition, PipelineHop, TransformMeta};
