/// Error taxonomy of the execution core
///
/// Plugin code (transforms, job entries, listeners) reports failures as `anyhow::Error`;
/// the engine wraps them into the categories below so callers can tell a broken
/// definition from a failing node or a failing parallel branch.

use thiserror::Error;

/// Failures of a bounded row set operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The row set was marked done; nothing can be put on it anymore
    #[error("row set '{0}' is closed")]
    Closed(String),

    /// A blocked put/get was woken up by a stop request
    #[error("row set '{0}' interrupted by stop request")]
    Stopped(String),

    /// The row does not conform to the schema attached to the row set
    #[error("row set '{rowset}' expects {expected} field(s) but got {actual}")]
    SchemaMismatch {
        rowset: String,
        expected: usize,
        actual: usize,
    },
}

impl ChannelError {
    /// True when the failure is the cooperative stop path rather than a real error
    pub fn is_stop(&self) -> bool {
        matches!(self, ChannelError::Stopped(_))
    }
}

/// Top-level engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad or missing graph reference, unknown plugin type, missing start entry.
    /// Always raised before execution starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Structural problem in a graph definition (unknown node, forbidden cycle)
    #[error("graph error: {0}")]
    Graph(String),

    /// A single transform or job entry failed
    #[error("'{node}' failed: {cause:#}")]
    NodeExecution { node: String, cause: anyhow::Error },

    /// A branch launched in parallel failed; only the first failure is carried
    #[error("parallel branch '{entry}' failed: {source}")]
    ParallelBranch {
        entry: String,
        #[source]
        source: Box<EngineError>,
    },

    /// The pipeline ran to completion but one or more transforms failed
    #[error("pipeline '{pipeline}' failed with {count} error(s), first: {first}")]
    PipelineFailed {
        pipeline: String,
        count: usize,
        first: String,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl EngineError {
    /// Wrap a plugin failure for the named node
    pub fn node(node: impl Into<String>, cause: anyhow::Error) -> Self {
        EngineError::NodeExecution {
            node: node.into(),
            cause,
        }
    }

    /// True for errors raised before anything was executed
    pub fn is_configuration(&self) -> bool {
        matches!(self, EngineError::Configuration(_) | EngineError::Graph(_))
    }
}

/// Readable text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
