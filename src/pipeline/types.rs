/// Pipeline definition types
///
/// A pipeline is a directed acyclic graph of transforms connected by hops. These
/// types are deserialized from JSON (API submissions, nested pipeline entries) and
/// compiled into a petgraph DAG before execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name used in logs, tracker records and row set names
    pub name: String,
    /// Transforms of the pipeline, in declaration order
    #[serde(default)]
    pub transforms: Vec<TransformMeta>,
    /// Hops connecting transforms
    #[serde(default)]
    pub hops: Vec<PipelineHop>,
    /// Optional override of the row set capacity for this pipeline
    #[serde(default)]
    pub rowset_size: Option<usize>,
    /// Declared parameters and their default values
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Configuration of a single transform
///
/// `transform_type` selects the factory in the plugin registry, `config` is handed
/// to that factory untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformMeta {
    /// Unique transform name within the pipeline
    pub name: String,
    /// Plugin type id (e.g., "DataGrid", "Dummy", "RowsToResult")
    #[serde(rename = "type")]
    pub transform_type: String,
    /// Transform specific configuration
    #[serde(default)]
    pub config: Value,
    /// With several outputs: true hands rows out round-robin, false copies each
    /// row to every output
    #[serde(default = "default_true")]
    pub distribute: bool,
}

/// Directed hop between two transforms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineHop {
    pub from: String,
    pub to: String,
    /// Disabled hops are ignored when the graph is built
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Error hops receive the rows rejected by `from`
    #[serde(default)]
    pub error: bool,
}

fn default_true() -> bool {
    true
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transforms: Vec::new(),
            hops: Vec::new(),
            rowset_size: None,
            parameters: HashMap::new(),
        }
    }

    /// Declare a parameter with its default value
    pub fn parameter(mut self, name: &str, default: &str) -> Self {
        self.parameters.insert(name.to_string(), default.to_string());
        self
    }

    /// Add a transform with the given configuration
    pub fn transform(mut self, name: &str, transform_type: &str, config: Value) -> Self {
        self.transforms.push(TransformMeta {
            name: name.to_string(),
            transform_type: transform_type.to_string(),
            config,
            distribute: true,
        });
        self
    }

    /// Add a transform that copies rows to all of its outputs
    pub fn copying_transform(mut self, name: &str, transform_type: &str, config: Value) -> Self {
        self = self.transform(name, transform_type, config);
        if let Some(meta) = self.transforms.last_mut() {
            meta.distribute = false;
        }
        self
    }

    pub fn hop(mut self, from: &str, to: &str) -> Self {
        self.hops.push(PipelineHop {
            from: from.to_string(),
            to: to.to_string(),
            enabled: true,
            error: false,
        });
        self
    }

    pub fn error_hop(mut self, from: &str, to: &str) -> Self {
        self.hops.push(PipelineHop {
            from: from.to_string(),
            to: to.to_string(),
            enabled: true,
            error: true,
        });
        self
    }

    pub fn with_rowset_size(mut self, size: usize) -> Self {
        self.rowset_size = Some(size);
        self
    }

    pub fn find_transform(&self, name: &str) -> Option<&TransformMeta> {
        self.transforms.iter().find(|t| t.name == name)
    }
}
