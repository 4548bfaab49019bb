/// Plugin registry using ArcSwap
///
/// Maps type ids to factories for transforms and job entries. Registration swaps
/// the whole map atomically, so lookups from running pipelines and jobs never
/// block and never observe a half-updated registry.

use crate::error::EngineError;
use crate::job::entry::JobEntry;
use crate::job::types::JobEntryMeta;
use crate::pipeline::transform::Transform;
use crate::pipeline::types::TransformMeta;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// Creates a transform for one pipeline run from its configuration
pub type TransformFactory = Arc<dyn Fn(&TransformMeta) -> anyhow::Result<Box<dyn Transform>> + Send + Sync>;

/// Creates a job entry for one invocation from its configuration
pub type EntryFactory = Arc<dyn Fn(&JobEntryMeta) -> anyhow::Result<Box<dyn JobEntry>> + Send + Sync>;

/// Lock-free registry of transform and job entry factories
pub struct PluginRegistry {
    /// Key: transform type id
    transforms: ArcSwap<HashMap<String, TransformFactory>>,
    /// Key: job entry type id
    entries: ArcSwap<HashMap<String, EntryFactory>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("transforms", &self.transform_types())
            .field("entries", &self.entry_types())
            .finish()
    }
}

impl PluginRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            transforms: ArcSwap::new(Arc::new(HashMap::new())),
            entries: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Registry with the built-in transforms and job entries
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::plugins::transforms::register(&registry);
        crate::plugins::entries::register(&registry);
        tracing::debug!(
            "🔌 Registered {} built-in transforms and {} built-in job entries",
            registry.transforms.load().len(),
            registry.entries.load().len()
        );
        registry
    }

    /// Add or replace a transform factory
    pub fn register_transform<F>(&self, transform_type: &str, factory: F)
    where
        F: Fn(&TransformMeta) -> anyhow::Result<Box<dyn Transform>> + Send + Sync + 'static,
    {
        let factory: TransformFactory = Arc::new(factory);
        self.transforms.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(transform_type.to_string(), factory.clone());
            next
        });
    }

    /// Add or replace a job entry factory
    pub fn register_entry<F>(&self, entry_type: &str, factory: F)
    where
        F: Fn(&JobEntryMeta) -> anyhow::Result<Box<dyn JobEntry>> + Send + Sync + 'static,
    {
        let factory: EntryFactory = Arc::new(factory);
        self.entries.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(entry_type.to_string(), factory.clone());
            next
        });
    }

    pub fn has_transform_type(&self, transform_type: &str) -> bool {
        self.transforms.load().contains_key(transform_type)
    }

    pub fn has_entry_type(&self, entry_type: &str) -> bool {
        self.entries.load().contains_key(entry_type)
    }

    /// Registered transform type ids, sorted
    pub fn transform_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.transforms.load().keys().cloned().collect();
        types.sort();
        types
    }

    /// Registered job entry type ids, sorted
    pub fn entry_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.load().keys().cloned().collect();
        types.sort();
        types
    }

    /// Instantiate the transform described by `meta`
    pub fn create_transform(&self, meta: &TransformMeta) -> Result<Box<dyn Transform>, EngineError> {
        let factory = self.transforms.load().get(&meta.transform_type).cloned().ok_or_else(|| {
            EngineError::Configuration(format!(
                "transform '{}' has unknown type '{}'",
                meta.name, meta.transform_type
            ))
        })?;
        factory(meta).map_err(|e| {
            EngineError::Configuration(format!(
                "cannot create transform '{}' of type '{}': {:#}",
                meta.name, meta.transform_type, e
            ))
        })
    }

    /// Instantiate the job entry described by `meta`
    pub fn create_entry(&self, meta: &JobEntryMeta) -> Result<Box<dyn JobEntry>, EngineError> {
        let factory = self.entries.load().get(&meta.entry_type).cloned().ok_or_else(|| {
            EngineError::Configuration(format!(
                "job entry '{}' has unknown type '{}'",
                meta.name, meta.entry_type
            ))
        })?;
        factory(meta).map_err(|e| {
            EngineError::Configuration(format!(
                "cannot create job entry '{}' of type '{}': {:#}",
                meta.name, meta.entry_type, e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::entry::EntryContext;
    use crate::result::JobResult;
    use async_trait::async_trait;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl JobEntry for Noop {
        async fn execute(&self, previous: JobResult, _ctx: &EntryContext) -> anyhow::Result<JobResult> {
            Ok(previous)
        }
    }

    fn meta(entry_type: &str) -> JobEntryMeta {
        JobEntryMeta {
            name: "e".into(),
            entry_type: entry_type.into(),
            config: json!({}),
            parallel: false,
            evaluates: None,
            reset_errors: true,
        }
    }

    #[test]
    fn registers_at_runtime() {
        let registry = PluginRegistry::new();
        assert!(!registry.has_entry_type("NOOP"));
        registry.register_entry("NOOP", |_meta| Ok(Box::new(Noop) as Box<dyn JobEntry>));
        assert!(registry.has_entry_type("NOOP"));
        assert!(registry.create_entry(&meta("NOOP")).is_ok());
    }

    #[test]
    fn unknown_and_failing_factories_are_configuration_errors() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.create_entry(&meta("MISSING")),
            Err(EngineError::Configuration(_))
        ));

        registry.register_entry("BROKEN", |_meta| anyhow::bail!("missing 'file' setting"));
        let err = registry.create_entry(&meta("BROKEN")).err().unwrap();
        assert!(err.to_string().contains("missing 'file' setting"));
    }

    #[test]
    fn builtins_are_present() {
        let registry = PluginRegistry::with_builtins();
        for t in ["DataGrid", "Dummy", "RowsToResult", "RowsFromResult", "RowGenerator", "RequireFields", "Abort"] {
            assert!(registry.has_transform_type(t), "missing transform {}", t);
        }
        for e in ["START", "PIPELINE", "JOB", "SUCCESS", "ABORT", "DUMMY", "DELAY"] {
            assert!(registry.has_entry_type(e), "missing entry {}", e);
        }
    }
}
