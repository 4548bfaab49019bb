/// Plugin layer
///
/// Factories for transforms and job entries, keyed by type id, plus the
/// built-in implementations registered by `PluginRegistry::with_builtins`.

// Lock-free factory registry using ArcSwap
pub mod registry;

// Built-in row transforms
pub mod transforms;

// Built-in job entries
pub mod entries;

pub use registry::{EntryFactory, PluginRegistry, TransformFactory};
