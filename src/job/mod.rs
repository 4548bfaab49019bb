/// Job execution layer
///
/// Control-flow graphs of job entries. It provides:
/// - Job definition types (entries, conditional hops)
/// - The job entry contract implemented by plugins
/// - The job tracker of entry start / finish records
/// - The recursive graph executor with parallel branches

// Job definition types
pub mod types;

// Job entry trait and execution context
pub mod entry;

// Bounded log of job and entry records
pub mod tracker;

// Recursive job entry graph executor
pub mod engine;

// Re-export commonly used types
pub use engine::Job;
pub use entry::{EntryContext, JobEntry};
pub use tracker::{JobTracker, TrackerEventKind, TrackerRecord};
pub use types::{HopCondition, JobDefinition, JobEntryMeta, JobHop};
