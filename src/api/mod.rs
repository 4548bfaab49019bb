/// HTTP API Layer
///
/// REST endpoints for remote execution. It handles:
/// - Pipeline and job submission (executed asynchronously)
/// - Listing and inspecting executions
/// - Stopping running executions

// Execution submission and control endpoints
pub mod executions;

// Re-export router builder and state
pub use executions::{create_execution_routes, AppState};
