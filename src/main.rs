/// Hopline: ETL execution engine
///
/// Main entry point for the Hopline server. Initializes configuration and starts
/// the HTTP server that accepts pipeline and job definitions for execution.

use hopline::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Pipeline and job submission at /api/pipelines and /api/jobs
/// - Execution inspection and stop at /api/executions/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3004, HOPLINE_* overrides)
    let config = Config::default();

    // Start the server
    start_server(config).await?;

    Ok(())
}
