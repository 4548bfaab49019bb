/// Server setup and initialization
///
/// Wires together the engine, the execution records and the HTTP routes.
/// Provides the main application factory function for creating the Axum app.

use crate::{
    api::executions::{create_execution_routes, AppState},
    config::Config,
    engine::Engine,
};
use anyhow::Result;
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Create the shared application state for the given configuration
pub fn create_state(config: &Config) -> AppState {
    tracing::info!(
        "⚙️ Initializing execution engine (rowset_size={}, feedback_size={})",
        config.engine.rowset_size,
        config.engine.feedback_size
    );
    let engine = Engine::with_config(config.engine.clone());
    tracing::info!("🔌 Registered transforms: {:?}", engine.registry().transform_types());
    tracing::info!("🔌 Registered job entries: {:?}", engine.registry().entry_types());
    AppState::with_retention(engine, config.server.execution_retention())
}

/// Create the main Axum application with all routes
pub fn create_app(state: AppState) -> Router {
    tracing::info!("📡 Creating HTTP router with all endpoints");
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Execution submission and control routes
        .merge(create_execution_routes().with_state(state))
}

/// Start the HTTP server with the given configuration
///
/// Creates the application and serves it on the configured address until
/// Ctrl-C, then stops every execution that is still running.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Hopline server...");

    let state = create_state(&config);
    let app = create_app(state.clone());

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    tracing::info!("👋 Server stopped");
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Cannot listen for the shutdown signal: {}", e);
        return;
    }
    tracing::info!("🛑 Shutdown requested, stopping running executions");
    state.stop_all().await;
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
