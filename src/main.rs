// =============================================================================
// Vertex Market Simulator — Main Entry Point
// =============================================================================
//
// Boots the shared state, spawns the periodic subsystem tasks (broadcast
// flush, candle flush, transaction queue, pool monitor), and serves the
// REST + WebSocket API until ctrl-c.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broadcast;
mod candles;
mod config;
mod engine;
mod events;
mod indicators;
mod pool;
mod queue;
mod types;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Vertex Market Simulator — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = ServerConfig::from_env();
    info!(
        bind_addr = %config.bind_addr,
        max_simulations = config.max_simulations,
        decision_workers = config.decision_workers,
        "configuration loaded"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = AppState::new(config.clone());

    // ── 3. Background subsystem tasks ────────────────────────────────────
    let (shutdown_tx, task_handles) = state.spawn_background_tasks();

    // ── 4. API + WebSocket server ────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    state.shutdown(&shutdown_tx);
    for handle in task_handles {
        let _ = handle.await;
    }
    server.abort();

    info!("Vertex Market Simulator shut down complete.");
    Ok(())
}
