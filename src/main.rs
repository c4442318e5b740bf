use std::sync::Arc;

use anyhow::Context;

use distcalc::api::api_routes;
use distcalc::config::OrchestratorConfig;
use distcalc::scheduler::{Scheduler, spawn_lease_sweep};
use distcalc::store::{LibSqlBackend, TaskStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OrchestratorConfig::from_env();

    eprintln!("🧮 distcalc v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API:      http://0.0.0.0:{}/api/v1", config.port);
    eprintln!("   Workers:  http://0.0.0.0:{}/internal/task", config.port);
    eprintln!("   Database: {}", config.db_path);
    eprintln!(
        "   Lease:    {}s (sweep every {}s)\n",
        config.scheduler.lease_timeout.as_secs(),
        config.scheduler.sweep_interval.as_secs()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlBackend::new_local(db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path))?,
    );

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(store, config.scheduler.clone()));
    let sweep_handle = spawn_lease_sweep(Arc::clone(&scheduler));

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = api_routes(Arc::clone(&scheduler));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl+C received, shutting down...");
            }
        })
        .await
        .context("server error")?;

    sweep_handle.abort();
    Ok(())
}
