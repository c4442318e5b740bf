use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use uuid::Uuid;

use distcalc::agent::{HttpTaskSource, TaskSource, Worker};
use distcalc::config::AgentConfig;

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

    let config = AgentConfig::from_env();
    let operators = if config.operators.is_empty() {
        "all".to_string()
    } else {
        config
            .operators
            .iter()
            .map(|op| op.name())
            .collect::<Vec<_>>()
            .join(",")
    };

    eprintln!("🛠  distcalc-agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Orchestrator: {}", config.orchestrator_url);
    eprintln!("   Workers:      {}", config.computing_power);
    eprintln!("   Operators:    {operators}");
    eprintln!("   Latency:      {}\n", if config.simulate_latency { "simulated" } else { "off" });

    let client = HttpTaskSource::client().context("failed to build HTTP client")?;
    let source: Arc<dyn TaskSource> =
        Arc::new(HttpTaskSource::new(client, &config.orchestrator_url));

    let agent_id = Uuid::new_v4().simple().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(config.computing_power);
    for i in 0..config.computing_power {
        let worker = Worker::new(
            Arc::clone(&source),
            format!("agent-{}-{i}", &agent_id[..8]),
            &config,
        );
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }
    tracing::info!(workers = handles.len(), "Agent running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    tracing::info!("Ctrl+C received, shutting down...");
    shutdown_tx.send(true).ok();

    for joined in futures::future::join_all(handles).await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "Worker task panicked");
        }
    }
    Ok(())
}
