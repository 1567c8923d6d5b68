use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pawn_netcode::config::NetcodeConfig;
use pawn_netcode::metrics::{self, NetcodeMetrics};
use pawn_netcode::sim::{run_realtime, LoopbackSession, SessionConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Pawn Netcode v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let netcode = NetcodeConfig::load_or_default();
    netcode.validate()?;
    let session_config = SessionConfig::load_or_default();
    info!(
        "Configuration loaded: {} clients, {} Hz, {:.1}s, clock scale {}",
        session_config.clients,
        session_config.tick_rate,
        session_config.duration_secs,
        session_config.client_clock_scale
    );

    // Initialize metrics
    let metrics = Arc::new(NetcodeMetrics::new());

    // Metrics server on port 9090 (METRICS_PORT, 0 disables)
    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9090);

    if metrics_port != 0 {
        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let ticks = session_config.total_ticks();
    let mut session = LoopbackSession::new(session_config, netcode, metrics.clone());

    // Shutdown signal handler
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = run_realtime(&mut session, ticks) => {
            match result {
                Ok(report) => info!("Session report:\n{}", serde_json::to_string_pretty(&report)?),
                Err(e) => error!("Session error: {}", e),
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    info!("Metrics:\n{}", metrics.to_json());
    Ok(())
}
