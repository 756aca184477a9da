use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogConfig, LogFormat, TurnstileConfig};
use turnstile::http::{AdmissionLayer, HttpServer, MetricsServer};
use turnstile::metrics::AdmissionMetrics;

/// Per-client token-bucket admission control in front of an HTTP service.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TurnstileConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.addr {
        config.server.addr = addr;
    }

    init_tracing(&config.log);

    info!("Starting Turnstile admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(addr = %config.server.addr, "Configuration loaded");

    let mut admission = AdmissionLayer::from_config(&config.admission)?;
    let spec = admission.registry().spec();
    info!(
        rate = spec.rate,
        burst = spec.burst,
        key = ?config.admission.key,
        "Admission control initialized"
    );

    let sweeper = match config.admission.eviction()? {
        Some((ttl, every)) => Some(admission.registry().spawn_idle_sweeper(ttl, every)),
        None => {
            info!("Idle eviction disabled; buckets are kept for the life of the process");
            None
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics_server = match config.server.metrics_addr {
        Some(addr) => {
            let metrics = AdmissionMetrics::new(prometheus::Registry::new())?;
            admission = admission.with_metrics(metrics.clone());
            let server = MetricsServer::new(addr, metrics, admission.registry().clone());
            let mut shutdown = shutdown_rx.clone();
            Some(tokio::spawn(server.serve_with_shutdown(async move {
                let _ = shutdown.changed().await;
            })))
        }
        None => {
            info!("Metrics listener disabled");
            None
        }
    };

    let server = HttpServer::new(config.server.addr, admission);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    let _ = shutdown_tx.send(true);
    if let Some(metrics_server) = metrics_server {
        metrics_server.await??;
    }
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Turnstile admission service stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
