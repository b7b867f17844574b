use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bouncer::config::{BouncerConfig, LoggingConfig};
use bouncer::http::HttpServer;
use bouncer::runtime::Bouncer;

/// Adaptive admission control service.
#[derive(Debug, Parser)]
#[command(name = "bouncer", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "BOUNCER_CONFIG")]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Redis URL for shared counters
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = BouncerConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(url) = args.redis_url.filter(|u| !u.is_empty()) {
        config.shared_store.url = Some(url);
    }

    init_tracing(&config.logging);

    info!("Starting Bouncer admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        file = args.config.as_deref().unwrap_or("<none>"),
        listen_addr = %config.server.listen_addr,
        shared_store = config.shared_store.url.is_some(),
        "Configuration loaded"
    );

    let addr = config.server.listen_addr;
    let bouncer = Arc::new(Bouncer::from_config(config)?);
    let maintenance = bouncer.spawn_maintenance();

    HttpServer::new(addr, &bouncer)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    maintenance.abort();
    info!("Bouncer stopped");
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
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
