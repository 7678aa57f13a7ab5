use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use linkmux::api::{ApiServer, BuildInfo};
use linkmux::config::Config;
use linkmux::dialer::Dialer;
use linkmux::metrics::{self, MetricsExporter, PrometheusExporter};
use linkmux::proxy::ProxyServer;
use linkmux::source::Listener;
use linkmux::store::SourceStore;

#[derive(Parser)]
#[command(name = "linkmux")]
#[command(about = "Accelerating proxy that multiplexes connections across all usable network interfaces")]
struct Args {
    #[arg(short, long, default_value = "config/linkmux.toml")]
    config: String,

    /// Override the proxy bind address from the configuration file
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Override the admin API port from the configuration file
    #[arg(long)]
    api_port: Option<u16>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("linkmux={}", level))
        .init();

    info!("Starting linkmux");

    let mut config = Config::load_or_default(&args.config).await?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.api_port {
        config.api.port = port;
    }
    config.validate()?;

    // Metrics recorder must be in place before the first emission.
    let recorder = metrics::install_recorder()?;
    let exporter: Arc<dyn MetricsExporter> = Arc::new(PrometheusExporter::new());

    let store = Arc::new(SourceStore::new());
    let listener = Listener::new(store.clone(), exporter.clone(), config.probe.target.clone());
    let dialer = Arc::new(Dialer::new(store.clone()));
    dialer.set_metrics_exporter(exporter.clone());

    let proxy = ProxyServer::new(config.server.bind, dialer);
    let api = ApiServer::new(
        config.api.port,
        store,
        BuildInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: option_env!("LINKMUX_COMMIT").unwrap_or("unknown").to_string(),
            build_time: option_env!("LINKMUX_BUILD_TIME").unwrap_or("unknown").to_string(),
            proxy_port: config.server.bind.port(),
        },
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    let mut tasks = Vec::new();
    {
        let rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run(rx).await {
                error!("Listener error: {}", e);
            }
        }));
    }
    {
        let rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = proxy.run(rx).await {
                error!("Proxy server error: {}", e);
            }
        }));
    }
    {
        let rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = api.run(rx).await {
                error!("API server error: {}", e);
            }
        }));
    }
    if config.monitoring.enabled {
        let rx = shutdown_tx.subscribe();
        let port = config.monitoring.metrics_port;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(port, recorder, rx).await {
                error!("Metrics server error: {}", e);
            }
        }));
    }

    signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    warn!("Received CTRL+C, shutting down gracefully...");

    let _ = shutdown_tx.send(());
    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("Task did not stop within the shutdown deadline");
        }
    }

    info!("linkmux shutdown complete");
    Ok(())
}
