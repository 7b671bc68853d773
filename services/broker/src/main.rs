//! vend broker daemon.
//!
//! Wires the store, locker, launchpad, broker service and syncer together
//! and serves the HTTP boundary until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vend_broker::config::Config;
use vend_broker::http;
use vend_broker::service::Broker;
use vend_broker::state::AppState;
use vend_broker::syncer::Syncer;
use vend_plugin::{CommandLaunchpad, Launchpad};
use vend_store::{
    Locker, MemoryLocker, MemoryStore, RedisLocker, RedisStore, ResourceStore, DEFAULT_EVENT_LIMIT,
};

#[derive(Debug, Parser)]
#[command(name = "vend-broker", about = "On-demand resource broker")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "vend.yaml")]
    config: PathBuf,

    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Number of syncer workers.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Redis URL for shared state; in-memory when omitted.
    #[arg(long)]
    redis_url: Option<String>,

    /// Per-pool event log cap.
    #[arg(long, default_value_t = DEFAULT_EVENT_LIMIT)]
    event_limit: usize,

    /// Prometheus exporter listen address; disabled when omitted.
    #[arg(long)]
    metrics_listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    info!("Starting vend broker");

    let config = Arc::new(Config::load(&args.config)?);
    info!(
        plugins = config.plugins.len(),
        pools = config.pools.len(),
        "Configuration loaded"
    );

    if let Some(addr) = args.metrics_listen {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install the Prometheus exporter")?;
        info!(addr = %addr, "Metrics exporter listening");
    }

    let (store, locker): (Arc<dyn ResourceStore>, Arc<dyn Locker>) = match &args.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url)
                .await
                .context("failed to connect the Redis store")?
                .with_event_limit(args.event_limit);
            let locker = RedisLocker::connect(url)
                .await
                .context("failed to connect the Redis locker")?;
            info!(url = %url, "Using the Redis store");
            (Arc::new(store), Arc::new(locker))
        }
        None => {
            info!("Using the in-memory store");
            (
                Arc::new(MemoryStore::with_event_limit(args.event_limit)),
                Arc::new(MemoryLocker::new()),
            )
        }
    };

    let launchpad: Arc<dyn Launchpad> = Arc::new(CommandLaunchpad::new());
    if let Err(err) = launchpad.set_launchers(config.plugin_cmds()).await {
        // Committed plugins keep working; a later reconfigure can retry the
        // rest.
        error!(error = %err, "some plugins failed to launch");
    }

    let broker = Broker::new(
        Arc::clone(&store),
        Arc::clone(&locker),
        Arc::clone(&launchpad),
        Arc::clone(&config),
    );
    let syncer = Syncer::new(store, locker, Arc::clone(&launchpad), config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let syncer_task = tokio::spawn({
        let workers = args.workers;
        async move { syncer.run(workers, shutdown_rx).await }
    });

    let app = http::create_router(AppState::new(broker));
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(addr = %args.listen, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    if shutdown_tx.send(true).is_err() {
        warn!("syncer already gone");
    }
    syncer_task.await?;
    launchpad.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}
