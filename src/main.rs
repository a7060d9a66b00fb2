use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use txnscope_watcher::client::{RpcConfig, RpcLedgerClient, DEFAULT_ENDPOINT};
use txnscope_watcher::config::{WatcherConfig, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SNAPSHOT_FILE};
use txnscope_watcher::redis_storage::RedisStorage;
use txnscope_watcher::storage::{JsonFileStorage, Storage};
use txnscope_watcher::{api, Watcher};

#[derive(Parser, Debug)]
#[command(name = "txnscope-watcher", about = "Watch ledger addresses and record their transactions")]
struct Args {
    /// Ledger JSON-RPC endpoint
    #[arg(long, env = "TXNSCOPE_URL", default_value = DEFAULT_ENDPOINT)]
    url: String,

    /// Height to treat as already processed when no snapshot exists (default: chain tip)
    #[arg(long, env = "TXNSCOPE_STARTBLOCK")]
    startblock: Option<u64>,

    /// Snapshot file used when no Redis URL is given
    #[arg(long, env = "TXNSCOPE_FILE", default_value = DEFAULT_SNAPSHOT_FILE)]
    file: String,

    /// Address to bind the HTTP API to
    #[arg(long, env = "TXNSCOPE_LISTEN", default_value = "0.0.0.0:8082")]
    listen: SocketAddr,

    /// Seconds between chain height polls
    #[arg(long, env = "TXNSCOPE_POLL_INTERVAL_SECS", default_value_t = DEFAULT_POLL_INTERVAL_MS / 1_000)]
    poll_interval_secs: u64,

    /// Store snapshots in Redis instead of the JSON file
    #[arg(long, env = "TXNSCOPE_REDIS_URL")]
    redis_url: Option<String>,
}

impl Args {
    fn watcher_config(&self) -> WatcherConfig {
        let mut config = WatcherConfig::with_endpoint(self.url.clone())
            .poll_every(Duration::from_secs(self.poll_interval_secs));
        config.snapshot_path = self.file.clone();
        if let Some(start) = self.startblock {
            config = config.start_height(start);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.watcher_config();

    let client = RpcLedgerClient::new(RpcConfig {
        endpoint: config.endpoint.clone(),
        timeout_ms: config.request_timeout_ms,
    })
    .context("invalid ledger endpoint")?;

    let storage: Arc<dyn Storage> = match &args.redis_url {
        Some(url) => Arc::new(
            RedisStorage::connect(url, &config.endpoint)
                .await
                .context("failed to connect to Redis")?,
        ),
        None => Arc::new(JsonFileStorage::new(
            config.snapshot_path(),
            config.endpoint.clone(),
        )),
    };
    info!(storage = %storage.describe(), endpoint = %config.endpoint, "Starting watcher");

    let watcher = Arc::new(Watcher::init(config, Arc::new(client), storage).await?);
    watcher.start()?;

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("HTTP API listening on {}", args.listen);

    axum::serve(listener, api::router(Arc::clone(&watcher)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    watcher.stop().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
