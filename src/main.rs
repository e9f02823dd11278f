use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use outproxy::config::{GatewayConfig, LoggingConfig, StoreConfig};
use outproxy::gateway::{trust, GatewayServer, GatewayState, UpstreamProxy};
use outproxy::mesh::{Cluster, MeshStore};
use outproxy::ratelimit::{
    CounterStore, MemoryStore, RateController, RateLimiter, RedisStore, SlidingWindow,
};

/// Rate-pacing forwarding gateway.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "OUTPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Upstream origin to forward to
    #[arg(long)]
    upstream: Option<String>,

    /// Initial requests-per-window ceiling
    #[arg(long)]
    ceiling: Option<u64>,

    /// Redis URL for the shared counter store
    #[arg(long, conflicts_with = "memory")]
    redis: Option<String>,

    /// Keep counters in process memory instead of a shared store
    #[arg(long)]
    memory: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn apply(self, config: &mut GatewayConfig) {
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        if let Some(upstream) = self.upstream {
            config.upstream.url = upstream;
        }
        if let Some(ceiling) = self.ceiling {
            config.rate_limiting.initial_ceiling = ceiling;
        }
        if let Some(url) = self.redis {
            config.store = StoreConfig::Redis { url };
        }
        if self.memory {
            config.store = StoreConfig::Memory;
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config =
        GatewayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging);

    info!("Starting Outproxy gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        upstream = %config.upstream.url,
        ceiling = config.rate_limiting.initial_ceiling,
        "Configuration loaded"
    );

    // Trust must be in place before anything is served
    let tls = trust::bootstrap(&config.upstream)
        .await
        .context("Failed to bootstrap upstream trust")?;
    let forwarder = UpstreamProxy::new(
        &config.upstream.url,
        tls,
        Duration::from_secs(config.upstream.connect_timeout_secs),
        Duration::from_secs(config.upstream.keepalive_secs),
    )?;

    let window = config.rate_limiting.window()?;
    let (store, cluster, purge): (
        Arc<dyn CounterStore>,
        Option<Arc<Cluster>>,
        Option<JoinHandle<()>>,
    ) =
        match &config.store {
            StoreConfig::Memory => {
                let store = Arc::new(MemoryStore::new());
                let purge = spawn_purge(window, {
                    let store = store.clone();
                    move || {
                        let store = store.clone();
                        async move { store.purge_expired(&window) }
                    }
                });
                (store, None, Some(purge))
            }
            StoreConfig::Redis { url } => (
                Arc::new(
                    RedisStore::connect(url)
                        .await
                        .context("Failed to connect to counter store")?,
                ),
                None,
                // Redis expires idle keys on its own
                None,
            ),
            StoreConfig::Mesh(mesh) => {
                let cluster = Arc::new(
                    Cluster::start(mesh.cluster_config())
                        .await
                        .context("Failed to start gossip mesh")?,
                );
                info!(
                    live_nodes = cluster.live_node_count().await,
                    "Joined gossip mesh"
                );
                let store = Arc::new(MeshStore::new(cluster.clone()));
                let purge = spawn_purge(window, {
                    let store = store.clone();
                    move || {
                        let store = store.clone();
                        async move {
                            store.purge_expired(&window).await;
                        }
                    }
                });
                (store, Some(cluster), Some(purge))
            }
        };
    info!(store = store.name(), "Counter store initialized");

    let limiter = RateLimiter::new(
        store,
        config.rate_limiting.namespace.clone(),
        window,
        config.rate_limiting.initial_ceiling,
    );
    let state = GatewayState::new(
        Arc::new(RateController::new(limiter)),
        config.rate_limiting.pacing(),
        Arc::new(forwarder),
        Arc::from(config.server.client_key.extractor()),
    );

    GatewayServer::new(config.server.listen_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    if let Some(purge) = purge {
        purge.abort();
        let _ = purge.await;
    }

    if let Some(cluster) = cluster {
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => info!("Gossip mesh still in use, skipping graceful leave"),
        }
    }

    info!("Outproxy gateway stopped");
    Ok(())
}

/// Periodically drop counters that have left the window.
fn spawn_purge<F, Fut>(window: SlidingWindow, purge: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(window.period().max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            purge().await;
        }
    })
}

/// Install the global tracing subscriber.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));

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
