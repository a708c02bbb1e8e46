use anyhow::Context;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::{
    Json, Router,
    extract::Extension,
    routing::get,
};
use clap::Parser;
use gossip_cluster::config::{Config, LoggingConfig, load_config};
use gossip_cluster::metrics::{RecorderMetrics, describe_metrics, init_metrics, prometheus_handle};
use gossip_cluster::state::{Channel, GSet};
use gossip_cluster::{ClusterInfo, Peer, PeerBuilder};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(5);
const MEMBERS_KEY: &str = "members";

/// Run a gossip cluster peer.
#[derive(Debug, Parser)]
#[command(name = "gossip-node", version)]
struct Args {
    /// YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Gossip listen address (UDP and TCP), overrides the config file.
    #[arg(long)]
    bind: Option<String>,

    /// Known peer `host:port`. Repeatable; replaces the configured list.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Status and metrics HTTP address, overrides the config file.
    #[arg(long)]
    http: Option<String>,
}

#[derive(Clone)]
struct AppState {
    peer: Arc<Peer>,
    set: Arc<GSet>,
    channel: Arc<Channel>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    name: String,
    cluster_size: usize,
    position: usize,
    failed_peers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AddItemRequest {
    item: String,
}

#[derive(Debug, Serialize)]
struct AddItemResponse {
    added: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.cluster.bind_address = bind;
    }
    if !args.peers.is_empty() {
        config.cluster.known_peers = args.peers;
    }
    if let Some(http) = args.http {
        config.http.bind = http;
    }

    init_tracing(&config.logging);
    init_metrics()?;
    describe_metrics();

    tracing::info!("Starting node on {}", config.cluster.bind_address);
    if config.cluster.known_peers.is_empty() {
        tracing::info!("No known peers, starting as the first node");
    } else {
        tracing::info!("Known peers: {:?}", config.cluster.known_peers);
    }

    // 1. Peer:
    let shutdown = CancellationToken::new();
    let cluster = config.cluster.clone();
    let peer = PeerBuilder::new(cluster.clone())
        .metrics(Arc::new(RecorderMetrics))
        .cancel(shutdown.clone())
        .create()
        .await?;
    tracing::info!("Node ID: {}", peer.name());

    // 2. Replicated state:
    let set = Arc::new(GSet::new());
    let channel = Arc::new(peer.add_state(MEMBERS_KEY, set.clone(), Arc::new(RecorderMetrics)));
    set.add(peer.name().to_string());
    tracing::info!("Replicating node set under key {:?}", channel.key());

    // 3. Join and settle:
    if let Err(e) = peer
        .join(cluster.reconnect_interval(), cluster.reconnect_timeout())
        .await
    {
        tracing::warn!("Initial join failed, will keep retrying: {}", e);
    }
    channel.broadcast(GSet::delta(&[peer.name().to_string()])?);

    {
        let peer = peer.clone();
        let shutdown = shutdown.clone();
        let interval = cluster.gossip_interval() * 10;
        tokio::spawn(async move {
            peer.settle(&shutdown, interval).await;
        });
    }

    // 4. Stats reporter:
    {
        let peer = peer.clone();
        let set = set.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let peers = peer.peers();
                tracing::info!(
                    "Cluster stats: {} members, {} failed, {} set items ({})",
                    peers.len(),
                    peer.failed_count(),
                    set.len(),
                    peer.status()
                );
                for node in peers {
                    tracing::info!("  - {}", node);
                }
            }
        });
    }

    // 5. HTTP server:
    if config.http.bind.is_empty() {
        tracing::info!("HTTP server disabled");
        tracing::info!("Press Ctrl+C to shutdown");
        tokio::signal::ctrl_c().await?;
    } else {
        let state = AppState {
            peer: peer.clone(),
            set,
            channel,
        };
        let app = Router::new()
            .route("/status", get(handle_status))
            .route("/info", get(handle_info))
            .route("/set", get(handle_get_set).post(handle_add_item))
            .route("/metrics", get(handle_metrics))
            .layer(Extension(state));

        let http_addr: SocketAddr = config
            .http
            .bind
            .parse()
            .with_context(|| format!("invalid http bind address {:?}", config.http.bind))?;
        let listener = tokio::net::TcpListener::bind(http_addr).await?;
        tracing::info!("HTTP server listening on {}", http_addr);
        tracing::info!("Press Ctrl+C to shutdown");

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
    }

    tracing::info!("Shutting down");
    shutdown.cancel();
    if let Err(e) = peer.leave(LEAVE_TIMEOUT).await {
        tracing::warn!("Leaving the cluster failed: {}", e);
    }
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn handle_status(Extension(state): Extension<AppState>) -> Json<StatusResponse> {
    let peer = &state.peer;
    Json(StatusResponse {
        status: peer.status(),
        name: peer.name().to_string(),
        cluster_size: peer.cluster_size(),
        position: peer.position(),
        failed_peers: peer
            .failed_peers()
            .iter()
            .map(|addr| addr.to_string())
            .collect(),
    })
}

async fn handle_info(Extension(state): Extension<AppState>) -> Json<ClusterInfo> {
    Json(state.peer.info())
}

async fn handle_get_set(Extension(state): Extension<AppState>) -> Json<Vec<String>> {
    Json(state.set.items())
}

async fn handle_add_item(
    Extension(state): Extension<AppState>,
    Json(request): Json<AddItemRequest>,
) -> (StatusCode, Json<AddItemResponse>) {
    if request.item.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(AddItemResponse { added: false }));
    }

    let added = state.set.add(request.item.clone());
    if added {
        match GSet::delta(&[request.item]) {
            Ok(delta) => state.channel.broadcast(delta),
            Err(e) => {
                tracing::error!("Failed to encode set delta: {:#}", e);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(AddItemResponse { added }),
                );
            }
        }
    }
    (StatusCode::OK, Json(AddItemResponse { added }))
}

async fn handle_metrics() -> impl IntoResponse {
    match prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            String::new(),
        ),
    }
}
