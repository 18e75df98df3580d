//! Listeners of a running broker: TCP sessions, the WebSocket gateway and
//! the HTTP admin endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Serialize;
use skiff_core::{Broker, BrokerStats, NoopWatcher, Watcher};
use skiff_transport::{Gateway, SessionServer, SessionStats};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::metrics::{self, Listener, MetricsWatcher};

/// Shared state of the admin endpoint.
pub struct AppState {
    /// The registry.
    pub broker: Arc<Broker>,
    /// TCP session counters.
    pub tcp: Arc<SessionStats>,
    /// WebSocket connection counters, when the gateway runs.
    pub websocket: Option<Arc<SessionStats>>,
    started: Instant,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(broker: Arc<Broker>, tcp: Arc<SessionStats>, websocket: Option<Arc<SessionStats>>) -> Self {
        Self {
            broker,
            tcp,
            websocket,
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ConnectionStats {
    total: u64,
    active: u64,
    failed: u64,
}

impl From<&SessionStats> for ConnectionStats {
    fn from(stats: &SessionStats) -> Self {
        Self {
            total: stats.total(),
            active: stats.active(),
            failed: stats.failed(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    broker: BrokerStats,
    delivered: u64,
    discarded: u64,
    tcp: ConnectionStats,
    websocket: Option<ConnectionStats>,
}

/// Admin routes: health, listings, counters and removal.
pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/mq/queues", get(list_queues))
        .route("/mq/topics", get(list_topics))
        .route("/mq/stats", get(stats_handler))
        .route("/mq/queues/:name", delete(delete_queue))
        .route("/mq/topics/:name", delete(delete_topic))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}

async fn list_queues(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.broker.queue_names())
}

async fn list_topics(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.broker.topic_names())
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let broker = state.broker.stats();
    Json(StatsResponse {
        delivered: broker.delivered(),
        discarded: broker.discarded(),
        broker,
        tcp: state.tcp.as_ref().into(),
        websocket: state.websocket.as_deref().map(ConnectionStats::from),
    })
}

async fn delete_queue(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> StatusCode {
    if state.broker.remove_queue(&name) {
        info!(queue = %name, "Queue removed by admin");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn delete_topic(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> StatusCode {
    if state.broker.remove_topic(&name) {
        info!(topic = %name, "Topic removed by admin");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Bound listening sockets of a server.
#[derive(Debug)]
pub struct Listeners {
    /// Broker (TCP) listener.
    pub broker: TcpListener,
    /// WebSocket listener.
    pub websocket: Option<TcpListener>,
    /// HTTP admin listener.
    pub http: Option<TcpListener>,
}

async fn bind(addr: SocketAddr, what: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {what} listener on {addr}"))
}

impl Listeners {
    /// Bind every enabled listener of `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if an address is invalid or cannot be bound.
    pub async fn bind(config: &Config) -> Result<Self> {
        let broker = bind(config.broker_addr()?, "broker").await?;
        let websocket = match config.ws_addr()? {
            Some(addr) => Some(bind(addr, "WebSocket").await?),
            None => None,
        };
        let http = match config.http_addr()? {
            Some(addr) => Some(bind(addr, "HTTP admin").await?),
            None => None,
        };
        Ok(Self { broker, websocket, http })
    }
}

/// Run the broker until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(&config.host, config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let listeners = Listeners::bind(&config).await?;
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C, shutting down"),
        }
        shutdown.send_replace(true);
    });

    serve(config, listeners, shutdown_rx).await
}

/// Serve on already bound listeners until `shutdown` flips, then stop
/// every listener and close the registry.
///
/// # Errors
///
/// Returns an error if a listener fails.
pub async fn serve(config: Config, listeners: Listeners, shutdown: watch::Receiver<bool>) -> Result<()> {
    let watcher: Arc<dyn Watcher> = if config.metrics.enabled {
        Arc::new(MetricsWatcher)
    } else {
        Arc::new(NoopWatcher)
    };
    let broker = Arc::new(Broker::with_watcher(config.broker_config(), watcher));
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    let sessions = SessionServer::new(Arc::clone(&broker), config.session_config());
    let tcp = sessions.stats();
    let mut sampled = vec![Listener {
        transport: "tcp",
        stats: Arc::clone(&tcp),
    }];
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move { sessions.serve(listeners.broker, shutdown).await.context("Broker listener failed") });
    }

    let websocket = match listeners.websocket {
        Some(listener) => {
            let gateway = Gateway::new(Arc::clone(&broker), config.gateway_config());
            let stats = gateway.stats();
            sampled.push(Listener {
                transport: "websocket",
                stats: Arc::clone(&stats),
            });
            let shutdown = shutdown.clone();
            tasks.spawn(async move { gateway.serve(listener, shutdown).await.context("WebSocket listener failed") });
            Some(stats)
        }
        None => None,
    };

    if let Some(listener) = listeners.http {
        let app = admin_router(Arc::new(AppState::new(Arc::clone(&broker), tcp, websocket)));
        info!("HTTP admin listening on {}", listener.local_addr()?);
        let mut shutdown = shutdown.clone();
        tasks.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await
                .context("HTTP admin failed")
        });
    }

    if config.metrics.enabled {
        let every = Duration::from_millis(config.metrics.sample_interval_ms.max(1));
        let broker = Arc::clone(&broker);
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            metrics::run_sampler(broker, sampled, every, shutdown).await;
            Ok(())
        });
    }

    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.context("Listener task failed").and_then(|r| r);
        if let Err(e) = outcome {
            error!(error = %e, "Listener stopped");
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    broker.close();
    info!("Broker stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_client::ClientBuilder;
    use skiff_protocol::Target;

    struct Running {
        broker_addr: SocketAddr,
        http_url: String,
        shutdown: watch::Sender<bool>,
        server: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start() -> Running {
        let mut config = Config::default();
        config.metrics.enabled = false;
        let listeners = Listeners {
            broker: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            websocket: Some(TcpListener::bind("127.0.0.1:0").await.unwrap()),
            http: Some(TcpListener::bind("127.0.0.1:0").await.unwrap()),
        };
        let broker_addr = listeners.broker.local_addr().unwrap();
        let http_url = format!("http://{}", listeners.http.as_ref().unwrap().local_addr().unwrap());
        let (shutdown, rx) = watch::channel(false);
        let server = tokio::spawn(serve(config, listeners, rx));
        Running {
            broker_addr,
            http_url,
            shutdown,
            server,
        }
    }

    #[tokio::test]
    async fn test_admin_lists_and_removes() {
        let running = start().await;
        let client = ClientBuilder::new(running.broker_addr.to_string());
        let publisher = client.publisher(Target::queue("orders"));
        publisher.ready().await.unwrap();
        publisher.publish(b"one").await.unwrap();
        let subscriber = client.subscriber(Target::topic("news"), |_: skiff_protocol::Message| {});
        subscriber.ready().await.unwrap();

        let http = reqwest::Client::new();
        let health: serde_json::Value = http
            .get(format!("{}/health", running.http_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let queues: Vec<String> = http
            .get(format!("{}/mq/queues", running.http_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(queues, vec!["orders".to_string()]);

        let topics: Vec<String> = http
            .get(format!("{}/mq/topics", running.http_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(topics, vec!["news".to_string()]);

        let stats: serde_json::Value = http
            .get(format!("{}/mq/stats", running.http_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["tcp"]["active"], 2);
        assert_eq!(stats["topics"][0]["name"], "news");

        let removed = http
            .delete(format!("{}/mq/topics/news", running.http_url))
            .send()
            .await
            .unwrap();
        assert_eq!(removed.status(), reqwest::StatusCode::NO_CONTENT);
        let missing = http
            .delete(format!("{}/mq/queues/absent", running.http_url))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        publisher.close().await.unwrap();
        subscriber.close().await.unwrap();
        running.shutdown.send_replace(true);
        running.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_listener() {
        let running = start().await;
        running.shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), running.server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(tokio::net::TcpStream::connect(running.broker_addr).await.is_err());
    }
}
