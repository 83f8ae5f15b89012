//! HTTP surface: WebSocket upgrade, `/health`, `/metrics`, and startup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::StreamExt;
use hotline_core::ConnectionId;
use hotline_settings::{ChannelSettings, HotlineSettings};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::channel::{ChannelHandle, ChannelObserver, run_channel};
use crate::directory::DirectoryStats;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::manager::{Manager, ManagerHandle};
use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_REFUSED_TOTAL, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::shutdown::ShutdownCoordinator;

/// Shared state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Sender side of the dispatcher queue.
    pub manager: ManagerHandle,
    /// Pump settings applied to every connection.
    pub channel: Arc<ChannelSettings>,
    /// Live connection count.
    pub connections: Arc<AtomicUsize>,
    /// Upgrades beyond this are refused.
    pub max_connections: usize,
    /// Latest directory counts from the dispatcher.
    pub stats: watch::Receiver<DirectoryStats>,
    /// Renders `/metrics` when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
    /// Root shutdown token; each connection runs on a child of it.
    pub shutdown: CancellationToken,
}

/// Build the router. `ws_path` is the upgrade endpoint.
pub fn build_router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Spawn the dispatcher, bind the listener, and start serving.
///
/// Everything stops when `shutdown` fires.
pub async fn start(
    settings: &HotlineSettings,
    metrics: Option<PrometheusHandle>,
    shutdown: &ShutdownCoordinator,
) -> Result<ServerHandle, ServerError> {
    let (manager, stats) = Manager::new(settings);
    let (manager_handle, inbound) = ManagerHandle::channel(settings.dispatcher.queue_capacity);
    let dispatcher = tokio::spawn(manager.run(inbound, shutdown.token()));

    let state = AppState {
        manager: manager_handle,
        channel: Arc::new(settings.channel.clone()),
        connections: Arc::new(AtomicUsize::new(0)),
        max_connections: settings.server.max_connections,
        stats,
        metrics,
        start_time: Instant::now(),
        shutdown: shutdown.token(),
    };
    let router = build_router(state, &settings.server.ws_path);

    let bind = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    let addr = listener.local_addr()?;
    info!(%addr, ws_path = %settings.server.ws_path, "hotline server listening");

    let token = shutdown.token();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        addr,
        server,
        dispatcher,
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    addr: SocketAddr,
    server: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl ServerHandle {
    /// Bound address (useful when the configured port was `0`).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Background tasks, for [`ShutdownCoordinator::graceful_shutdown`].
    pub fn into_tasks(self) -> Vec<JoinHandle<()>> {
        vec![self.server, self.dispatcher]
    }
}

/// Holds one slot of the connection limit until dropped.
struct ConnectionSlot {
    connections: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(connections: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let prev = connections.fetch_add(1, Ordering::AcqRel);
        if prev >= max {
            let _ = connections.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self {
            connections: Arc::clone(connections),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// GET `<ws_path>`
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let Some(slot) = ConnectionSlot::acquire(&state.connections, state.max_connections) else {
        counter!(WS_CONNECTIONS_REFUSED_TOTAL).increment(1);
        warn!(max = state.max_connections, "connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };
    ws.max_message_size(state.channel.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, slot))
}

/// Run one connection from upgrade to teardown.
async fn handle_socket(socket: WebSocket, state: AppState, slot: ConnectionSlot) {
    let (channel, outbound) = ChannelHandle::new(
        ConnectionId::new(),
        &state.channel,
        state.shutdown.child_token(),
    );
    info!(connection_id = %channel.id(), "connection opened");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let (writer, reader) = socket.split();
    let observer: Arc<dyn ChannelObserver> = Arc::new(state.manager.clone());
    run_channel(
        writer,
        reader,
        Arc::clone(&channel),
        outbound,
        observer,
        &state.channel,
    )
    .await;

    info!(
        connection_id = %channel.id(),
        dropped_frames = channel.drop_count(),
        "connection closed"
    );
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    drop(slot);
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = *state.stats.borrow();
    let connections = state.connections.load(Ordering::Acquire);
    Json(health::health_check(state.start_time, connections, stats))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
