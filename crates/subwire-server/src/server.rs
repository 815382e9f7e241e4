//! `SubwireServer`: axum router with the GraphQL WebSocket endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use subwire_core::{Role, SubProtocolKind};
use subwire_protocol::{build_adapter, negotiate};
use subwire_session::{Executor, ResponderSession};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::connections::{ConnectionSlot, ConnectionTracker};
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_UPGRADES_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::axum_frames;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Executes accepted operations.
    pub executor: Arc<dyn Executor>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Admitted connections.
    pub connections: Arc<ConnectionTracker>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The GraphQL-over-WebSocket responder server.
pub struct SubwireServer {
    config: Arc<ServerConfig>,
    executor: Arc<dyn Executor>,
    connections: Arc<ConnectionTracker>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl SubwireServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, executor: Arc<dyn Executor>) -> Self {
        let connections = Arc::new(ConnectionTracker::new(config.max_connections));
        Self {
            config: Arc::new(config),
            executor,
            connections,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            executor: self.executor.clone(),
            config: self.config.clone(),
            connections: self.connections.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(&self.config.path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the connection tracker.
    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.connections
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Bind `host:port` and serve in the background.
    pub async fn listen(self) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        self.serve(listener)
    }

    /// Serve on an already bound listener in the background.
    pub fn serve(self, listener: TcpListener) -> Result<ServerHandle, ServerError> {
        let addr = listener.local_addr()?;
        let router = self.router();
        let stop = self.shutdown.token();

        info!(%addr, path = %self.config.path, "subwire server started");

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
            {
                warn!(error = %e, "server stopped with error");
            }
        });

        Ok(ServerHandle {
            addr,
            path: self.config.path.clone(),
            shutdown_timeout: self.config.shutdown_timeout,
            connections: self.connections,
            shutdown: self.shutdown,
            server,
        })
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    addr: SocketAddr,
    path: String,
    shutdown_timeout: std::time::Duration,
    connections: Arc<ConnectionTracker>,
    shutdown: Arc<ShutdownCoordinator>,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `ws://` URL of the GraphQL endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.addr, self.path)
    }

    /// Admitted connections.
    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.connections
    }

    /// Stop accepting, close every session with "going away" and wait
    /// (bounded by the configured timeout) for them to finish.
    pub async fn shutdown(self) {
        let connections = self.connections.clone();
        let drain = tokio::spawn(async move { connections.wait_until_idle().await });
        self.shutdown
            .graceful_shutdown(vec![self.server, drain], Some(self.shutdown_timeout))
            .await;
        info!("subwire server stopped");
    }
}

/// GET `<path>`: negotiate the sub-protocol and upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return reject(StatusCode::SERVICE_UNAVAILABLE, "shutdown", "Server shutting down");
    }

    let offered = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok());
    let Some(kind) = negotiate(offered, &state.config.protocols) else {
        return reject(StatusCode::BAD_REQUEST, "subprotocol", "Subprotocol not acceptable");
    };

    let Some(slot) = state.connections.try_acquire() else {
        return reject(
            StatusCode::SERVICE_UNAVAILABLE,
            "capacity",
            "Too many connections",
        );
    };

    ws.protocols([kind.name()])
        .on_upgrade(move |socket| serve_socket(socket, kind, slot, state))
}

fn reject(status: StatusCode, reason: &'static str, body: &'static str) -> Response {
    warn!(status = status.as_u16(), reason, "websocket upgrade rejected");
    counter!(WS_UPGRADES_REJECTED_TOTAL, "reason" => reason).increment(1);
    (status, body).into_response()
}

/// Run one responder session over an upgraded socket.
#[instrument(skip_all, fields(protocol = kind.name()))]
async fn serve_socket(
    socket: WebSocket,
    kind: SubProtocolKind,
    mut slot: ConnectionSlot,
    state: AppState,
) {
    let protocol = build_adapter(kind, Role::Responder, state.config.legacy_errors);
    let session = ResponderSession::new(
        protocol,
        state.executor.clone(),
        state.config.session.clone(),
    )
    .with_shutdown(state.shutdown.session_token());
    slot.attach(session.id().clone(), session.registry());

    let (stream, sink) = axum_frames(socket);
    match session.run(stream, sink).await {
        Ok(()) => debug!("connection closed"),
        Err(e) => info!(error = %e, code = %e.close_code(), "connection failed"),
    }
    drop(slot);
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.count(),
        state.connections.active_operations(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
