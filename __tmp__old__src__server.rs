//! HTTP/WebSocket server: routes, process lifecycle, and graceful shutdown.
//!
//! Route shape and the `with_graceful_shutdown`/PID-file pattern are
//! grounded on the existing proxy server's `run_server`; the upgrade
//! handler is generalized from the existing terminal endpoint (localhost
//! check, `ConnectInfo`-keyed upgrade) to key sessions by workspace instead
//! of spawning one fixed shell per process.

use crate::config::Config;
use crate::error::SessionError;
use crate::handler::{self, HandlerContext};
use crate::manager::SessionManager;
use crate::pty::SpawnSpec;
use axum::{
    extract::{
        ws::WebSocketUpgrade,
        ConnectInfo, Json, Path as AxumPath, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, trace, warn};

/// A workspace key resolves to the command the broker should spawn if no
/// live session exists yet. The embedding application supplies this.
pub trait SpawnResolver: Send + Sync {
    fn resolve(&self, workspace_key: &str) -> Result<SpawnSpec, SessionError>;
}

/// Resolves every workspace key to the same fixed command and working
/// directory. Sufficient for a single-shell deployment; applications with
/// per-workspace checkouts supply their own `SpawnResolver`.
pub struct FixedSpawnResolver {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl SpawnResolver for FixedSpawnResolver {
    fn resolve(&self, _workspace_key: &str) -> Result<SpawnSpec, SessionError> {
        let mut spec = SpawnSpec::new(&self.command, self.working_dir.clone());
        spec.args = self.args.clone();
        Ok(spec)
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub manager: Arc<SessionManager>,
    pub config: Config,
    pub resolver: Arc<dyn SpawnResolver>,
    pub start_time: Instant,
    pub checkpoint_marker: Option<&'static str>,
    pub resume_marker_prefix: Option<&'static str>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn terminal_ws(
    ws: WebSocketUpgrade,
    AxumPath(workspace_key): AxumPath<String>,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    trace!(ip = %addr.ip(), workspace_key = %workspace_key, "terminal upgrade request");

    let spec = match state.resolver.resolve(&workspace_key) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(workspace_key = %workspace_key, error = %e, "spawn resolution rejected");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let ctx = Arc::new(HandlerContext {
        manager: state.manager.clone(),
        config: state.config.clone(),
        checkpoint_marker: state.checkpoint_marker,
        resume_marker_prefix: state.resume_marker_prefix,
    });

    ws.on_upgrade(move |socket| async move {
        info!(workspace_key = %workspace_key, "terminal connection accepted");
        handler::run(ctx, socket, workspace_key, spec).await;
    })
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/:workspace_key/terminal", get(terminal_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(
    host: &str,
    port: u16,
    config: Config,
    resolver: Arc<dyn SpawnResolver>,
) -> anyhow::Result<()> {
    info!("starting terminal broker v{}", env!("CARGO_PKG_VERSION"));
    info!(host, port, "listening configuration");

    let manager = SessionManager::new(
        config.buffer_bytes,
        Duration::from_secs(config.child_grace_seconds),
    );
    let sweeper = manager.spawn_sweeper(
        Duration::from_secs(config.sweep_interval_seconds),
        Duration::from_secs(config.idle_timeout_seconds),
    );

    let state = Arc::new(ServerState {
        manager,
        config,
        resolver,
        start_time: Instant::now(),
        checkpoint_marker: None,
        resume_marker_prefix: None,
    });

    let app = build_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "server listening");

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    info!("aborting idle sweeper");
    sweeper.abort();

    info!("server shut down gracefully");
    result?;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received terminate signal"),
    }

    info!("initiating graceful shutdown");
}


