//! Gateway HTTP server built on Axum
//!
//! Owns every piece of shared mutable state (registry, resolver + quality
//! cache, MCP session) in one value that is cloned into handlers; there are
//! no module-level singletons.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gateway::{ingress, mcp, sse};
use crate::registry::ServerRegistry;
use crate::resolver::Resolver;

/// Request bodies past this size are rejected before any handler runs.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ServerRegistry>,
    pub resolver: Arc<Resolver>,
    pub session: Arc<mcp::McpSession>,
    pub started_at: Instant,
}

/// The gateway server: shared state plus the listening loop.
pub struct GatewayServer {
    state: AppState,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl GatewayServer {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let registry = ServerRegistry::new(&config);
        registry.start_reaper();

        let resolver = Arc::new(Resolver::new(&config));
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        Self {
            state: AppState {
                config,
                registry,
                resolver,
                session: Arc::new(mcp::McpSession::new()),
                started_at: Instant::now(),
            },
            shutdown_tx,
        }
    }

    /// Construct with an explicit resolver; tests point it at mock registries.
    pub fn with_resolver(config: Config, resolver: Resolver) -> Self {
        let mut server = Self::new(config);
        server.state.resolver = Arc::new(resolver);
        server
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the Axum router with all routes and middleware.
    pub fn router(&self) -> Router {
        let state = self.state.clone();

        Router::new()
            // Per-package transports
            .route("/package/:pkg/sse", get(sse::handle_sse))
            .route("/package/:pkg/respond", post(ingress::handle_message))
            .route("/package/:pkg/messages", post(ingress::handle_message))
            .route("/package/:pkg/message", post(ingress::handle_message))
            // Gateway's own MCP surface
            .route("/mcp", post(mcp::handle_mcp))
            .route("/mcp/capabilities", get(mcp::handle_capabilities))
            // Management
            .route("/servers", get(handle_servers))
            .route("/servers/:id", delete(handle_kill_server))
            .route("/health", get(handle_health))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
                    .layer(CorsLayer::permissive()),
            )
            .with_state(state)
    }

    /// Bind and serve until shutdown is requested.
    pub async fn run(self) -> Result<()> {
        let router = self.router();

        let addr = format!("{}:{}", self.state.config.host, self.state.config.port)
            .parse::<SocketAddr>()
            .map_err(|e| Error::Internal(format!("invalid listen address: {}", e)))?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind {}: {}", addr, e)))?;

        info!("mcpaas gateway listening on {}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("shutting down gateway...");
            })
            .await
            .map_err(|e| Error::Internal(format!("server error: {}", e)))?;

        self.state.registry.shutdown();
        info!("gateway stopped");
        Ok(())
    }

    /// Handle used to trigger graceful shutdown from another task.
    pub fn shutdown_handle(&self) -> tokio::sync::broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

/// `GET /servers` — registry snapshot.
async fn handle_servers(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "servers": state.registry.stats() }))
}

/// `DELETE /servers/{id}` — kill one child.
async fn handle_kill_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, Error> {
    if state.registry.kill(&id) {
        Ok(Json(json!({ "killed": id })))
    } else {
        Err(Error::ServerGone(id))
    }
}

/// `GET /health` — liveness probe.
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeSecs": state.started_at.elapsed().as_secs(),
            "servers": state.registry.live_count(),
        })),
    )
}
