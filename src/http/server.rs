//! HTTP server wiring the named policies into a router.

use axum::extract::State;
use axum::middleware::from_fn_with_state;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::guard::{enforce, make_http_guard};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::PolicyRegistry;

/// HTTP server for the guarded routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The named policies
    registry: PolicyRegistry,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, registry: PolicyRegistry) -> Self {
        Self { addr, registry }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let app = build_router(&self.registry);

        info!(addr = %local_addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

/// Build the router with every named policy installed.
///
/// The global policy wraps everything; the others guard their own routes.
/// Handlers other than `/health` stand in for the services that sit behind
/// the guards.
pub fn build_router(registry: &PolicyRegistry) -> Router {
    let login = Router::new()
        .route("/api/auth/login", post(accepted))
        .route_layer(from_fn_with_state(make_http_guard(registry.login()), enforce));

    let send = Router::new()
        .route("/api/messages/send", post(accepted))
        .route_layer(from_fn_with_state(
            make_http_guard(registry.message_send()),
            enforce,
        ));

    let api = Router::new()
        .route("/api/v1/{*rest}", any(accepted))
        .route_layer(from_fn_with_state(make_http_guard(registry.api_key()), enforce));

    let webhooks = Router::new()
        .route("/webhooks/{*source}", post(accepted))
        .route_layer(from_fn_with_state(make_http_guard(registry.webhook()), enforce));

    let health = Router::new()
        .route("/health", get(health))
        .with_state(registry.clone());

    Router::new()
        .merge(login)
        .merge(send)
        .merge(api)
        .merge(webhooks)
        .merge(health)
        .layer(from_fn_with_state(make_http_guard(registry.global()), enforce))
}

async fn accepted() -> Json<Value> {
    Json(json!({ "status": "accepted" }))
}

async fn health(State(registry): State<PolicyRegistry>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "records": registry.record_counts(),
    }))
}
