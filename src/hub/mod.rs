//! Admin HTTP endpoints
//!
//! `POST /reload-proxies` re-reads the upstream definitions file and
//! fires the reload notification consumed by the pool. `GET /proxies`
//! returns the current pool snapshot.

use crate::config::DefinitionsManager;
use crate::pool::Pool;
use crate::Result;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const RELOAD_TOKEN_HEADER: &str = "x-reload-token";

/// Shared state for the admin handlers
#[derive(Clone)]
pub struct AppState {
    pub definitions: Arc<DefinitionsManager>,
    pub pool: Arc<Pool>,
}

/// Create the admin router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/reload-proxies", post(reload_proxies))
        .route("/proxies", get(get_proxies))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the admin API until the process exits
pub async fn start_server(state: AppState, addr: SocketAddr) -> Result<()> {
    info!(listen = %addr, "admin HTTP server listening");
    axum::Server::bind(&addr)
        .serve(create_router(state).into_make_service())
        .await
        .map_err(|e| crate::Error::config(format!("admin server error: {}", e)))
}

async fn reload_proxies(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> (StatusCode, String) {
    let token = headers
        .get(RELOAD_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !state.definitions.check_reload_token(token) {
        warn!("unauthorized attempt to reload proxies");
        return (StatusCode::UNAUTHORIZED, "Unauthorized\n".to_string());
    }

    match state.definitions.load().await {
        Ok(()) => {
            state.definitions.trigger_reload();
            info!("proxy definitions reload triggered");
            (
                StatusCode::OK,
                "Proxy definitions reload triggered successfully.\n".to_string(),
            )
        }
        Err(e) => {
            warn!(err = %e, "error reloading proxy definitions");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error reloading proxy definitions: {}\n", e),
            )
        }
    }
}

async fn get_proxies(
    State(state): State<AppState>,
) -> Json<Vec<crate::pool::UpstreamSnapshot>> {
    Json(state.pool.snapshot().await)
}
