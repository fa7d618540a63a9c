use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use axum::{
    Router,
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Json},
    routing::get,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    clients::health::HealthChecker,
    models::{
        health::HealthStatus,
        response::ApiResponse,
        stats::{DispatchStats, StatsSnapshot},
    },
};

pub struct AppState {
    pub health_checker: HealthChecker,
    pub stats: Arc<DispatchStats>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves health and stats until `token` is cancelled.
pub async fn run_api_server(
    state: Arc<AppState>,
    port: u16,
    token: CancellationToken,
) -> Result<(), Error> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow!("Failed to bind {}: {}", addr, e))?;

    info!(address = %addr, "Health and stats server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(|e| anyhow!("Health and stats server failed: {}", e))?;

    info!("Health and stats server stopped");

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<ApiResponse<StatsSnapshot>> {
    Json(ApiResponse::success(
        state.stats.snapshot(),
        "Dispatch statistics".to_string(),
    ))
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::<()>::error(
            format!("No route for {}", uri.path()),
            "Not found".to_string(),
        )),
    )
}
