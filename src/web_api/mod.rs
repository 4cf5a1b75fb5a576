//! WebAPI - REST endpoints
//!
//! ## Responsibilities
//!
//! - HTTP API routes
//! - Request validation
//! - Response formatting

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let overlay_ok = state.overlay.health_check().await.unwrap_or(false);

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        registered_cameras: state.failover.registered_count().await,
        live_sessions: state.relay.live_count().await,
        overlay_connected: overlay_ok,
        timestamp: chrono::Utc::now(),
    };
    Json(response)
}

/// Service status endpoint
pub async fn service_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "service": "camrelay",
        "version": env!("CARGO_PKG_VERSION"),
        "registered_cameras": state.failover.registered_count().await,
        "active_routes": state.routing_table.active_count().await,
        "live_sessions": state.relay.live_count().await,
        "monitored_cameras": state.health.monitored_count().await,
    }))
}
