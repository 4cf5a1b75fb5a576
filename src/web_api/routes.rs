//! API Routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::Error;
use crate::models::{ApiResponse, CameraEndpoint, EdgeRouterRecord};
use crate::relay_supervisor::OutputFormat;
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/healthz", get(super::health_check))
        .route("/api/status", get(super::service_status))
        // Cameras
        .route("/api/cameras", get(list_cameras))
        .route("/api/cameras", post(register_camera))
        .route("/api/cameras/status", get(list_camera_status))
        .route("/api/cameras/:id", get(get_camera))
        .route("/api/cameras/:id", delete(unregister_camera))
        .route("/api/cameras/:id/status", get(camera_status))
        .route("/api/cameras/:id/failover", post(force_failover))
        .route("/api/cameras/:id/route-test", post(route_test))
        .route("/api/cameras/:id/relays", get(camera_relays))
        // Relay sessions
        .route("/api/relays", post(start_relay))
        .route("/api/relays/:id", get(relay_status))
        .route("/api/relays/:id", delete(stop_relay))
        // Edge routers
        .route("/api/edge-routers", post(put_edge_router))
        .with_state(state)
}

async fn list_cameras(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let cameras = state.datastore.list_cameras().await?;
    Ok(Json(ApiResponse::success(cameras)))
}

async fn list_camera_status(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let statuses = state.failover.list_status().await;
    Ok(Json(ApiResponse::success(statuses)))
}

async fn register_camera(
    State(state): State<AppState>,
    Json(endpoint): Json<CameraEndpoint>,
) -> Result<impl IntoResponse, Error> {
    let status = state.failover.register_camera(endpoint).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(status))))
}

async fn get_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let endpoint = state
        .datastore
        .get_camera(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("camera {}", id)))?;
    Ok(Json(ApiResponse::success(endpoint)))
}

async fn unregister_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.failover.unregister_camera(&id).await?;
    state.relay.stop_for_camera(&id).await;
    Ok(Json(ApiResponse::success(serde_json::json!({ "id": id }))))
}

/// Connectivity snapshot; degraded states are data, not errors
async fn camera_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let status = state
        .failover
        .status(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("camera {}", id)))?;
    Ok(Json(ApiResponse::success(status)))
}

/// Ops hook: drop the current route and re-run selection
async fn force_failover(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let status = state.failover.force_failover(&id).await?;
    Ok(Json(ApiResponse::success(status)))
}

/// Diagnostics: run a fresh route selection without touching the camera's
/// failover state
async fn route_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let endpoint = state
        .datastore
        .get_camera(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("camera {}", id)))?;
    let route = state.selector.select_optimal(&endpoint).await?;
    Ok(Json(ApiResponse::success(route)))
}

async fn camera_relays(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let sessions = state.relay.get_for_camera(&id).await;
    Ok(Json(ApiResponse::success(sessions)))
}

#[derive(Debug, Deserialize)]
struct StartRelayRequest {
    camera_id: String,
    output_format: OutputFormat,
}

async fn start_relay(
    State(state): State<AppState>,
    Json(req): Json<StartRelayRequest>,
) -> Result<impl IntoResponse, Error> {
    let endpoint = state
        .datastore
        .get_camera(&req.camera_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("camera {}", req.camera_id)))?;

    let route = state
        .routing_table
        .active_route(&req.camera_id)
        .await
        .ok_or_else(|| Error::NoViableRoute(req.camera_id.clone()))?;

    let input_uri = route.connection_uri(&endpoint);
    let session_id = state
        .relay
        .start(&req.camera_id, &input_uri, req.output_format)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(serde_json::json!({
            "session_id": session_id
        }))),
    ))
}

async fn relay_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let session = state
        .relay
        .get_status(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("session {}", id)))?;
    Ok(Json(ApiResponse::success(session)))
}

async fn stop_relay(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.relay.stop(&id).await?;
    Ok(Json(ApiResponse::success(serde_json::json!({ "id": id }))))
}

async fn put_edge_router(
    State(state): State<AppState>,
    Json(router): Json<EdgeRouterRecord>,
) -> Result<impl IntoResponse, Error> {
    state.datastore.put_edge_router(router.clone()).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(router))))
}
