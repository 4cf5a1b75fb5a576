//! Error handling for the camrelay control tower

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found (unknown camera/session id)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// A live relay session already exists for (camera, output format)
    #[error("Duplicate session for camera {camera_id} ({output_format})")]
    DuplicateSession {
        camera_id: String,
        output_format: String,
    },

    /// Every candidate route probed negative
    #[error("No viable route for camera {0}")]
    NoViableRoute(String),

    /// Inbound capture frame failed validation
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Transcoder process could not be spawned
    #[error("Process spawn failure: {0}")]
    ProcessSpawn(String),

    /// Relay session never left Starting within the startup window
    #[error("Relay timeout: {0}")]
    RelayTimeout(String),

    /// Edge-router management API did not answer
    #[error("Edge router unreachable: {0}")]
    EdgeRouterUnreachable(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::DuplicateSession { .. } => {
                (StatusCode::CONFLICT, "DUPLICATE_SESSION", self.to_string())
            }
            Error::NoViableRoute(id) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NO_VIABLE_ROUTE",
                format!("No viable route for camera {}", id),
            ),
            Error::MalformedPacket(msg) => {
                (StatusCode::BAD_REQUEST, "MALFORMED_PACKET", msg.clone())
            }
            Error::ProcessSpawn(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "PROCESS_SPAWN_FAILURE",
                msg.clone(),
            ),
            Error::RelayTimeout(msg) => {
                (StatusCode::GATEWAY_TIMEOUT, "RELAY_TIMEOUT", msg.clone())
            }
            Error::EdgeRouterUnreachable(msg) => (
                StatusCode::BAD_GATEWAY,
                "EDGE_ROUTER_UNREACHABLE",
                msg.clone(),
            ),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR", e.to_string()),
            Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", e.to_string()),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
