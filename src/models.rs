//! Shared data types
//!
//! Camera addressing facts, edge-router records and common API envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Immutable camera identity and addressing facts.
///
/// Created at registration, replaced wholesale on reconfiguration. Routes are
/// never stored on the endpoint; they are derived from these facts plus the
/// current edge-router and overlay state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraEndpoint {
    /// Camera id (caller-assigned, unique)
    pub id: String,
    /// LAN address reachable when the controller sits on the same site
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_address: Option<IpAddr>,
    /// Address assigned on the overlay network
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_address: Option<IpAddr>,
    /// Overlay network the camera is a member of
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_network_id: Option<String>,
    /// Edge router fronting the camera's site
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_router_id: Option<String>,
    /// Camera address on the site-local network behind the edge router
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_address: Option<IpAddr>,
    /// Native stream port (e.g. 554 for RTSP)
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path segment of the camera's native stream URI (e.g. "stream1")
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
}

fn default_stream_path() -> String {
    "stream1".to_string()
}

impl CameraEndpoint {
    /// At least one addressing fact must be present for registration
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.id.trim().is_empty() {
            return Err(crate::error::Error::Validation(
                "camera id must not be empty".to_string(),
            ));
        }
        let has_router_pair = self.edge_router_id.is_some() && self.local_address.is_some();
        if self.direct_address.is_none() && self.overlay_address.is_none() && !has_router_pair {
            return Err(crate::error::Error::Validation(format!(
                "camera {} has no addressing facts (direct, overlay or router+local)",
                self.id
            )));
        }
        Ok(())
    }
}

/// Site-local edge router exposing a management API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRouterRecord {
    pub id: String,
    /// WAN-facing address of the router
    pub gateway_address: IpAddr,
    /// Management API port
    pub api_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Port-forward rule as reported by the edge router's management API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardRule {
    pub external_port: u16,
    pub target_address: IpAddr,
    pub target_port: u16,
}

/// Generic API response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub registered_cameras: usize,
    pub live_sessions: usize,
    pub overlay_connected: bool,
    pub timestamp: DateTime<Utc>,
}
