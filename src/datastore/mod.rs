//! Datastore collaborator
//!
//! Camera and edge-router records live in an external datastore whose schema
//! is owned elsewhere. This module exposes the narrow get/put surface the
//! relay core needs, plus an in-memory implementation used as the default
//! backend and by every test.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::models::{CameraEndpoint, EdgeRouterRecord};

/// Connectivity state written back for external observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStatusWriteback {
    pub camera_id: String,
    /// Failover state name ("active", "fallback_active", "all_routes_failed", ...)
    pub state: String,
    /// Canonical identity of the route in use, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_key: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Narrow read/write interface over the external datastore
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get_camera(&self, id: &str) -> Result<Option<CameraEndpoint>>;
    async fn put_camera(&self, endpoint: CameraEndpoint) -> Result<()>;
    async fn delete_camera(&self, id: &str) -> Result<()>;
    async fn list_cameras(&self) -> Result<Vec<CameraEndpoint>>;

    async fn get_edge_router(&self, id: &str) -> Result<Option<EdgeRouterRecord>>;
    async fn put_edge_router(&self, router: EdgeRouterRecord) -> Result<()>;

    /// Observability write-back; never read back by the core
    async fn put_route_status(&self, status: RouteStatusWriteback) -> Result<()>;
}

/// In-memory datastore backend
#[derive(Default)]
pub struct MemoryDatastore {
    cameras: RwLock<HashMap<String, CameraEndpoint>>,
    routers: RwLock<HashMap<String, EdgeRouterRecord>>,
    route_status: RwLock<HashMap<String, RouteStatusWriteback>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last written status for a camera (test/ops introspection)
    pub async fn route_status(&self, camera_id: &str) -> Option<RouteStatusWriteback> {
        self.route_status.read().await.get(camera_id).cloned()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get_camera(&self, id: &str) -> Result<Option<CameraEndpoint>> {
        Ok(self.cameras.read().await.get(id).cloned())
    }

    async fn put_camera(&self, endpoint: CameraEndpoint) -> Result<()> {
        self.cameras
            .write()
            .await
            .insert(endpoint.id.clone(), endpoint);
        Ok(())
    }

    async fn delete_camera(&self, id: &str) -> Result<()> {
        self.cameras.write().await.remove(id);
        self.route_status.write().await.remove(id);
        Ok(())
    }

    async fn list_cameras(&self) -> Result<Vec<CameraEndpoint>> {
        Ok(self.cameras.read().await.values().cloned().collect())
    }

    async fn get_edge_router(&self, id: &str) -> Result<Option<EdgeRouterRecord>> {
        Ok(self.routers.read().await.get(id).cloned())
    }

    async fn put_edge_router(&self, router: EdgeRouterRecord) -> Result<()> {
        self.routers.write().await.insert(router.id.clone(), router);
        Ok(())
    }

    async fn put_route_status(&self, status: RouteStatusWriteback) -> Result<()> {
        tracing::debug!(
            camera_id = %status.camera_id,
            state = %status.state,
            route_key = ?status.route_key,
            "Route status written back"
        );
        self.route_status
            .write()
            .await
            .insert(status.camera_id.clone(), status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str) -> CameraEndpoint {
        CameraEndpoint {
            id: id.to_string(),
            direct_address: Some("192.168.1.50".parse().unwrap()),
            overlay_address: None,
            overlay_network_id: None,
            edge_router_id: None,
            local_address: None,
            port: 554,
            username: None,
            password: None,
            stream_path: "stream1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_camera_roundtrip() {
        let store = MemoryDatastore::new();
        store.put_camera(endpoint("cam-1")).await.unwrap();

        let got = store.get_camera("cam-1").await.unwrap().unwrap();
        assert_eq!(got.id, "cam-1");
        assert_eq!(store.list_cameras().await.unwrap().len(), 1);

        store.delete_camera("cam-1").await.unwrap();
        assert!(store.get_camera("cam-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_route_status_writeback() {
        let store = MemoryDatastore::new();
        store
            .put_route_status(RouteStatusWriteback {
                camera_id: "cam-1".to_string(),
                state: "active".to_string(),
                route_key: Some("direct:192.168.1.50:554".to_string()),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let status = store.route_status("cam-1").await.unwrap();
        assert_eq!(status.state, "active");
    }
}
