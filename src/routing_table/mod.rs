//! RoutingTable - per-camera active-route registry
//!
//! One record per registered camera, keyed by camera id, so a camera can
//! never hold two active routes. Mutated only by the failover controller;
//! read by the relay supervisor and the health monitor.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::route_catalog::Route;

/// Externally observable connectivity state of the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Active,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteRecord {
    pub camera_id: String,
    pub route: Route,
    pub status: RouteStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub failure_count: u32,
}

#[derive(Default)]
pub struct RoutingTable {
    records: RwLock<HashMap<String, RouteRecord>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a route as the camera's single active record. Replaces any
    /// previous record and clears its failure count.
    pub async fn set_active(&self, camera_id: &str, route: Route) {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let created_at = records
            .get(camera_id)
            .map(|r| r.created_at)
            .unwrap_or(now);

        records.insert(
            camera_id.to_string(),
            RouteRecord {
                camera_id: camera_id.to_string(),
                route,
                status: RouteStatus::Active,
                created_at,
                last_used_at: now,
                failure_count: 0,
            },
        );
    }

    /// Mark the camera's record failed and bump its failure count
    pub async fn mark_failed(&self, camera_id: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(camera_id) {
            record.status = RouteStatus::Failed;
            record.failure_count += 1;
        }
    }

    /// Refresh last_used_at after a healthy probe of the active route
    pub async fn touch(&self, camera_id: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(camera_id) {
            record.last_used_at = Utc::now();
        }
    }

    pub async fn get(&self, camera_id: &str) -> Option<RouteRecord> {
        self.records.read().await.get(camera_id).cloned()
    }

    /// The camera's route, only while the record is Active
    pub async fn active_route(&self, camera_id: &str) -> Option<Route> {
        self.records
            .read()
            .await
            .get(camera_id)
            .filter(|r| r.status == RouteStatus::Active)
            .map(|r| r.route.clone())
    }

    pub async fn remove(&self, camera_id: &str) {
        self.records.write().await.remove(camera_id);
    }

    pub async fn all(&self) -> Vec<RouteRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.status == RouteStatus::Active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(port: u16) -> Route {
        Route::Direct {
            ip: "192.168.1.50".parse().unwrap(),
            port,
        }
    }

    #[tokio::test]
    async fn test_single_record_per_camera() {
        let table = RoutingTable::new();
        table.set_active("cam-1", direct(554)).await;
        table.set_active("cam-1", direct(8554)).await;

        // replacing never leaves two records behind
        assert_eq!(table.all().await.len(), 1);
        assert_eq!(table.active_count().await, 1);
        let record = table.get("cam-1").await.unwrap();
        assert_eq!(record.route, direct(8554));
    }

    #[tokio::test]
    async fn test_mark_failed_clears_active_route() {
        let table = RoutingTable::new();
        table.set_active("cam-1", direct(554)).await;
        assert!(table.active_route("cam-1").await.is_some());

        table.mark_failed("cam-1").await;
        assert!(table.active_route("cam-1").await.is_none());
        assert_eq!(table.active_count().await, 0);

        let record = table.get("cam-1").await.unwrap();
        assert_eq!(record.status, RouteStatus::Failed);
        assert_eq!(record.failure_count, 1);
    }

    #[tokio::test]
    async fn test_set_active_resets_failure_count() {
        let table = RoutingTable::new();
        table.set_active("cam-1", direct(554)).await;
        table.mark_failed("cam-1").await;
        table.mark_failed("cam-1").await;
        assert_eq!(table.get("cam-1").await.unwrap().failure_count, 2);

        table.set_active("cam-1", direct(554)).await;
        let record = table.get("cam-1").await.unwrap();
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.status, RouteStatus::Active);
    }

    #[tokio::test]
    async fn test_created_at_survives_route_swap() {
        let table = RoutingTable::new();
        table.set_active("cam-1", direct(554)).await;
        let first = table.get("cam-1").await.unwrap().created_at;

        table.set_active("cam-1", direct(8554)).await;
        assert_eq!(table.get("cam-1").await.unwrap().created_at, first);
    }

    #[tokio::test]
    async fn test_remove() {
        let table = RoutingTable::new();
        table.set_active("cam-1", direct(554)).await;
        table.remove("cam-1").await;
        assert!(table.get("cam-1").await.is_none());
    }
}
