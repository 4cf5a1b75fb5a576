//! HealthMonitor - continuous re-validation of active routes
//!
//! One loop per camera with its own interval, so a stuck probe on one camera
//! never stalls another's health cycle. The loop only probes records that are
//! currently Active; after it raises a failure the controller marks the
//! record Failed, which silences the loop until a new route is installed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::route_prober::RouteProbe;
use crate::routing_table::RoutingTable;

/// Raised on the first negative probe of a camera's active route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthFailure {
    pub camera_id: String,
    pub route_key: String,
}

pub struct HealthMonitor {
    routing_table: Arc<RoutingTable>,
    prober: Arc<dyn RouteProbe>,
    check_interval: Duration,
    failures: mpsc::UnboundedSender<HealthFailure>,
    tasks: RwLock<HashMap<String, JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        routing_table: Arc<RoutingTable>,
        prober: Arc<dyn RouteProbe>,
        check_interval: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HealthFailure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(Self {
            routing_table,
            prober,
            check_interval,
            failures: tx,
            tasks: RwLock::new(HashMap::new()),
        });
        (monitor, rx)
    }

    /// Start the health loop for a camera. Restarting an already monitored
    /// camera replaces its loop.
    pub async fn start(self: &Arc<Self>, camera_id: &str) {
        let monitor = self.clone();
        let id = camera_id.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(monitor.check_interval);
            // the first tick fires immediately; skip it so a freshly selected
            // route is not instantly re-probed
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(route) = monitor.routing_table.active_route(&id).await else {
                    continue;
                };

                if monitor.prober.test_fresh(&route).await {
                    monitor.routing_table.touch(&id).await;
                    continue;
                }

                let failure = HealthFailure {
                    camera_id: id.clone(),
                    route_key: route.route_key(),
                };
                tracing::warn!(
                    camera_id = %id,
                    route_key = %failure.route_key,
                    "Active route failed health check"
                );
                if monitor.failures.send(failure).is_err() {
                    // controller gone, nothing left to notify
                    break;
                }
            }
        });

        let mut tasks = self.tasks.write().await;
        if let Some(previous) = tasks.insert(camera_id.to_string(), handle) {
            previous.abort();
        }

        tracing::debug!(camera_id = %camera_id, interval = ?self.check_interval, "Health monitoring started");
    }

    /// Stop and forget a camera's health loop
    pub async fn stop(&self, camera_id: &str) {
        if let Some(handle) = self.tasks.write().await.remove(camera_id) {
            handle.abort();
            tracing::debug!(camera_id = %camera_id, "Health monitoring stopped");
        }
    }

    pub async fn monitored_count(&self) -> usize {
        self.tasks.read().await.len()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        // tasks hold an Arc back to the monitor only via clone before spawn;
        // aborting here prevents orphaned loops on shutdown
        if let Ok(tasks) = self.tasks.try_read() {
            for handle in tasks.values() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route_catalog::Route;
    use crate::route_prober::StubProber;

    fn direct_route() -> Route {
        Route::Direct {
            ip: "192.168.1.50".parse().unwrap(),
            port: 554,
        }
    }

    #[tokio::test]
    async fn test_failure_event_on_negative_probe() {
        let table = Arc::new(RoutingTable::new());
        table.set_active("cam-1", direct_route()).await;

        let prober = Arc::new(StubProber::new(std::iter::empty()));
        let (monitor, mut rx) =
            HealthMonitor::new(table, prober, Duration::from_millis(20));

        monitor.start("cam-1").await;

        let failure = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("failure event within deadline")
            .unwrap();
        assert_eq!(failure.camera_id, "cam-1");
        assert_eq!(failure.route_key, direct_route().route_key());

        monitor.stop("cam-1").await;
    }

    #[tokio::test]
    async fn test_healthy_route_raises_nothing() {
        let table = Arc::new(RoutingTable::new());
        table.set_active("cam-1", direct_route()).await;

        let prober = Arc::new(StubProber::new([direct_route().route_key()]));
        let (monitor, mut rx) =
            HealthMonitor::new(table.clone(), prober, Duration::from_millis(20));

        monitor.start("cam-1").await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(rx.try_recv().is_err());
        // healthy probes refresh the record
        let record = table.get("cam-1").await.unwrap();
        assert!(record.last_used_at >= record.created_at);

        monitor.stop("cam-1").await;
    }

    #[tokio::test]
    async fn test_stop_removes_loop() {
        let table = Arc::new(RoutingTable::new());
        let prober = Arc::new(StubProber::new(std::iter::empty()));
        let (monitor, _rx) = HealthMonitor::new(table, prober, Duration::from_secs(30));

        monitor.start("cam-1").await;
        assert_eq!(monitor.monitored_count().await, 1);

        monitor.stop("cam-1").await;
        assert_eq!(monitor.monitored_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_record_is_skipped() {
        let table = Arc::new(RoutingTable::new());
        table.set_active("cam-1", direct_route()).await;
        table.mark_failed("cam-1").await;

        let prober = Arc::new(StubProber::new(std::iter::empty()));
        let (monitor, mut rx) =
            HealthMonitor::new(table, prober, Duration::from_millis(20));

        monitor.start("cam-1").await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        // no active route, so no failure events
        assert!(rx.try_recv().is_err());
        monitor.stop("cam-1").await;
    }
}
