//! FailoverController - per-camera connectivity state machine
//!
//! States: `Registered -> Active <-> Failed -> FallbackActive ->
//! AllRoutesFailed -> (backoff) -> Active|FallbackActive`. Terminal only on
//! unregister.
//!
//! Each camera's transitions are serialized behind its own mutex; cameras
//! never block each other. Every route change is emitted on a channel so the
//! relay supervisor can restart sessions against the new route's URI - the
//! routing table is never swapped silently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::datastore::{Datastore, RouteStatusWriteback};
use crate::error::{Error, Result};
use crate::health_monitor::{HealthFailure, HealthMonitor};
use crate::models::CameraEndpoint;
use crate::route_catalog::{order_routes, Route, RouteCatalog};
use crate::route_prober::RouteProbe;
use crate::route_selector::RouteSelector;
use crate::routing_table::RoutingTable;

/// Failover tuning knobs
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Base delay for exponential backoff while AllRoutesFailed
    pub base_delay: Duration,
    /// Backoff attempts before requiring manual intervention
    pub max_retries: u32,
    /// Interval between primary-route recovery checks while on a fallback
    pub recovery_interval: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_retries: 3,
            recovery_interval: Duration::from_secs(300),
        }
    }
}

/// Per-camera connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    Registered,
    Active,
    Failed,
    FallbackActive,
    AllRoutesFailed,
}

impl CameraState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraState::Registered => "registered",
            CameraState::Active => "active",
            CameraState::Failed => "failed",
            CameraState::FallbackActive => "fallback_active",
            CameraState::AllRoutesFailed => "all_routes_failed",
        }
    }
}

/// Notification that a camera's active route changed. `route: None` means
/// the camera went away (unregistered or all routes failed) and any live
/// relay session for it must stop.
#[derive(Debug, Clone)]
pub struct RouteChange {
    pub camera_id: String,
    pub route: Option<Route>,
}

/// Queryable snapshot of a camera's connectivity
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatusView {
    pub camera_id: String,
    pub state: CameraState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_route: Option<Route>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_connection: Option<DateTime<Utc>>,
}

struct CameraRuntime {
    endpoint: CameraEndpoint,
    state: CameraState,
    /// Route chosen as primary at registration (or after full recovery)
    primary_route: Option<Route>,
    /// Consecutive backoff attempts while AllRoutesFailed
    retry_count: u32,
    pending_retry: Option<JoinHandle<()>>,
    pending_recovery: Option<JoinHandle<()>>,
}

impl CameraRuntime {
    fn cancel_timers(&mut self) {
        if let Some(handle) = self.pending_retry.take() {
            handle.abort();
        }
        if let Some(handle) = self.pending_recovery.take() {
            handle.abort();
        }
    }
}

pub struct FailoverController {
    datastore: Arc<dyn Datastore>,
    catalog: Arc<RouteCatalog>,
    selector: Arc<RouteSelector>,
    prober: Arc<dyn RouteProbe>,
    routing_table: Arc<RoutingTable>,
    health: Arc<HealthMonitor>,
    cameras: RwLock<HashMap<String, Arc<Mutex<CameraRuntime>>>>,
    route_events: mpsc::UnboundedSender<RouteChange>,
    config: FailoverConfig,
}

impl FailoverController {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        catalog: Arc<RouteCatalog>,
        selector: Arc<RouteSelector>,
        prober: Arc<dyn RouteProbe>,
        routing_table: Arc<RoutingTable>,
        health: Arc<HealthMonitor>,
        config: FailoverConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RouteChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Arc::new(Self {
            datastore,
            catalog,
            selector,
            prober,
            routing_table,
            health,
            cameras: RwLock::new(HashMap::new()),
            route_events: tx,
            config,
        });
        (controller, rx)
    }

    /// Register a camera: persist the endpoint, run the initial route
    /// selection and start health monitoring.
    ///
    /// A camera with no viable route registers successfully but lands in
    /// AllRoutesFailed with backoff retries scheduled; `NoViableRoute` is
    /// recorded, never returned from here.
    pub async fn register_camera(
        self: &Arc<Self>,
        endpoint: CameraEndpoint,
    ) -> Result<CameraStatusView> {
        endpoint.validate()?;

        let camera_id = endpoint.id.clone();
        {
            let cameras = self.cameras.read().await;
            if cameras.contains_key(&camera_id) {
                return Err(Error::Validation(format!(
                    "camera {} is already registered",
                    camera_id
                )));
            }
        }

        self.datastore.put_camera(endpoint.clone()).await?;

        let runtime = Arc::new(Mutex::new(CameraRuntime {
            endpoint,
            state: CameraState::Registered,
            primary_route: None,
            retry_count: 0,
            pending_retry: None,
            pending_recovery: None,
        }));
        self.cameras
            .write()
            .await
            .insert(camera_id.clone(), runtime.clone());

        let view;
        {
            let mut rt = runtime.lock().await;
            let candidates = self.candidates(&rt.endpoint).await;
            match self.first_viable(&candidates, None).await {
                Some(route) => {
                    tracing::info!(
                        camera_id = %camera_id,
                        route_key = %route.route_key(),
                        "Camera registered with primary route"
                    );
                    rt.primary_route = Some(route.clone());
                    self.activate(&camera_id, &mut rt, route, CameraState::Active)
                        .await;
                }
                None => {
                    tracing::warn!(
                        camera_id = %camera_id,
                        candidates = candidates.len(),
                        error = %Error::NoViableRoute(camera_id.clone()),
                        "Camera registered but no route is viable"
                    );
                    rt.primary_route = candidates.first().cloned();
                    self.enter_all_routes_failed(&camera_id, &mut rt).await;
                }
            }

            // snapshot built under the runtime lock; a racing unregister
            // cannot leave this call without a status to return
            view = CameraStatusView {
                camera_id: camera_id.clone(),
                state: rt.state,
                active_route: self.routing_table.active_route(&camera_id).await,
                retry_count: rt.retry_count,
                last_successful_connection: self
                    .routing_table
                    .get(&camera_id)
                    .await
                    .map(|r| r.last_used_at),
            };
        }

        self.health.start(&camera_id).await;
        Ok(view)
    }

    /// Unregister: cancel every pending timer, stop health monitoring and
    /// drop all route state
    pub async fn unregister_camera(&self, camera_id: &str) -> Result<()> {
        let runtime = self
            .cameras
            .write()
            .await
            .remove(camera_id)
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;

        runtime.lock().await.cancel_timers();
        self.health.stop(camera_id).await;
        self.routing_table.remove(camera_id).await;
        self.datastore.delete_camera(camera_id).await?;

        let _ = self.route_events.send(RouteChange {
            camera_id: camera_id.to_string(),
            route: None,
        });

        tracing::info!(camera_id = %camera_id, "Camera unregistered");
        Ok(())
    }

    /// Health-failure entry point: walk fallback routes, or start backoff
    /// when everything is down.
    ///
    /// `failed_key` names the route the failure was observed on; an event
    /// raised against a route that has since been replaced is dropped so it
    /// cannot fail the new route. `None` skips the check (forced failover).
    pub async fn handle_failure(self: &Arc<Self>, camera_id: &str, failed_key: Option<&str>) {
        let Some(runtime) = self.runtime(camera_id).await else {
            return;
        };
        let mut rt = runtime.lock().await;

        if !matches!(rt.state, CameraState::Active | CameraState::FallbackActive) {
            tracing::debug!(
                camera_id = %camera_id,
                state = rt.state.as_str(),
                "Ignoring stale failure event"
            );
            return;
        }

        let failed_route = self.routing_table.get(camera_id).await.map(|r| r.route);

        if let (Some(expected), Some(current)) = (failed_key, failed_route.as_ref()) {
            if current.route_key() != expected {
                tracing::debug!(
                    camera_id = %camera_id,
                    failed_key = %expected,
                    active_key = %current.route_key(),
                    "Failure event names a replaced route - ignoring"
                );
                return;
            }
        }

        self.routing_table.mark_failed(camera_id).await;
        rt.state = CameraState::Failed;
        self.write_back(camera_id, &rt, failed_route.as_ref()).await;

        tracing::warn!(
            camera_id = %camera_id,
            route_key = ?failed_route.as_ref().map(Route::route_key),
            "Route failed - searching fallbacks"
        );

        self.fallback_search(camera_id, &mut rt, failed_route.as_ref())
            .await;
    }

    /// Ops/test hook: treat the active route as failed right now, or kick a
    /// manual retry when the camera is already out of routes
    pub async fn force_failover(self: &Arc<Self>, camera_id: &str) -> Result<CameraStatusView> {
        let runtime = self
            .runtime(camera_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;

        let state = runtime.lock().await.state;
        match state {
            CameraState::AllRoutesFailed => {
                {
                    let mut rt = runtime.lock().await;
                    rt.retry_count = 0;
                    rt.cancel_timers();
                }
                self.run_retry(camera_id).await;
            }
            _ => self.handle_failure(camera_id, None).await,
        }

        self.status(camera_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))
    }

    /// Snapshot for `getCameraStatus`; degraded states are values, not errors
    pub async fn status(&self, camera_id: &str) -> Option<CameraStatusView> {
        let runtime = self.runtime(camera_id).await?;
        let rt = runtime.lock().await;
        let record = self.routing_table.get(camera_id).await;

        Some(CameraStatusView {
            camera_id: camera_id.to_string(),
            state: rt.state,
            active_route: self.routing_table.active_route(camera_id).await,
            retry_count: rt.retry_count,
            last_successful_connection: record.map(|r| r.last_used_at),
        })
    }

    pub async fn list_status(&self) -> Vec<CameraStatusView> {
        let ids: Vec<String> = self.cameras.read().await.keys().cloned().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(status) = self.status(&id).await {
                out.push(status);
            }
        }
        out
    }

    pub async fn registered_count(&self) -> usize {
        self.cameras.read().await.len()
    }

    // ---- internals -------------------------------------------------------

    async fn runtime(&self, camera_id: &str) -> Option<Arc<Mutex<CameraRuntime>>> {
        self.cameras.read().await.get(camera_id).cloned()
    }

    async fn candidates(&self, endpoint: &CameraEndpoint) -> Vec<Route> {
        let mut routes = self.catalog.enumerate(endpoint).await;
        order_routes(&mut routes);
        routes
    }

    /// Selection over the ordered candidates, skipping the route that just
    /// failed. The first-viable walk itself belongs to the selector.
    async fn first_viable(&self, candidates: &[Route], exclude: Option<&Route>) -> Option<Route> {
        let eligible: Vec<Route> = candidates
            .iter()
            .filter(|route| {
                exclude.map_or(true, |skip| route.route_key() != skip.route_key())
            })
            .cloned()
            .collect();
        self.selector.select_from(&eligible).await
    }

    /// Install a route as active and notify the relay layer. Caller holds the
    /// camera's runtime lock.
    async fn activate(
        &self,
        camera_id: &str,
        rt: &mut CameraRuntime,
        route: Route,
        state: CameraState,
    ) {
        self.routing_table.set_active(camera_id, route.clone()).await;
        rt.state = state;
        rt.retry_count = 0;
        self.write_back(camera_id, rt, Some(&route)).await;

        let _ = self.route_events.send(RouteChange {
            camera_id: camera_id.to_string(),
            route: Some(route),
        });
    }

    async fn fallback_search(
        self: &Arc<Self>,
        camera_id: &str,
        rt: &mut CameraRuntime,
        failed: Option<&Route>,
    ) {
        let candidates = self.candidates(&rt.endpoint).await;
        match self.first_viable(&candidates, failed).await {
            Some(route) => {
                tracing::info!(
                    camera_id = %camera_id,
                    route_key = %route.route_key(),
                    "Fallback route activated"
                );
                self.activate(camera_id, rt, route, CameraState::FallbackActive)
                    .await;
                self.schedule_recovery(camera_id, rt);
            }
            None => {
                self.enter_all_routes_failed(camera_id, rt).await;
            }
        }
    }

    async fn enter_all_routes_failed(self: &Arc<Self>, camera_id: &str, rt: &mut CameraRuntime) {
        rt.state = CameraState::AllRoutesFailed;
        rt.retry_count += 1;
        self.write_back(camera_id, rt, None).await;

        if rt.retry_count <= self.config.max_retries {
            // delay(n) = base * 2^(n-1)
            let delay = self.config.base_delay * 2u32.pow(rt.retry_count - 1);
            tracing::warn!(
                camera_id = %camera_id,
                attempt = rt.retry_count,
                delay = ?delay,
                "All routes failed - backoff retry scheduled"
            );
            self.schedule_retry(camera_id, rt, delay);
        } else {
            tracing::error!(
                camera_id = %camera_id,
                attempts = rt.retry_count - 1,
                "All routes failed and retries exhausted - manual intervention required"
            );
        }
    }

    fn schedule_retry(self: &Arc<Self>, camera_id: &str, rt: &mut CameraRuntime, delay: Duration) {
        let controller = self.clone();
        let id = camera_id.to_string();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            controller.run_retry(&id).await;
        });
        if let Some(previous) = rt.pending_retry.replace(handle) {
            previous.abort();
        }
    }

    fn schedule_recovery(self: &Arc<Self>, camera_id: &str, rt: &mut CameraRuntime) {
        let controller = self.clone();
        let id = camera_id.to_string();
        let delay = self.config.recovery_interval;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            controller.run_recovery(&id).await;
        });
        if let Some(previous) = rt.pending_recovery.replace(handle) {
            previous.abort();
        }
    }

    /// Backoff retry while AllRoutesFailed: primary first, then the full
    /// fallback walk
    async fn run_retry(self: &Arc<Self>, camera_id: &str) {
        let Some(runtime) = self.runtime(camera_id).await else {
            return;
        };
        let mut rt = runtime.lock().await;
        if rt.state != CameraState::AllRoutesFailed {
            return;
        }

        tracing::info!(camera_id = %camera_id, attempt = rt.retry_count, "Retrying routes");

        if let Some(primary) = rt.primary_route.clone() {
            if self.prober.test_fresh(&primary).await {
                tracing::info!(
                    camera_id = %camera_id,
                    route_key = %primary.route_key(),
                    "Primary route recovered"
                );
                self.activate(camera_id, &mut rt, primary, CameraState::Active)
                    .await;
                return;
            }
        }

        self.fallback_search(camera_id, &mut rt, None).await;
    }

    /// Periodic primary-route check while running on a fallback
    async fn run_recovery(self: &Arc<Self>, camera_id: &str) {
        let Some(runtime) = self.runtime(camera_id).await else {
            return;
        };
        let mut rt = runtime.lock().await;
        if rt.state != CameraState::FallbackActive {
            return;
        }

        let Some(primary) = rt.primary_route.clone() else {
            return;
        };

        if self.prober.test_fresh(&primary).await {
            tracing::info!(
                camera_id = %camera_id,
                route_key = %primary.route_key(),
                "Primary route recovered - swapping back"
            );
            self.activate(camera_id, &mut rt, primary, CameraState::Active)
                .await;
        } else {
            tracing::debug!(camera_id = %camera_id, "Primary still down - recovery check rescheduled");
            self.schedule_recovery(camera_id, &mut rt);
        }
    }

    async fn write_back(&self, camera_id: &str, rt: &CameraRuntime, route: Option<&Route>) {
        let status = RouteStatusWriteback {
            camera_id: camera_id.to_string(),
            state: rt.state.as_str().to_string(),
            route_key: route.map(Route::route_key),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.datastore.put_route_status(status).await {
            tracing::error!(camera_id = %camera_id, error = %e, "Route status write-back failed");
        }
    }
}

/// Consume health-failure events and drive the state machine. One listener
/// per controller, spawned at startup.
pub fn spawn_failure_listener(
    controller: Arc<FailoverController>,
    mut failures: mpsc::UnboundedReceiver<HealthFailure>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            controller
                .handle_failure(&failure.camera_id, Some(&failure.route_key))
                .await;
        }
        tracing::debug!("Health failure listener stopped");
    })
}
