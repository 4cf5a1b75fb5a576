//! Application configuration and shared state

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::capture_gateway::CaptureGateway;
use crate::datastore::{Datastore, MemoryDatastore};
use crate::edge_router_client::EdgeRouterClient;
use crate::failover::{spawn_failure_listener, FailoverConfig, FailoverController, RouteChange};
use crate::health_monitor::HealthMonitor;
use crate::overlay_client::OverlayClient;
use crate::relay_supervisor::{RelayConfig, RelaySupervisor};
use crate::route_catalog::RouteCatalog;
use crate::route_prober::RouteProber;
use crate::route_selector::RouteSelector;
use crate::routing_table::RoutingTable;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Application configuration, sourced from the environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP API bind address
    pub host: String,
    pub port: u16,
    /// Capture-side TCP bind address
    pub capture_host: String,
    pub capture_port: u16,
    /// Overlay control-plane base URL
    pub overlay_base_url: String,
    /// TTL for cached probe results
    pub probe_cache_ttl: Duration,
    /// TCP connect timeout for route probes
    pub probe_timeout: Duration,
    /// Active-route health check interval
    pub health_interval: Duration,
    pub failover: FailoverConfig,
    pub relay: RelayConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: env_or("CAMRELAY_HOST", "0.0.0.0"),
            port: env_parse("CAMRELAY_PORT", 8600),
            capture_host: env_or("CAMRELAY_CAPTURE_HOST", "0.0.0.0"),
            capture_port: env_parse("CAMRELAY_CAPTURE_PORT", 8601),
            overlay_base_url: env_or("CAMRELAY_OVERLAY_URL", "http://127.0.0.1:9993"),
            probe_cache_ttl: Duration::from_secs(env_parse("CAMRELAY_PROBE_CACHE_TTL_SECS", 60)),
            probe_timeout: Duration::from_secs(env_parse("CAMRELAY_PROBE_TIMEOUT_SECS", 4)),
            health_interval: Duration::from_secs(env_parse("CAMRELAY_HEALTH_INTERVAL_SECS", 30)),
            failover: FailoverConfig {
                base_delay: Duration::from_secs(env_parse("CAMRELAY_FAILOVER_BASE_DELAY_SECS", 5)),
                max_retries: env_parse("CAMRELAY_FAILOVER_MAX_RETRIES", 3),
                recovery_interval: Duration::from_secs(env_parse(
                    "CAMRELAY_RECOVERY_INTERVAL_SECS",
                    300,
                )),
            },
            relay: RelayConfig {
                transcoder_bin: env_or("CAMRELAY_TRANSCODER_BIN", "ffmpeg"),
                output_dir: env_or("CAMRELAY_OUTPUT_DIR", "/var/lib/camrelay/streams").into(),
                push_target_base: env_or(
                    "CAMRELAY_PUSH_TARGET_BASE",
                    "rtmp://127.0.0.1:1935/live",
                ),
                webrtc_target_base: env_or("CAMRELAY_WEBRTC_TARGET_BASE", "rtp://127.0.0.1:5004"),
                max_retries: env_parse("CAMRELAY_RELAY_MAX_RETRIES", 3),
                retry_delay: Duration::from_secs(env_parse("CAMRELAY_RELAY_RETRY_DELAY_SECS", 5)),
                startup_timeout: Duration::from_secs(env_parse(
                    "CAMRELAY_RELAY_STARTUP_TIMEOUT_SECS",
                    30,
                )),
            },
        }
    }
}

/// Shared handles for the HTTP layer and the wiring tasks
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub datastore: Arc<dyn Datastore>,
    pub overlay: Arc<OverlayClient>,
    pub routing_table: Arc<RoutingTable>,
    pub selector: Arc<RouteSelector>,
    pub failover: Arc<FailoverController>,
    pub relay: Arc<RelaySupervisor>,
    pub gateway: Arc<CaptureGateway>,
    pub health: Arc<HealthMonitor>,
}

impl AppState {
    /// Wire up the component graph. Health failures are consumed internally;
    /// the returned receiver carries route changes for the relay-restart task.
    pub fn build(config: AppConfig) -> (Self, mpsc::UnboundedReceiver<RouteChange>) {
        let datastore: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let overlay = Arc::new(OverlayClient::new(config.overlay_base_url.clone()));
        let edge_router = Arc::new(EdgeRouterClient::new());

        let catalog = Arc::new(RouteCatalog::new(
            datastore.clone(),
            overlay.clone(),
            edge_router.clone(),
        ));
        let prober = Arc::new(RouteProber::new(
            datastore.clone(),
            edge_router,
            config.probe_cache_ttl,
            config.probe_timeout,
        ));
        let selector = Arc::new(RouteSelector::new(
            catalog.clone(),
            prober.clone(),
        ));
        let routing_table = Arc::new(RoutingTable::new());
        let (health, health_failures) = HealthMonitor::new(
            routing_table.clone(),
            prober.clone(),
            config.health_interval,
        );

        let (failover, route_changes) = FailoverController::new(
            datastore.clone(),
            catalog,
            selector.clone(),
            prober,
            routing_table.clone(),
            health.clone(),
            config.failover.clone(),
        );
        spawn_failure_listener(failover.clone(), health_failures);

        let relay = RelaySupervisor::new(config.relay.clone());
        let gateway = CaptureGateway::new();

        let state = Self {
            config,
            datastore,
            overlay,
            routing_table,
            selector,
            failover,
            relay,
            gateway,
            health,
        };
        (state, route_changes)
    }
}
