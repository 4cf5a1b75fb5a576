//! camrelay - camera relay control tower
//!
//! Routes heterogeneous network paths to field cameras and supervises the
//! transcoder processes relaying their streams.
//!
//! ## Components
//!
//! 1. RouteCatalog - enumerates candidate routes from addressing facts
//! 2. RouteProber - TCP/router-API viability probes with a TTL cache
//! 3. RouteSelector - priority-ordered first-viable selection
//! 4. RoutingTable - one active-route record per camera
//! 5. HealthMonitor - continuous re-validation of active routes
//! 6. FailoverController - per-camera connectivity state machine
//! 7. RelaySupervisor - transcoder process lifecycle and retry policy
//! 8. PacketCodec - capture-side wire protocol
//! 9. CaptureGateway - inbound capture connections and media fan-out
//! 10. WebAPI - REST operation surface

pub mod capture_gateway;
pub mod datastore;
pub mod edge_router_client;
pub mod error;
pub mod failover;
pub mod health_monitor;
pub mod models;
pub mod overlay_client;
pub mod packet_codec;
pub mod relay_supervisor;
pub mod route_catalog;
pub mod route_prober;
pub mod route_selector;
pub mod routing_table;
pub mod state;
pub mod web_api;

pub use error::{Error, Result};
pub use state::{AppConfig, AppState};
