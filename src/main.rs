//! camrelay - camera relay control tower
//!
//! Main entry point.

use std::sync::Arc;

use camrelay::failover::RouteChange;
use camrelay::relay_supervisor::RelaySupervisor;
use camrelay::{datastore::Datastore, state::AppConfig, web_api, AppState};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camrelay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::default();
    tracing::info!(
        host = %config.host,
        port = config.port,
        capture_port = config.capture_port,
        "Starting camrelay"
    );

    let (state, route_changes) = AppState::build(config.clone());

    // capture-side TCP endpoint
    let capture_addr = format!("{}:{}", config.capture_host, config.capture_port);
    let capture_listener = tokio::net::TcpListener::bind(&capture_addr).await?;
    tokio::spawn(state.gateway.clone().run(capture_listener));

    // route changes drive relay session restarts
    spawn_route_change_listener(
        state.relay.clone(),
        state.datastore.clone(),
        route_changes,
    );

    let app = web_api::create_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "HTTP API listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Restart live relay sessions against the new route's URI when a camera's
/// route changes; stop them when the camera's routes are gone.
fn spawn_route_change_listener(
    relay: Arc<RelaySupervisor>,
    datastore: Arc<dyn Datastore>,
    mut route_changes: mpsc::UnboundedReceiver<RouteChange>,
) {
    tokio::spawn(async move {
        while let Some(change) = route_changes.recv().await {
            match change.route {
                Some(route) => {
                    let endpoint = match datastore.get_camera(&change.camera_id).await {
                        Ok(Some(endpoint)) => endpoint,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::error!(
                                camera_id = %change.camera_id,
                                error = %e,
                                "Endpoint lookup failed on route change"
                            );
                            continue;
                        }
                    };
                    let input_uri = route.connection_uri(&endpoint);
                    tracing::info!(
                        camera_id = %change.camera_id,
                        route_key = %route.route_key(),
                        "Route changed, restarting relay sessions"
                    );
                    relay.restart_for_camera(&change.camera_id, &input_uri).await;
                }
                None => {
                    tracing::info!(
                        camera_id = %change.camera_id,
                        "Routes gone, stopping relay sessions"
                    );
                    relay.stop_for_camera(&change.camera_id).await;
                }
            }
        }
    });
}
