//! RouteSelector - pick the best currently viable route
//!
//! Candidates come pre-ordered from the catalog; selection probes them in
//! order and takes the first positive. Given identical candidates and probe
//! outcomes the choice is reproducible.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::CameraEndpoint;
use crate::route_catalog::{order_routes, Route, RouteCatalog};
use crate::route_prober::RouteProbe;

pub struct RouteSelector {
    catalog: Arc<RouteCatalog>,
    prober: Arc<dyn RouteProbe>,
}

impl RouteSelector {
    pub fn new(catalog: Arc<RouteCatalog>, prober: Arc<dyn RouteProbe>) -> Self {
        Self { catalog, prober }
    }

    /// Probe an ordered candidate list, returning the first viable route
    pub async fn select_from(&self, routes: &[Route]) -> Option<Route> {
        for route in routes {
            if self.prober.test(route).await {
                tracing::debug!(route_key = %route.route_key(), "Route selected");
                return Some(route.clone());
            }
            tracing::debug!(route_key = %route.route_key(), "Candidate not viable");
        }
        None
    }

    /// Enumerate, order and probe; fails with `NoViableRoute` when every
    /// candidate probes negative
    pub async fn select_optimal(&self, endpoint: &CameraEndpoint) -> Result<Route> {
        let mut routes = self.catalog.enumerate(endpoint).await;
        order_routes(&mut routes);

        self.select_from(&routes)
            .await
            .ok_or_else(|| Error::NoViableRoute(endpoint.id.clone()))
    }
}
