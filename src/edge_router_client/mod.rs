//! Edge-router management API adapter
//!
//! Consumed read-only: connectivity tests toward site-local addresses and the
//! router's port-forward rule table. Any transport or decode failure is
//! surfaced as `EdgeRouterUnreachable` and treated as probe-negative upstream.

use std::net::IpAddr;
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::{EdgeRouterRecord, PortForwardRule};

/// Management API call deadline
const API_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
struct ConnectivityResponse {
    reachable: bool,
}

/// Edge-router management client
pub struct EdgeRouterClient {
    client: reqwest::Client,
}

impl EdgeRouterClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }

    fn base_url(router: &EdgeRouterRecord) -> String {
        format!("http://{}:{}", router.gateway_address, router.api_port)
    }

    fn auth_header(router: &EdgeRouterRecord) -> Option<String> {
        match (&router.username, &router.password) {
            (Some(user), Some(pass)) => {
                let token = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", user, pass));
                Some(format!("Basic {}", token))
            }
            _ => None,
        }
    }

    /// Ask the router to test reachability to an internal address
    pub async fn connectivity_test(
        &self,
        router: &EdgeRouterRecord,
        target: IpAddr,
        port: u16,
    ) -> Result<bool> {
        let url = format!(
            "{}/api/diagnostics/connectivity?target={}&port={}",
            Self::base_url(router),
            urlencoding::encode(&target.to_string()),
            port
        );

        let mut req = self.client.get(&url);
        if let Some(auth) = Self::auth_header(router) {
            req = req.header("Authorization", auth);
        }

        let resp = req.send().await.map_err(|e| {
            Error::EdgeRouterUnreachable(format!("router {}: {}", router.id, e))
        })?;

        if !resp.status().is_success() {
            return Err(Error::EdgeRouterUnreachable(format!(
                "router {} connectivity test returned {}",
                router.id,
                resp.status()
            )));
        }

        let body: ConnectivityResponse = resp.json().await.map_err(|e| {
            Error::EdgeRouterUnreachable(format!("router {} malformed response: {}", router.id, e))
        })?;

        Ok(body.reachable)
    }

    /// List the router's port-forward rules
    pub async fn list_port_forwards(
        &self,
        router: &EdgeRouterRecord,
    ) -> Result<Vec<PortForwardRule>> {
        let url = format!("{}/api/port-forwards", Self::base_url(router));

        let mut req = self.client.get(&url);
        if let Some(auth) = Self::auth_header(router) {
            req = req.header("Authorization", auth);
        }

        let resp = req.send().await.map_err(|e| {
            Error::EdgeRouterUnreachable(format!("router {}: {}", router.id, e))
        })?;

        if !resp.status().is_success() {
            return Err(Error::EdgeRouterUnreachable(format!(
                "router {} rule list returned {}",
                router.id,
                resp.status()
            )));
        }

        let rules: Vec<PortForwardRule> = resp.json().await.map_err(|e| {
            Error::EdgeRouterUnreachable(format!("router {} malformed rule list: {}", router.id, e))
        })?;

        Ok(rules)
    }
}

impl Default for EdgeRouterClient {
    fn default() -> Self {
        Self::new()
    }
}
