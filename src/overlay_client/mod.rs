//! Overlay-network control-plane adapter
//!
//! Queries network membership and per-member assigned addresses. Used only by
//! the route catalog to resolve overlay candidates; membership and
//! authorization stay owned by the control plane.

use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// One member of an overlay network
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayMember {
    pub device_id: String,
    pub address: IpAddr,
    #[serde(default)]
    pub online: bool,
}

/// Overlay control-plane client
pub struct OverlayClient {
    client: reqwest::Client,
    base_url: String,
}

impl OverlayClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }

    /// List members of a network with their assigned addresses
    pub async fn list_members(&self, network_id: &str) -> Result<Vec<OverlayMember>> {
        let url = format!(
            "{}/api/networks/{}/members",
            self.base_url,
            urlencoding::encode(network_id)
        );

        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Internal(format!(
                "Overlay member list failed for network {}: {}",
                network_id,
                resp.status()
            )));
        }

        let members: Vec<OverlayMember> = resp.json().await?;
        Ok(members)
    }

    /// Resolve the current overlay address assigned to a device, if the
    /// control plane knows it
    pub async fn resolve_member_address(
        &self,
        network_id: &str,
        device_id: &str,
    ) -> Result<Option<IpAddr>> {
        let members = self.list_members(network_id).await?;
        Ok(members
            .into_iter()
            .find(|m| m.device_id == device_id)
            .map(|m| m.address))
    }

    /// Check control-plane reachability
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/status", self.base_url);
        let resp = self.client.get(&url).send().await?;
        Ok(resp.status().is_success())
    }
}
