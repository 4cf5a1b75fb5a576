//! RouteProber - per-route reachability testing
//!
//! A probe answers one question: is this route currently connectable. It
//! never exchanges payload. Results are cached per canonical route identity
//! with a short TTL so bursty health checks do not hammer cameras or router
//! APIs. Any timeout, transport error or malformed router response is
//! probe-negative (fail closed).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::datastore::Datastore;
use crate::edge_router_client::EdgeRouterClient;
use crate::route_catalog::Route;

/// Default probe-result TTL
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default TCP connect deadline
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// Cached outcome of one probe
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub route_key: String,
    pub viable: bool,
    pub tested_at: Instant,
}

/// TTL map of probe outcomes keyed by canonical route identity.
/// Entries expire on read; no eager eviction.
pub struct ProbeCache {
    entries: RwLock<HashMap<String, ProbeResult>>,
    ttl: Duration,
}

impl ProbeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, route_key: &str) -> Option<ProbeResult> {
        let entries = self.entries.read().await;
        let entry = entries.get(route_key)?;
        if entry.tested_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.clone())
    }

    pub async fn insert(&self, route_key: String, viable: bool) {
        let mut entries = self.entries.write().await;
        entries.insert(
            route_key.clone(),
            ProbeResult {
                route_key,
                viable,
                tested_at: Instant::now(),
            },
        );
    }

    /// Drop a cached outcome so the next probe hits the network
    pub async fn invalidate(&self, route_key: &str) {
        self.entries.write().await.remove(route_key);
    }
}

/// Probe seam: the selector and failover state machine only see this trait,
/// which keeps their decision logic testable with stubbed outcomes
#[async_trait]
pub trait RouteProbe: Send + Sync {
    async fn test(&self, route: &Route) -> bool;

    /// Bypass the cache for recovery checks that must observe the present
    async fn test_fresh(&self, route: &Route) -> bool {
        self.test(route).await
    }
}

/// Production prober: TCP connect probes plus router-mediated checks
pub struct RouteProber {
    datastore: Arc<dyn Datastore>,
    edge_router: Arc<EdgeRouterClient>,
    cache: ProbeCache,
    connect_timeout: Duration,
}

impl RouteProber {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        edge_router: Arc<EdgeRouterClient>,
        cache_ttl: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            datastore,
            edge_router,
            cache: ProbeCache::new(cache_ttl),
            connect_timeout,
        }
    }

    /// Connect-then-close reachability check, no payload exchange
    async fn tcp_probe(&self, addr: SocketAddr) -> bool {
        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::debug!(addr = %addr, error = %e, "TCP probe refused");
                false
            }
            Err(_) => {
                tracing::debug!(addr = %addr, timeout = ?self.connect_timeout, "TCP probe timeout");
                false
            }
        }
    }

    async fn probe_uncached(&self, route: &Route) -> bool {
        match route {
            Route::Direct { ip, port } | Route::Overlay { ip, port, .. } => {
                self.tcp_probe(SocketAddr::new(*ip, *port)).await
            }
            Route::RouterForward {
                gateway_ip,
                target_ip,
                port,
                router_id,
            } => {
                // Gateway first; a dead gateway means the forwarded path
                // cannot work regardless of what the camera is doing
                if !self.tcp_probe(SocketAddr::new(*gateway_ip, *port)).await {
                    return false;
                }

                let router = match self.datastore.get_edge_router(router_id).await {
                    Ok(Some(r)) => r,
                    Ok(None) => {
                        tracing::warn!(router_id = %router_id, "Edge router record missing during probe");
                        return false;
                    }
                    Err(e) => {
                        tracing::error!(router_id = %router_id, error = %e, "Edge router lookup failed during probe");
                        return false;
                    }
                };

                match self
                    .edge_router
                    .connectivity_test(&router, *target_ip, *port)
                    .await
                {
                    Ok(reachable) => reachable,
                    Err(e) => {
                        tracing::debug!(
                            router_id = %router_id,
                            error = %e,
                            "Router connectivity check failed - treating as not viable"
                        );
                        false
                    }
                }
            }
            Route::PortForward {
                gateway_ip,
                external_port,
                ..
            } => {
                self.tcp_probe(SocketAddr::new(*gateway_ip, *external_port))
                    .await
            }
        }
    }
}

#[async_trait]
impl RouteProbe for RouteProber {
    async fn test(&self, route: &Route) -> bool {
        let key = route.route_key();

        if let Some(cached) = self.cache.get(&key).await {
            tracing::trace!(route_key = %key, viable = cached.viable, "Probe cache hit");
            return cached.viable;
        }

        let viable = self.probe_uncached(route).await;
        self.cache.insert(key.clone(), viable).await;

        tracing::debug!(route_key = %key, viable = viable, "Route probed");
        viable
    }

    async fn test_fresh(&self, route: &Route) -> bool {
        self.cache.invalidate(&route.route_key()).await;
        self.test(route).await
    }
}

/// Fixed-outcome prober for scenario tests: route keys listed as viable probe
/// positive, everything else probes negative
#[cfg(test)]
pub struct StubProber {
    viable: RwLock<std::collections::HashSet<String>>,
}

#[cfg(test)]
impl StubProber {
    pub fn new<I: IntoIterator<Item = String>>(viable: I) -> Self {
        Self {
            viable: RwLock::new(viable.into_iter().collect()),
        }
    }

    pub async fn set_viable(&self, route_key: &str, viable: bool) {
        let mut set = self.viable.write().await;
        if viable {
            set.insert(route_key.to_string());
        } else {
            set.remove(route_key);
        }
    }
}

#[cfg(test)]
#[async_trait]
impl RouteProbe for StubProber {
    async fn test(&self, route: &Route) -> bool {
        self.viable.read().await.contains(&route.route_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use tokio::net::TcpListener;

    fn prober(connect_timeout: Duration) -> RouteProber {
        RouteProber::new(
            Arc::new(MemoryDatastore::new()),
            Arc::new(EdgeRouterClient::new()),
            DEFAULT_CACHE_TTL,
            connect_timeout,
        )
    }

    #[tokio::test]
    async fn test_cache_ttl_expiry() {
        let cache = ProbeCache::new(Duration::from_millis(30));
        cache.insert("direct:1.2.3.4:554".to_string(), true).await;

        assert!(cache.get("direct:1.2.3.4:554").await.unwrap().viable);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get("direct:1.2.3.4:554").await.is_none());
    }

    #[tokio::test]
    async fn test_cache_invalidate() {
        let cache = ProbeCache::new(DEFAULT_CACHE_TTL);
        cache.insert("k".to_string(), false).await;
        cache.invalidate("k").await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_direct_probe_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let prober = prober(Duration::from_secs(2));
        let route = Route::Direct {
            ip: "127.0.0.1".parse().unwrap(),
            port,
        };
        assert!(prober.test(&route).await);
    }

    #[tokio::test]
    async fn test_refused_port_probes_negative() {
        let prober = prober(Duration::from_secs(2));
        // nothing listens on port 1 on loopback
        let route = Route::Direct {
            ip: "127.0.0.1".parse().unwrap(),
            port: 1,
        };
        assert!(!prober.test(&route).await);
    }

    #[tokio::test]
    async fn test_negative_result_is_cached() {
        let prober = prober(Duration::from_secs(2));
        let route = Route::Direct {
            ip: "127.0.0.1".parse().unwrap(),
            port: 1,
        };
        assert!(!prober.test(&route).await);

        let cached = prober.cache.get(&route.route_key()).await.unwrap();
        assert!(!cached.viable);
    }

    #[tokio::test]
    async fn test_router_forward_fails_without_router_record() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let prober = prober(Duration::from_secs(2));
        // gateway answers TCP but the router record is unknown
        let route = Route::RouterForward {
            gateway_ip: "127.0.0.1".parse().unwrap(),
            target_ip: "10.0.0.20".parse().unwrap(),
            port,
            router_id: "rt-missing".to_string(),
        };
        assert!(!prober.test(&route).await);
    }
}
