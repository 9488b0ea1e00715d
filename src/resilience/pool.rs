//! Per-host HTTP clients with bounded concurrency.
//!
//! Each host gets its own `reqwest::Client` (and therefore its own keep-alive
//! connection pool) plus a semaphore that caps concurrent requests to that
//! host. Clients are pinned to the addresses the DNS cache returned; when a
//! later resolution differs, the host's client is rebuilt on the new
//! addresses. Clients unused for longer than the staleness window are dropped
//! by the maintenance task.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{FetchError, NetworkErrorKind};

/// Configuration for per-host clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Concurrent requests per host (default: 6).
    pub max_connections_per_host: usize,
    /// Idle connections kept per host (default: 3).
    pub max_idle_per_host: usize,
    /// TCP keep-alive and idle connection lifetime (default: 30s).
    pub keep_alive: Duration,
    /// Whole-request timeout (default: 30s).
    pub request_timeout: Duration,
    /// Drop a host's client after this long unused (default: 10 min).
    pub stale_after: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections_per_host: 6,
            max_idle_per_host: 3,
            keep_alive: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(10 * 60),
        }
    }
}

/// Per-host request statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub host: String,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub average_response_ms: f64,
    pub active: usize,
    #[serde(skip)]
    pub last_used: Instant,
}

struct PoolEntry {
    client: reqwest::Client,
    /// Addresses the client resolves the host to; empty when unpinned
    pinned: Vec<SocketAddr>,
    permits: Arc<Semaphore>,
    total_requests: u64,
    failed_requests: u64,
    average_response: Duration,
    last_used: Instant,
}

/// A client for one host plus a concurrency permit held for the request.
pub struct PooledConnection {
    client: reqwest::Client,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

/// Per-host client pool.
pub struct ConnectionPool {
    settings: PoolSettings,
    entries: Mutex<HashMap<String, PoolEntry>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.settings)
            .field("hosts", &self.len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn max_per_host(&self) -> usize {
        self.settings.max_connections_per_host.max(1)
    }

    fn build_client(
        &self,
        host: &str,
        pinned: &[SocketAddr],
    ) -> Result<reqwest::Client, FetchError> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(self.settings.max_idle_per_host)
            .pool_idle_timeout(self.settings.keep_alive)
            .tcp_keepalive(self.settings.keep_alive)
            .timeout(self.settings.request_timeout)
            .connect_timeout(self.settings.request_timeout);

        if !pinned.is_empty() {
            builder = builder.resolve_to_addrs(host, pinned);
        }

        builder.build().map_err(|e| FetchError::Network {
            kind: NetworkErrorKind::Other,
            url: host.to_string(),
            message: format!("failed to build HTTP client: {}", e),
        })
    }

    /// Client for `host`, waiting for a free per-host slot.
    ///
    /// `addresses` pins the client to already-resolved addresses. An existing
    /// client pinned elsewhere is replaced; `None` keeps whatever the client
    /// already uses.
    pub async fn acquire(
        &self,
        host: &str,
        port: u16,
        addresses: Option<&[IpAddr]>,
    ) -> Result<PooledConnection, FetchError> {
        let fresh = addresses.map(|ips| pin(ips, port));
        let (client, permits) = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = match entries.entry(host.to_string()) {
                Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    if let Some(fresh) = fresh.filter(|f| !f.is_empty() && *f != entry.pinned) {
                        entry.client = self.build_client(host, &fresh)?;
                        debug!(
                            host,
                            previous = ?entry.pinned,
                            current = ?fresh,
                            "Addresses changed, rebuilt HTTP client"
                        );
                        entry.pinned = fresh;
                    }
                    entry
                }
                Entry::Vacant(vacant) => {
                    let pinned = fresh.unwrap_or_default();
                    let client = self.build_client(host, &pinned)?;
                    debug!(host, "Created HTTP client");
                    vacant.insert(PoolEntry {
                        client,
                        pinned,
                        permits: Arc::new(Semaphore::new(self.max_per_host())),
                        total_requests: 0,
                        failed_requests: 0,
                        average_response: Duration::ZERO,
                        last_used: Instant::now(),
                    })
                }
            };
            entry.last_used = Instant::now();
            (entry.client.clone(), Arc::clone(&entry.permits))
        };

        let permit = permits
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Cancelled)?;

        Ok(PooledConnection {
            client,
            _permit: permit,
        })
    }

    /// Fold one request's outcome into the host's running statistics.
    pub fn record(&self, host: &str, elapsed: Duration, success: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(host) {
            entry.total_requests += 1;
            if !success {
                entry.failed_requests += 1;
            }
            let n = entry.total_requests as u32;
            entry.average_response = (entry.average_response * (n - 1) + elapsed) / n;
            entry.last_used = Instant::now();
        }
    }

    /// Drop clients idle longer than the staleness window.
    pub fn evict_stale(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        let stale_after = self.settings.stale_after;
        entries.retain(|host, entry| {
            let keep = entry.last_used.elapsed() < stale_after
                || entry.permits.available_permits() < self.max_per_host();
            if !keep {
                debug!(host = %host, "Evicting stale HTTP client");
            }
            keep
        });
        before - entries.len()
    }

    /// Socket addresses `host`'s client is pinned to.
    pub fn pinned(&self, host: &str) -> Option<Vec<SocketAddr>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(host).map(|e| e.pinned.clone())
    }

    pub fn stats(&self, host: &str) -> Option<ConnectionStats> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(host).map(|e| self.entry_stats(host, e))
    }

    pub fn all_stats(&self) -> Vec<ConnectionStats> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|(h, e)| self.entry_stats(h, e)).collect()
    }

    fn entry_stats(&self, host: &str, entry: &PoolEntry) -> ConnectionStats {
        ConnectionStats {
            host: host.to_string(),
            total_requests: entry.total_requests,
            failed_requests: entry.failed_requests,
            average_response_ms: entry.average_response.as_secs_f64() * 1000.0,
            active: self
                .max_per_host()
                .saturating_sub(entry.permits.available_permits()),
            last_used: entry.last_used,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Sorted, de-duplicated socket addresses so equal answers compare equal.
fn pin(addresses: &[IpAddr], port: u16) -> Vec<SocketAddr> {
    let mut sockets: Vec<SocketAddr> = addresses
        .iter()
        .map(|ip| SocketAddr::new(*ip, port))
        .collect();
    sockets.sort_unstable();
    sockets.dedup();
    sockets
}
