//! Hostname resolution cache.
//!
//! Resolved addresses are kept for a TTL (default: 5 minutes) so a page with
//! hundreds of tiles resolves each server once. When a refresh fails, a stale
//! entry is served rather than failing the request.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{FetchError, NetworkErrorKind};

pub const DEFAULT_DNS_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_DNS_CAPACITY: usize = 256;

/// Resolves hostnames to IP addresses.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, FetchError>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, FetchError> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| FetchError::Network {
                kind: NetworkErrorKind::Dns,
                url: host.to_string(),
                message: e.to_string(),
            })?;
        let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        if ips.is_empty() {
            return Err(FetchError::Network {
                kind: NetworkErrorKind::Dns,
                url: host.to_string(),
                message: "no addresses returned".to_string(),
            });
        }
        Ok(ips)
    }
}

#[derive(Debug, Clone)]
struct DnsEntry {
    addresses: Vec<IpAddr>,
    resolved_at: Instant,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct DnsStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// TTL cache in front of a [`Resolver`].
pub struct DnsCache {
    resolver: Arc<dyn Resolver>,
    ttl: Duration,
    entries: Mutex<LruCache<String, DnsEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for DnsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsCache")
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn Resolver>, ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            resolver,
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemResolver), DEFAULT_DNS_TTL, DEFAULT_DNS_CAPACITY)
    }

    /// Addresses for `host`, from cache when fresh.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, FetchError> {
        if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let cached = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.get(host).cloned()
        };

        if let Some(entry) = &cached {
            if entry.resolved_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.addresses.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match self.resolver.resolve(host).await {
            Ok(addresses) => {
                debug!(host, count = addresses.len(), "Resolved host");
                let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
                entries.put(
                    host.to_string(),
                    DnsEntry {
                        addresses: addresses.clone(),
                        resolved_at: Instant::now(),
                    },
                );
                Ok(addresses)
            }
            Err(e) => match cached {
                Some(stale) => {
                    warn!(host, error = %e, "DNS refresh failed, using stale addresses");
                    Ok(stale.addresses)
                }
                None => Err(e),
            },
        }
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.resolved_at.elapsed() >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for host in &expired {
            entries.pop(host);
        }
        expired.len()
    }

    /// Forget one host so the next lookup goes to the resolver.
    pub fn clear_host(&self, host: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(host);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn stats(&self) -> DnsStats {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner).len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        DnsStats {
            entries,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}
