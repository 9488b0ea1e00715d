//! Shared resilience context.
//!
//! One [`ResilienceContext`] is created per process and handed (as an `Arc`)
//! to every component that talks to the network. It owns the circuit
//! breakers, retry policy, client pool, DNS cache and rolling health
//! metrics, and runs their periodic maintenance on a background task.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FetchError;

use super::breaker::{Admission, BreakerConfig, BreakerSnapshot, CircuitBreakerRegistry};
use super::classify::{classify, Classification};
use super::dns::{DnsCache, DnsStats, Resolver, SystemResolver, DEFAULT_DNS_CAPACITY, DEFAULT_DNS_TTL};
use super::pool::{ConnectionPool, ConnectionStats, PoolSettings, PooledConnection};
use super::retry::RetryPolicy;

/// Request outcomes kept for the rolling health window.
const HEALTH_WINDOW: usize = 100;

/// Configuration for the resilience context.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub pool: PoolSettings,
    pub dns_ttl: Duration,
    pub dns_capacity: usize,
    /// Host resolved by the periodic health check; `None` derives health
    /// from recent request outcomes only
    pub health_check_host: Option<String>,
    pub health_interval: Duration,
    pub pool_sweep_interval: Duration,
    pub dns_sweep_interval: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            pool: PoolSettings::default(),
            dns_ttl: DEFAULT_DNS_TTL,
            dns_capacity: DEFAULT_DNS_CAPACITY,
            health_check_host: None,
            health_interval: Duration::from_secs(30),
            pool_sweep_interval: Duration::from_secs(5 * 60),
            dns_sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Whether a failed call should be attempted again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub reason: String,
}

impl RetryDecision {
    fn yes() -> Self {
        Self {
            retry: true,
            reason: "retryable failure".to_string(),
        }
    }

    fn no(reason: impl Into<String>) -> Self {
        Self {
            retry: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Default)]
struct HealthMetrics {
    online: bool,
    last_check: Option<Instant>,
    total_requests: u64,
    failed_requests: u64,
    window: VecDeque<(Duration, bool)>,
}

/// Point-in-time view of network health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub online: bool,
    pub total_requests: u64,
    pub failed_requests: u64,
    /// Success rate over the rolling window
    pub recent_success_rate: f64,
    /// Mean response time over the rolling window
    pub recent_average_ms: f64,
    pub circuits: Vec<BreakerSnapshot>,
    pub dns: DnsStats,
    pub connections: Vec<ConnectionStats>,
}

/// Breakers, retry policy, pool, DNS cache and health metrics.
#[derive(Debug)]
pub struct ResilienceContext {
    config: ResilienceConfig,
    breakers: CircuitBreakerRegistry,
    pool: ConnectionPool,
    dns: DnsCache,
    health: Mutex<HealthMetrics>,
}

impl ResilienceContext {
    pub fn new(config: ResilienceConfig) -> Self {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(config: ResilienceConfig, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(config.breaker.clone()),
            pool: ConnectionPool::new(config.pool.clone()),
            dns: DnsCache::new(resolver, config.dns_ttl, config.dns_capacity),
            health: Mutex::new(HealthMetrics {
                online: true,
                ..HealthMetrics::default()
            }),
            config,
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    // =========================================================================
    // Circuit breakers
    // =========================================================================

    pub fn can_execute(&self, destination: &str) -> Admission {
        self.breakers.can_execute(destination)
    }

    pub fn record_success(&self, destination: &str) {
        self.breakers.record_success(destination);
    }

    pub fn record_failure(&self, destination: &str, error: &FetchError) {
        self.breakers.record_failure(destination, error);
    }

    pub fn reset(&self, destination: Option<&str>) {
        self.breakers.reset(destination);
        info!(destination = destination.unwrap_or("*"), "Circuit breakers reset");
    }

    pub fn status(&self, destination: &str) -> Option<BreakerSnapshot> {
        self.breakers.snapshot(destination)
    }

    // =========================================================================
    // Retry
    // =========================================================================

    pub fn classify(&self, error: &FetchError) -> Classification {
        classify(error)
    }

    pub fn retry_delay(&self, attempt: u32, error: &FetchError) -> Duration {
        self.config.retry.delay_for(attempt, Some(error))
    }

    /// Decide on retry number `attempt` (0-based) using the default retry budget.
    pub fn should_retry(&self, attempt: u32, error: &FetchError, destination: &str) -> RetryDecision {
        self.decide(attempt, self.config.retry.max_retries, error, destination)
    }

    fn decide(&self, attempt: u32, max_retries: u32, error: &FetchError, destination: &str) -> RetryDecision {
        if attempt >= max_retries {
            return RetryDecision::no("maximum retries exceeded");
        }
        if matches!(error, FetchError::Cancelled | FetchError::InvalidUrl { .. }) {
            return RetryDecision::no("not retryable");
        }
        if !self.breakers.can_execute(destination).allowed {
            return RetryDecision::no("circuit breaker open");
        }
        if classify(error).is_permanent() {
            return RetryDecision::no("permanent failure");
        }
        RetryDecision::yes()
    }

    /// Run `op` under the destination's breaker, retrying with backoff.
    pub async fn call<T, F, Fut>(
        &self,
        destination: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.call_with_retries(destination, self.config.retry.max_retries, cancel, op)
            .await
    }

    /// [`call`](Self::call) with an explicit retry budget.
    pub async fn call_with_retries<T, F, Fut>(
        &self,
        destination: &str,
        max_retries: u32,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;
        loop {
            let error = match self.attempt(destination, cancel, &mut op).await {
                Ok(value) => return Ok(value),
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) => e,
            };

            let decision = self.decide(attempt, max_retries, &error, destination);
            if !decision.retry {
                debug!(destination, attempt, reason = %decision.reason, error = %error, "Giving up");
                return Err(error);
            }

            let delay = self.retry_delay(attempt, &error);
            warn!(
                destination,
                attempt = attempt + 1,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Request failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Run `op` once under the destination's breaker, without retrying.
    pub async fn call_once<T, F, Fut>(
        &self,
        destination: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.attempt(destination, cancel, &mut op).await
    }

    async fn attempt<T, F, Fut>(
        &self,
        destination: &str,
        cancel: &CancellationToken,
        op: &mut F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let admission = self.breakers.can_execute(destination);
        if !admission.allowed {
            return Err(FetchError::CircuitOpen {
                destination: destination.to_string(),
                retry_after: admission.retry_after.unwrap_or_default(),
            });
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = op() => result,
        };

        match &result {
            Ok(_) => self.breakers.record_success(destination),
            Err(FetchError::Cancelled) => {}
            Err(e) => self.breakers.record_failure(destination, e),
        }
        result
    }

    // =========================================================================
    // Connections and DNS
    // =========================================================================

    /// A pooled client for `host`, resolving through the DNS cache.
    ///
    /// Resolution failures are not fatal here: the client falls back to
    /// resolving on its own.
    pub async fn connection(&self, host: &str, port: u16) -> Result<PooledConnection, FetchError> {
        let addresses = match self.dns.resolve(host).await {
            Ok(addresses) => Some(addresses),
            Err(e) => {
                debug!(host, error = %e, "DNS cache miss failed, deferring to client resolver");
                None
            }
        };
        self.pool.acquire(host, port, addresses.as_deref()).await
    }

    pub fn record_request_metrics(&self, host: &str, elapsed: Duration, success: bool) {
        self.pool.record(host, elapsed, success);

        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        health.total_requests += 1;
        if !success {
            health.failed_requests += 1;
        }
        if health.window.len() == HEALTH_WINDOW {
            health.window.pop_front();
        }
        health.window.push_back((elapsed, success));
    }

    // =========================================================================
    // Health and maintenance
    // =========================================================================

    pub fn health(&self) -> HealthSnapshot {
        let (online, total, failed, rate, average) = {
            let health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
            let n = health.window.len();
            let successes = health.window.iter().filter(|(_, ok)| *ok).count();
            let total_time: Duration = health.window.iter().map(|(d, _)| *d).sum();
            let (rate, average) = if n == 0 {
                (1.0, 0.0)
            } else {
                (
                    successes as f64 / n as f64,
                    total_time.as_secs_f64() * 1000.0 / n as f64,
                )
            };
            (health.online, health.total_requests, health.failed_requests, rate, average)
        };

        HealthSnapshot {
            online,
            total_requests: total,
            failed_requests: failed,
            recent_success_rate: rate,
            recent_average_ms: average,
            circuits: self.breakers.snapshots(),
            dns: self.dns.stats(),
            connections: self.pool.all_stats(),
        }
    }

    /// Run one health check and update the online flag.
    pub async fn check_health(&self) -> bool {
        let online = match &self.config.health_check_host {
            Some(host) => {
                self.dns.clear_host(host);
                self.dns.resolve(host).await.is_ok()
            }
            None => {
                let health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
                health.window.is_empty() || health.window.iter().any(|(_, ok)| *ok)
            }
        };

        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        if health.online != online {
            if online {
                info!("Network connectivity restored");
            } else {
                warn!("Network appears to be offline");
            }
        }
        health.online = online;
        health.last_check = Some(Instant::now());
        online
    }

    /// Evict stale clients and expired DNS entries.
    pub fn sweep(&self) -> (usize, usize) {
        let clients = self.pool.evict_stale();
        let hosts = self.dns.evict_expired();
        if clients > 0 || hosts > 0 {
            debug!(clients, hosts, "Swept resilience caches");
        }
        (clients, hosts)
    }

    /// Start periodic health checks, pool cleanup and DNS cleanup.
    ///
    /// Runs until `shutdown` is cancelled.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            let start = Instant::now();
            let every = |period: Duration| {
                let mut ticker = interval_at(start + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker
            };
            let mut health = every(ctx.config.health_interval);
            let mut pool = every(ctx.config.pool_sweep_interval);
            let mut dns = every(ctx.config.dns_sweep_interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = health.tick() => {
                        ctx.check_health().await;
                    }
                    _ = pool.tick() => {
                        let evicted = ctx.pool.evict_stale();
                        debug!(evicted, "Pool cleanup");
                    }
                    _ = dns.tick() => {
                        let evicted = ctx.dns.evict_expired();
                        debug!(evicted, "DNS cache cleanup");
                    }
                }
            }
            debug!("Resilience maintenance stopped");
        })
    }
}
