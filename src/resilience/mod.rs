//! Network resilience: circuit breakers, retry backoff, failure
//! classification, DNS caching and per-host client pooling.
//!
//! Everything is reached through a shared [`ResilienceContext`].

mod breaker;
mod classify;
mod context;
mod dns;
mod pool;
mod retry;

pub use breaker::{Admission, BreakerConfig, BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
pub use classify::{classify, classify_page, Classification, ErrorCategory};
pub use context::{HealthSnapshot, ResilienceConfig, ResilienceContext, RetryDecision};
pub use dns::{DnsCache, DnsStats, Resolver, SystemResolver, DEFAULT_DNS_CAPACITY, DEFAULT_DNS_TTL};
pub use pool::{ConnectionPool, ConnectionStats, PoolSettings, PooledConnection};
pub use retry::RetryPolicy;
