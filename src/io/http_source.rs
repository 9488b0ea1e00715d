use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use tokio::time::Instant;
use tracing::trace;
use url::Url;

use crate::error::FetchError;
use crate::resilience::ResilienceContext;

/// Browser-like user agent; several image servers reject unknown agents.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Trait for downloading whole resources over HTTP.
///
/// This abstraction lets the readers and the tile orchestrator run against a
/// real network or an in-memory fake. Implementations must be thread-safe.
/// A single call makes exactly one attempt; retries and circuit breaking are
/// layered on top by the caller.
#[async_trait]
pub trait HttpSource: Send + Sync {
    /// GET `url` with extra request headers and return the full body.
    ///
    /// Non-success statuses are returned as [`FetchError::Http`].
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<Bytes, FetchError>;
}

/// Hostname of `url`, used as the circuit breaker destination.
pub fn destination_of(url: &str) -> Result<String, FetchError> {
    let parsed = parse_url(url)?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| FetchError::InvalidUrl {
            url: url.to_string(),
            message: "URL has no host".to_string(),
        })
}

fn parse_url(url: &str) -> Result<Url, FetchError> {
    Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        message: e.to_string(),
    })
}

/// [`HttpSource`] that sends requests through the shared client pool.
///
/// Each request acquires a per-host client (bounded by the pool's per-host
/// limit) and records its latency and outcome in the resilience context.
#[derive(Debug, Clone)]
pub struct PooledHttpSource {
    context: Arc<ResilienceContext>,
    user_agent: String,
}

impl PooledHttpSource {
    pub fn new(context: Arc<ResilienceContext>) -> Self {
        Self {
            context,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn context(&self) -> &Arc<ResilienceContext> {
        &self.context
    }

    fn header_map(&self, url: &str, extra: &[(String, String)]) -> Result<HeaderMap, FetchError> {
        let invalid = |message: String| FetchError::InvalidUrl {
            url: url.to_string(),
            message,
        };

        let mut headers = HeaderMap::new();
        let agent = HeaderValue::from_str(&self.user_agent)
            .map_err(|e| invalid(format!("invalid user agent: {}", e)))?;
        headers.insert(USER_AGENT, agent);

        for (name, value) in extra {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| invalid(format!("invalid header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| invalid(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl HttpSource for PooledHttpSource {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<Bytes, FetchError> {
        let parsed = parse_url(url)?;
        let host = parsed.host_str().ok_or_else(|| FetchError::InvalidUrl {
            url: url.to_string(),
            message: "URL has no host".to_string(),
        })?;
        let port = parsed.port_or_known_default().unwrap_or(80);
        let headers = self.header_map(url, headers)?;

        let connection = self.context.connection(host, port).await?;
        let started = Instant::now();

        let result = async {
            let response = connection
                .client()
                .get(parsed.clone())
                .headers(headers)
                .send()
                .await
                .map_err(|e| FetchError::from_reqwest(url, &e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Http {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            response
                .bytes()
                .await
                .map_err(|e| FetchError::from_reqwest(url, &e))
        }
        .await;

        let elapsed = started.elapsed();
        self.context
            .record_request_metrics(host, elapsed, result.is_ok());
        trace!(
            url,
            ok = result.is_ok(),
            elapsed_ms = elapsed.as_millis() as u64,
            "HTTP GET"
        );
        result
    }
}
