//! Resilience layer tests: retries, circuit breakers and cancellation.
//!
//! All tests run on a paused clock, so backoff delays and recovery timeouts
//! elapse instantly.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tilestitch::error::{FetchError, NetworkErrorKind};
use tilestitch::fetch::TileFetchOrchestrator;
use tilestitch::io::HttpSource;
use tilestitch::resilience::{CircuitState, ResilienceConfig, ResilienceContext, RetryPolicy};
use tilestitch::tile::{Crop, PixelRect, TileDescriptor, TileLocation};

use super::test_utils::{MockHttpSource, Reply};

const HOST: &str = "tiles.example.org";

fn context() -> Arc<ResilienceContext> {
    Arc::new(ResilienceContext::new(ResilienceConfig {
        retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(2)),
        ..ResilienceConfig::default()
    }))
}

fn url(i: usize) -> String {
    format!("https://{HOST}/page_files/3/{i}_0.jpg")
}

fn tiles(n: usize) -> Vec<TileDescriptor> {
    (0..n)
        .map(|i| TileDescriptor {
            index: i,
            column: i as u32,
            row: 0,
            location: TileLocation::Url { url: url(i) },
            dest: PixelRect::new(i as u32 * 8, 0, 8, 8),
            crop: Crop::default(),
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_network_errors_retried_until_success() {
    let source = MockHttpSource::new().script(
        url(0),
        vec![
            Reply::Network(NetworkErrorKind::ConnectionReset),
            Reply::Network(NetworkErrorKind::Timeout),
            Reply::Body(Bytes::from_static(b"tile")),
        ],
    );
    let ctx = context();
    let cancel = CancellationToken::new();
    let tile = url(0);

    let body = ctx
        .call(HOST, &cancel, || source.get(&tile, &[]))
        .await
        .unwrap();

    assert_eq!(body.as_ref(), b"tile");
    assert_eq!(source.requests_for(&url(0)), 3);
    let status = ctx.status(HOST).unwrap();
    assert_eq!(status.state, CircuitState::Closed);
    // each success forgives one failure
    assert_eq!(status.failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_fails_fast() {
    let mut source = MockHttpSource::new();
    for i in 0..8 {
        source = source.script(url(i), vec![Reply::Network(NetworkErrorKind::ConnectionRefused)]);
    }
    let source = Arc::new(source);
    let ctx = context();
    let orchestrator = TileFetchOrchestrator::new(source.clone(), Arc::clone(&ctx), 1);

    let set = orchestrator
        .fetch_tiles(tiles(8), &[], 0, None, &CancellationToken::new())
        .await;

    assert!(set.fetched.is_empty());
    assert_eq!(set.missing, (0..8).collect::<Vec<_>>());
    assert_eq!(source.request_count(), 5);
    assert!(matches!(set.last_error, Some(FetchError::CircuitOpen { .. })));
    assert_eq!(ctx.status(HOST).unwrap().state, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_after_trial_calls() {
    let ctx = context();
    let cancel = CancellationToken::new();
    let refused = || async {
        Err::<(), _>(FetchError::Network {
            kind: NetworkErrorKind::ConnectionRefused,
            url: url(0),
            message: "refused".to_string(),
        })
    };

    for _ in 0..5 {
        let _ = ctx.call_once(HOST, &cancel, refused).await;
    }
    assert!(!ctx.can_execute(HOST).allowed);

    tokio::time::advance(Duration::from_secs(61)).await;

    for _ in 0..3 {
        ctx.call_once(HOST, &cancel, || async { Ok::<_, FetchError>(()) })
            .await
            .unwrap();
    }
    assert_eq!(ctx.status(HOST).unwrap().state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_http_errors_do_not_trip_breaker() {
    let source = MockHttpSource::new().with_status(url(0), 503);
    let ctx = context();
    let cancel = CancellationToken::new();
    let tile = url(0);

    for _ in 0..3 {
        let err = ctx
            .call(HOST, &cancel, || source.get(&tile, &[]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    // three calls of four attempts each
    assert_eq!(source.requests_for(&url(0)), 12);
    assert_eq!(ctx.status(HOST).unwrap().state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_given_up_immediately() {
    let source = MockHttpSource::new();
    let ctx = context();
    let tile = url(0);

    let err = ctx
        .call(HOST, &CancellationToken::new(), || source.get(&tile, &[]))
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(404));
    assert_eq!(source.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_aborts_hanging_request() {
    let source = Arc::new(MockHttpSource::new().with_hang(url(0)));
    let ctx = context();
    let cancel = CancellationToken::new();

    let task = {
        let source = Arc::clone(&source);
        let ctx = Arc::clone(&ctx);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let tile = url(0);
            ctx.call(HOST, &cancel, || source.get(&tile, &[])).await
        })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(source.in_flight(), 1);
    cancel.cancel();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(FetchError::Cancelled)));
    assert_eq!(source.in_flight(), 0);
    // cancellation is not a failure of the destination
    assert_eq!(ctx.status(HOST).map(|s| s.failures), Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_health_reflects_request_outcomes() {
    let ctx = context();
    for i in 0..4 {
        ctx.record_request_metrics(HOST, Duration::from_millis(100), i != 0);
    }

    let health = ctx.health();
    assert_eq!(health.total_requests, 4);
    assert_eq!(health.failed_requests, 1);
    assert!((health.recent_success_rate - 0.75).abs() < 1e-9);
    assert!(ctx.check_health().await);
}
