//! Pyramid download tests over a real local HTTP server.
//!
//! These tests run the full transport stack: DNS cache, per-host clients,
//! breaker and retry policy, against an axum server on 127.0.0.1.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tilestitch::fetch::{FetchSettings, PageFetcher, PageSource};
use tilestitch::io::{PooledHttpSource, DEFAULT_USER_AGENT};
use tilestitch::resilience::{ResilienceConfig, ResilienceContext, RetryPolicy};
use tilestitch::tile::{decode_rgb, SourceFormat};

use super::test_utils::{close_to, dzi_xml, max_level, pyramid_tiles, tile_color};

// =============================================================================
// Test server
// =============================================================================

/// Files served by path, plus scripted failures and request logs.
#[derive(Default)]
struct Site {
    files: HashMap<String, Vec<u8>>,
    /// Remaining 503 answers per path
    failures: Mutex<HashMap<String, usize>>,
    hits: Mutex<HashMap<String, usize>>,
    headers: Mutex<HashMap<String, HeaderMap>>,
}

impl Site {
    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    fn header(&self, path: &str, name: &str) -> Option<String> {
        self.headers
            .lock()
            .unwrap()
            .get(path)
            .and_then(|h| h.get(name))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

async fn serve(State(site): State<Arc<Site>>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    *site.hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;
    site.headers.lock().unwrap().insert(path.clone(), headers);

    {
        let mut failures = site.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&path) {
            if *remaining > 0 {
                *remaining -= 1;
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        }
    }

    match site.files.get(&path) {
        Some(body) => body.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start(site: Arc<Site>) -> SocketAddr {
    let app = Router::new().fallback(serve).with_state(site);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A 300x200 pyramid with 128px tiles and 2px overlap under `/ms/page.dzi`.
fn pyramid_site() -> Site {
    let mut site = Site::default();
    site.files.insert(
        "/ms/page.dzi".to_string(),
        dzi_xml(300, 200, 128, 2, "jpg").into_bytes(),
    );
    for (path, jpeg) in pyramid_tiles("/ms/page.dzi", 300, 200, 128, 2) {
        site.files.insert(path, jpeg);
    }
    site
}

fn tile_path(col: u32, row: u32) -> String {
    format!("/ms/page_files/{}/{}_{}.jpg", max_level(300, 200), col, row)
}

fn fetcher() -> PageFetcher {
    let resilience = Arc::new(ResilienceContext::new(ResilienceConfig {
        retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50)),
        ..ResilienceConfig::default()
    }));
    let http = Arc::new(PooledHttpSource::new(Arc::clone(&resilience)));
    PageFetcher::new(http, resilience, FetchSettings::default())
}

fn descriptor_source(addr: SocketAddr) -> PageSource {
    PageSource::Pyramid {
        descriptor_url: format!("http://{addr}/ms/page.dzi"),
        template: None,
        level: None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_pyramid_page_over_http() {
    let site = Arc::new(pyramid_site());
    let addr = start(Arc::clone(&site)).await;

    let page = fetcher()
        .fetch_page(&descriptor_source(addr), "default")
        .await
        .unwrap();

    assert_eq!((page.width, page.height), (300, 200));
    assert_eq!(page.format, SourceFormat::Pyramid);
    assert_eq!(page.tiles_total, 6);
    assert_eq!(page.tiles_missing, 0);

    let image = decode_rgb(&page.data).unwrap();
    assert_eq!(image.dimensions(), (300, 200));
    assert!(close_to(image.get_pixel(64, 64), tile_color(0), 20));
    assert!(close_to(image.get_pixel(192, 64), tile_color(1), 20));
    assert!(close_to(image.get_pixel(280, 64), tile_color(2), 20));
    assert!(close_to(image.get_pixel(64, 180), tile_color(3), 20));
    assert!(close_to(image.get_pixel(280, 180), tile_color(5), 20));

    assert_eq!(
        site.header(&tile_path(0, 0), "user-agent").as_deref(),
        Some(DEFAULT_USER_AGENT)
    );
}

#[tokio::test]
async fn test_transient_failures_retried() {
    let site = pyramid_site();
    site.failures.lock().unwrap().insert(tile_path(1, 0), 2);
    let site = Arc::new(site);
    let addr = start(Arc::clone(&site)).await;

    let page = fetcher()
        .fetch_page(&descriptor_source(addr), "default")
        .await
        .unwrap();

    assert_eq!(page.tiles_missing, 0);
    assert_eq!(site.hits(&tile_path(1, 0)), 3);
    assert_eq!(site.hits(&tile_path(0, 0)), 1);
}

#[tokio::test]
async fn test_missing_tile_not_retried() {
    let mut site = pyramid_site();
    site.files.remove(&tile_path(2, 1));
    let site = Arc::new(site);
    let addr = start(Arc::clone(&site)).await;

    let page = fetcher()
        .fetch_page(&descriptor_source(addr), "default")
        .await
        .unwrap();

    assert_eq!(page.tiles_missing, 1);
    assert_eq!(site.hits(&tile_path(2, 1)), 1);

    let image = decode_rgb(&page.data).unwrap();
    assert!(close_to(image.get_pixel(280, 180), [255, 255, 255], 8));
    assert!(close_to(image.get_pixel(64, 180), tile_color(3), 20));
}

#[tokio::test]
async fn test_auto_detects_descriptor() {
    let site = Arc::new(pyramid_site());
    let addr = start(Arc::clone(&site)).await;

    let page = fetcher()
        .fetch_page(
            &PageSource::Auto {
                url: format!("http://{addr}/ms/page.dzi"),
            },
            "default",
        )
        .await
        .unwrap();

    assert_eq!(page.format, SourceFormat::Pyramid);
    assert_eq!(site.hits("/ms/page.dzi"), 1);
}

#[tokio::test]
async fn test_profile_headers_sent() {
    let site = Arc::new(pyramid_site());
    let addr = start(Arc::clone(&site)).await;

    fetcher()
        .fetch_page(&descriptor_source(addr), "bdl")
        .await
        .unwrap();

    assert_eq!(
        site.header(&tile_path(1, 1), "referer").as_deref(),
        Some("https://www.bdl.servizirl.it/")
    );
}

#[tokio::test]
async fn test_inspect_pyramid() {
    let site = Arc::new(pyramid_site());
    let addr = start(Arc::clone(&site)).await;

    let summary = fetcher().inspect(&descriptor_source(addr)).await.unwrap();

    assert_eq!(summary.max_level, Some(9));
    assert_eq!((summary.columns, summary.rows), (3, 2));
    assert_eq!(summary.tile_count, 6);
    assert_eq!(summary.descriptor.overlap, 2);
    assert_eq!(site.hits(&tile_path(0, 0)), 0);
}

#[tokio::test]
async fn test_unreachable_server_is_temporary() {
    // Bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let failure = fetcher()
        .fetch_page(&descriptor_source(addr), "default")
        .await
        .unwrap_err();

    assert!(!failure.classification.is_permanent());
    assert!(failure.partial.is_none());
}
