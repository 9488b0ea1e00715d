//! Page assembly tests through the public entry point.
//!
//! Tests that stitch with the raster compositor run on the real clock since
//! tile decoding happens on blocking threads under a batch timeout. Timeout
//! and cancellation tests run on a paused clock.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tilestitch::error::{FetchError, PageError};
use tilestitch::fetch::{FetchSettings, PageFetcher, PageSource};
use tilestitch::monitor::{ProfileTable, SourceProfile};
use tilestitch::resilience::{ErrorCategory, ResilienceConfig, ResilienceContext, RetryPolicy};
use tilestitch::tile::{
    decode_rgb, FirstTileCompositor, SourceFormat, StitchSettings, TileStitcher,
};

use super::test_utils::{
    close_to, serve_pyramid, solid_jpeg, tile_color, ContainerBuilder, DirectorySpec,
    MockHttpSource, Reply,
};

const DZI: &str = "https://images.example.org/ms/page.dzi";

fn fetcher_with(source: Arc<MockHttpSource>, settings: FetchSettings) -> PageFetcher {
    let resilience = Arc::new(ResilienceContext::new(ResilienceConfig {
        retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50)),
        ..ResilienceConfig::default()
    }));
    let mut profiles = ProfileTable::builtin();
    profiles.insert(SourceProfile::new("fast", 2, 1, 10).with_max_retries(0));
    PageFetcher::new(source, resilience, settings).with_profiles(profiles)
}

fn fetcher(source: Arc<MockHttpSource>) -> PageFetcher {
    fetcher_with(source, FetchSettings::default())
}

fn pyramid() -> PageSource {
    PageSource::Pyramid {
        descriptor_url: DZI.to_string(),
        template: None,
        level: None,
    }
}

/// A 300x200 pyramid of 64px tiles (5x4 grid) whose tile URLs all hang.
fn hanging_pyramid() -> (MockHttpSource, Vec<String>) {
    let (mut source, urls) = serve_pyramid(MockHttpSource::new(), DZI, 300, 200, 64, 1);
    for url in &urls {
        source = source.with_hang(url.clone());
    }
    (source, urls)
}

// =============================================================================
// Successful pages
// =============================================================================

#[tokio::test]
async fn test_concurrency_bounded() {
    let (source, urls) = serve_pyramid(
        MockHttpSource::new().with_latency(Duration::from_millis(20)),
        DZI,
        300,
        200,
        64,
        1,
    );
    let source = Arc::new(source);
    let fetcher = fetcher_with(
        Arc::clone(&source),
        FetchSettings {
            concurrency: 3,
            ..FetchSettings::default()
        },
    );

    let page = fetcher.fetch_page(&pyramid(), "default").await.unwrap();

    assert_eq!(page.tiles_total, 20);
    assert_eq!(page.tiles_missing, 0);
    assert!(source.peak_in_flight() <= 3);
    // descriptor first, then tiles in index order
    let requests = source.requests();
    assert_eq!(requests[0], DZI);
    assert_eq!(requests[1], urls[0]);
}

#[tokio::test]
async fn test_custom_template_and_level() {
    let source = MockHttpSource::new()
        .with_body(DZI, super::test_utils::dzi_xml(300, 200, 128, 0, "png"))
        .with_body(
            "https://images.example.org/ms/page/tiles/8/0-0.png",
            solid_jpeg(128, 100, tile_color(0)),
        )
        .with_body(
            "https://images.example.org/ms/page/tiles/8/1-0.png",
            solid_jpeg(22, 100, tile_color(1)),
        );
    let fetcher = fetcher(Arc::new(source));

    let page = fetcher
        .fetch_page(
            &PageSource::Pyramid {
                descriptor_url: DZI.to_string(),
                template: Some("{base}/tiles/{level}/{col}-{row}.{format}".to_string()),
                level: Some(8),
            },
            "default",
        )
        .await
        .unwrap();

    assert_eq!((page.width, page.height), (150, 100));
    assert_eq!(page.tiles_total, 2);
    let image = decode_rgb(&page.data).unwrap();
    assert!(close_to(image.get_pixel(64, 50), tile_color(0), 20));
    assert!(close_to(image.get_pixel(140, 50), tile_color(1), 20));
}

#[tokio::test]
async fn test_container_detected_from_bytes() {
    let url = "https://images.example.org/iiif/page?id=3";
    let data = ContainerBuilder::new()
        .add_directory(DirectorySpec::solid_jpeg(128, 64, 64))
        .build();
    let fetcher = fetcher(Arc::new(MockHttpSource::new().with_body(url, data)));

    let page = fetcher
        .fetch_page(
            &PageSource::Auto {
                url: url.to_string(),
            },
            "default",
        )
        .await
        .unwrap();

    assert_eq!(page.format, SourceFormat::Container);
    assert_eq!((page.width, page.height), (128, 64));
}

#[tokio::test]
async fn test_canvas_clamped() {
    let (source, _) = serve_pyramid(MockHttpSource::new(), DZI, 300, 200, 64, 1);
    let fetcher = fetcher_with(
        Arc::new(source),
        FetchSettings {
            stitch: StitchSettings {
                max_canvas_edge: 128,
                ..StitchSettings::default()
            },
            ..FetchSettings::default()
        },
    );

    let page = fetcher.fetch_page(&pyramid(), "default").await.unwrap();

    assert!(page.clamped);
    assert_eq!((page.width, page.height), (128, 128));
    assert_eq!(page.tiles_missing, 0);
    assert!(page.tiles_skipped > 0);
}

#[tokio::test]
async fn test_profile_retry_budget() {
    let (source, urls) = serve_pyramid(MockHttpSource::new(), DZI, 300, 200, 64, 1);
    let source = Arc::new(source.with_status(urls[7].clone(), 503));
    let fetcher = fetcher(Arc::clone(&source));

    // morgan allows two retries
    let page = fetcher.fetch_page(&pyramid(), "morgan").await.unwrap();

    assert_eq!(page.tiles_missing, 1);
    assert_eq!(source.requests_for(&urls[7]), 3);
}

#[tokio::test]
async fn test_retry_ceiling_caps_profile_budget() {
    let (source, urls) = serve_pyramid(MockHttpSource::new(), DZI, 300, 200, 64, 1);
    let source = Arc::new(
        source
            .with_status(urls[3].clone(), 503)
            .with_status(urls[4].clone(), 503),
    );

    // graz asks for five retries, the ceiling allows one
    let fetcher = fetcher_with(
        Arc::clone(&source),
        FetchSettings {
            max_retries: 1,
            ..FetchSettings::default()
        },
    );
    let page = fetcher.fetch_page(&pyramid(), "graz").await.unwrap();
    assert_eq!(page.tiles_missing, 2);
    assert_eq!(source.requests_for(&urls[3]), 2);

    // a zero ceiling disables retries even for the default profile
    let fetcher = fetcher_with(
        Arc::clone(&source),
        FetchSettings {
            max_retries: 0,
            ..FetchSettings::default()
        },
    );
    fetcher.fetch_page(&pyramid(), "default").await.unwrap();
    assert_eq!(source.requests_for(&urls[4]), 2 + 1);
}

#[tokio::test]
async fn test_inspect_container_counts_empty_entries() {
    let url = "https://images.example.org/ms/f002v.tif";
    let mut dir = DirectorySpec::solid_jpeg(192, 64, 64);
    dir.tiles[2].clear();
    let data = ContainerBuilder::new().add_directory(dir).build();
    let fetcher = fetcher(Arc::new(MockHttpSource::new().with_body(url, data)));

    let summary = fetcher
        .inspect(&PageSource::Auto {
            url: url.to_string(),
        })
        .await
        .unwrap();

    assert_eq!(summary.tile_count, 3);
    assert_eq!(summary.empty_tiles, 1);
    assert_eq!(summary.max_level, None);
}

#[tokio::test]
async fn test_short_tile_table_counts_absent_cells() {
    let url = "https://images.example.org/ms/f003r.tif";
    let mut dir = DirectorySpec::solid_jpeg(192, 64, 64);
    dir.tiles.truncate(2);
    let data = ContainerBuilder::new().add_directory(dir).build();
    let fetcher = fetcher(Arc::new(MockHttpSource::new().with_body(url, data)));

    let page = fetcher
        .fetch_page(
            &PageSource::Auto {
                url: url.to_string(),
            },
            "default",
        )
        .await
        .unwrap();

    assert_eq!((page.width, page.height), (192, 64));
    assert_eq!(page.tiles_total, 3);
    assert_eq!(page.tiles_missing, 1);
}

// =============================================================================
// Failed pages
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_unrecognized_source() {
    let url = "https://images.example.org/viewer/page";
    let fetcher = fetcher(Arc::new(
        MockHttpSource::new().with_body(url, Bytes::from_static(b"plain text, no tiles here")),
    ));

    let failure = fetcher
        .fetch_page(
            &PageSource::Auto {
                url: url.to_string(),
            },
            "default",
        )
        .await
        .unwrap_err();

    assert!(matches!(failure.error, PageError::UnrecognizedSource { .. }));
    assert!(failure.classification.is_permanent());
}

#[tokio::test(start_paused = true)]
async fn test_all_tiles_missing() {
    let source = MockHttpSource::new().with_body(
        DZI,
        super::test_utils::dzi_xml(300, 200, 64, 1, "jpg"),
    );
    let fetcher = fetcher(Arc::new(source));

    let failure = fetcher.fetch_page(&pyramid(), "default").await.unwrap_err();

    assert!(matches!(
        failure.error,
        PageError::Fetch(FetchError::Http { status: 404, .. })
    ));
    assert_eq!(failure.classification.category, ErrorCategory::Permanent);
    assert!(failure.partial.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_descriptor_not_found() {
    let fetcher = fetcher(Arc::new(MockHttpSource::new()));

    let failure = fetcher.fetch_page(&pyramid(), "default").await.unwrap_err();

    assert!(matches!(failure.error, PageError::Pyramid(_)));
    assert!(failure.classification.is_permanent());
}

#[tokio::test(start_paused = true)]
async fn test_session_timeout_aborts_downloads() {
    let (source, _) = hanging_pyramid();
    let source = Arc::new(source);
    let fetcher = fetcher(Arc::clone(&source));

    let failure = fetcher.fetch_page(&pyramid(), "fast").await.unwrap_err();

    match failure.error {
        PageError::SessionTimeout {
            completed,
            total,
            elapsed,
        } => {
            assert_eq!((completed, total), (0, 20));
            assert!(elapsed >= Duration::from_secs(10));
        }
        other => panic!("expected a session timeout, got {other:?}"),
    }
    assert_eq!(failure.classification.category, ErrorCategory::Temporary);
    assert!(failure.partial.is_none());
    assert_eq!(source.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_returns_partial_image() {
    let (source, urls) = hanging_pyramid();
    let source = source
        .with_body(urls[0].clone(), solid_jpeg(65, 65, tile_color(0)))
        .script(
            urls[1].clone(),
            vec![Reply::Body(Bytes::from(solid_jpeg(66, 65, tile_color(1))))],
        );
    let source = Arc::new(source);
    let fetcher = fetcher(Arc::clone(&source)).with_stitcher(TileStitcher::new(
        Arc::new(FirstTileCompositor),
        StitchSettings::default(),
    ));

    let failure = fetcher.fetch_page(&pyramid(), "fast").await.unwrap_err();

    assert!(matches!(
        failure.error,
        PageError::SessionTimeout { completed: 2, total: 20, .. }
    ));
    let partial = failure.partial.expect("partial image");
    assert_eq!(partial.tiles_total, 20);
    assert_eq!(partial.tiles_missing, 18);
    assert_eq!(source.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancellation() {
    let (source, _) = hanging_pyramid();
    let source = Arc::new(source);
    let fetcher = fetcher(Arc::clone(&source));
    let parent = CancellationToken::new();

    let task = {
        let parent = parent.clone();
        tokio::spawn(async move {
            fetcher
                .fetch_page_with_cancel(&pyramid(), "default", &parent)
                .await
        })
    };

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(source.in_flight() > 0);
    parent.cancel();

    let failure = task.await.unwrap().unwrap_err();
    assert!(matches!(failure.error, PageError::Cancelled));
    assert!(failure.partial.is_none());
    assert_eq!(source.in_flight(), 0);
}
