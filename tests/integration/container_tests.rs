//! Container parsing and stitching tests.
//!
//! Containers are built in memory and either parsed directly or served through
//! the mock HTTP source and assembled by the page fetcher.

use bytes::Bytes;
use std::sync::Arc;

use tilestitch::error::ContainerError;
use tilestitch::fetch::{FetchSettings, PageFetcher, PageSource};
use tilestitch::format::container::ContainerReader;
use tilestitch::resilience::{ResilienceConfig, ResilienceContext};
use tilestitch::tile::{decode_rgb, PixelRect, SourceFormat};

use super::test_utils::{
    close_to, tile_color, ByteOrderType, ContainerBuilder, DirectorySpec, MockHttpSource,
};

const PAGE_URL: &str = "https://images.example.org/ms/f001r.zif";

fn fetcher(source: MockHttpSource) -> PageFetcher {
    let resilience = Arc::new(ResilienceContext::new(ResilienceConfig::default()));
    PageFetcher::new(Arc::new(source), resilience, FetchSettings::default())
}

// =============================================================================
// Parsing
// =============================================================================

#[test]
fn test_little_and_big_endian_agree() {
    let little = ContainerBuilder::new()
        .add_directory(DirectorySpec::solid_jpeg(150, 100, 64))
        .build();
    let big = ContainerBuilder::new()
        .with_byte_order(ByteOrderType::BigEndian)
        .add_directory(DirectorySpec::solid_jpeg(150, 100, 64))
        .build();

    let little = ContainerReader::parse("mem://le", Bytes::from(little)).unwrap();
    let big = ContainerReader::parse("mem://be", Bytes::from(big)).unwrap();

    assert_eq!(little.descriptor.width, big.descriptor.width);
    assert_eq!(little.descriptor.height, big.descriptor.height);
    assert_eq!(little.tiles.len(), 6);
    assert_eq!(
        little.tiles.iter().map(|t| t.dest).collect::<Vec<_>>(),
        big.tiles.iter().map(|t| t.dest).collect::<Vec<_>>()
    );
}

#[test]
fn test_big_offsets() {
    let data = ContainerBuilder::new()
        .with_big_offsets(true)
        .add_directory(DirectorySpec::solid_jpeg(200, 130, 64))
        .build();

    let parsed = ContainerReader::parse("mem://big", Bytes::from(data)).unwrap();
    assert_eq!(parsed.descriptor.columns(), 4);
    assert_eq!(parsed.descriptor.rows(), 3);
    assert_eq!(parsed.tiles.len(), 12);

    let last = parsed.tiles.last().unwrap();
    assert_eq!(last.dest, PixelRect::new(192, 128, 8, 2));
}

#[test]
fn test_largest_directory_selected() {
    let data = ContainerBuilder::new()
        .add_directory(DirectorySpec::solid_jpeg(64, 64, 64))
        .add_directory(DirectorySpec::solid_jpeg(256, 192, 64))
        .add_directory(DirectorySpec::solid_jpeg(128, 96, 64))
        .build();

    let parsed = ContainerReader::parse(PAGE_URL, Bytes::from(data)).unwrap();
    assert_eq!(
        (parsed.descriptor.width, parsed.descriptor.height),
        (256, 192)
    );
    assert_eq!(parsed.descriptor.format, SourceFormat::Container);
    assert_eq!(parsed.descriptor.codec, "jpeg");
}

#[test]
fn test_shared_tables_merged_into_tiles() {
    let data = ContainerBuilder::new()
        .add_directory(DirectorySpec::abbreviated_jpeg(128, 64, 64))
        .build();

    let parsed = ContainerReader::parse(PAGE_URL, Bytes::from(data)).unwrap();
    assert!(parsed.jpeg_tables().is_some());

    for tile in &parsed.tiles {
        let bytes = parsed.tile_bytes(tile).unwrap();
        let image = decode_rgb(&bytes).unwrap();
        assert_eq!(image.dimensions(), (64, 64));
        assert!(close_to(image.get_pixel(32, 32), tile_color(tile.index), 12));
    }
}

#[test]
fn test_strip_layout_rejected() {
    // ImageWidth, ImageLength, StripOffsets only
    let mut buf = b"II".to_vec();
    buf.extend_from_slice(&42u16.to_le_bytes());
    buf.extend_from_slice(&8u32.to_le_bytes());
    buf.extend_from_slice(&3u16.to_le_bytes());
    for (tag, ty, value) in [(256u16, 4u16, 100u32), (257, 4, 100), (273, 4, 0)] {
        buf.extend_from_slice(&tag.to_le_bytes());
        buf.extend_from_slice(&ty.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf.extend_from_slice(&0u32.to_le_bytes());

    let err = ContainerReader::parse(PAGE_URL, Bytes::from(buf)).unwrap_err();
    assert!(matches!(err, ContainerError::StripOrganization));
}

// =============================================================================
// Page assembly
// =============================================================================

#[tokio::test]
async fn test_container_page_stitched() {
    let data = ContainerBuilder::new()
        .add_directory(DirectorySpec::solid_jpeg(150, 100, 64))
        .build();
    let source = MockHttpSource::new().with_body(PAGE_URL, data);
    let fetcher = fetcher(source);

    let page = fetcher
        .fetch_page(
            &PageSource::Container {
                url: PAGE_URL.to_string(),
            },
            "default",
        )
        .await
        .unwrap();

    assert_eq!((page.width, page.height), (150, 100));
    assert_eq!(page.format, SourceFormat::Container);
    assert_eq!(page.tiles_total, 6);
    assert_eq!(page.tiles_missing, 0);
    assert!(!page.degraded && !page.clamped);

    let image = decode_rgb(&page.data).unwrap();
    assert_eq!(image.dimensions(), (150, 100));
    assert!(close_to(image.get_pixel(32, 32), tile_color(0), 20));
    assert!(close_to(image.get_pixel(96, 32), tile_color(1), 20));
    assert!(close_to(image.get_pixel(140, 32), tile_color(2), 20));
    assert!(close_to(image.get_pixel(32, 90), tile_color(3), 20));
    assert!(close_to(image.get_pixel(140, 90), tile_color(5), 20));
}

#[tokio::test]
async fn test_empty_entries_left_white() {
    let mut dir = DirectorySpec::solid_jpeg(128, 64, 64);
    dir.tiles[1].clear();
    let data = ContainerBuilder::new().add_directory(dir).build();
    let fetcher = fetcher(MockHttpSource::new().with_body(PAGE_URL, data));

    let page = fetcher
        .fetch_page(
            &PageSource::Auto {
                url: PAGE_URL.to_string(),
            },
            "default",
        )
        .await
        .unwrap();

    assert_eq!(page.tiles_total, 2);
    assert_eq!(page.tiles_missing, 1);

    let image = decode_rgb(&page.data).unwrap();
    assert!(close_to(image.get_pixel(32, 32), tile_color(0), 20));
    assert!(close_to(image.get_pixel(96, 32), [255, 255, 255], 8));
}

#[tokio::test]
async fn test_truncated_container_is_permanent() {
    let mut data = ContainerBuilder::new()
        .add_directory(DirectorySpec::solid_jpeg(128, 128, 64))
        .build();
    data.truncate(data.len() - 100);
    let fetcher = fetcher(MockHttpSource::new().with_body(PAGE_URL, data));

    let failure = fetcher
        .fetch_page(
            &PageSource::Container {
                url: PAGE_URL.to_string(),
            },
            "default",
        )
        .await
        .unwrap_err();

    assert!(failure.classification.is_permanent());
    assert!(failure.partial.is_none());
}
