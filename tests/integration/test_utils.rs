//! Test utilities for integration tests.
//!
//! This module provides a scriptable HTTP source, builders for test
//! containers and helpers for serving Deep Zoom pyramids.

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tilestitch::error::{FetchError, NetworkErrorKind};
use tilestitch::io::HttpSource;

// =============================================================================
// Mock HTTP Source with Request Tracking
// =============================================================================

/// One scripted reply.
#[derive(Clone, Debug)]
pub enum Reply {
    Body(Bytes),
    Status(u16),
    Network(NetworkErrorKind),
    /// Never answers; only cancellation ends the request
    Hang,
}

/// An HTTP source serving scripted replies per URL.
///
/// Each URL has a queue of replies; the last one repeats once the queue is
/// down to a single entry. Unknown URLs answer 404.
#[derive(Default)]
pub struct MockHttpSource {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<String>>,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
    latency: Option<Duration>,
}

impl MockHttpSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_body(self, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.script(url, vec![Reply::Body(body.into())])
    }

    pub fn with_status(self, url: impl Into<String>, status: u16) -> Self {
        self.script(url, vec![Reply::Status(status)])
    }

    pub fn with_hang(self, url: impl Into<String>) -> Self {
        self.script(url, vec![Reply::Hang])
    }

    /// Replies are consumed in order; the last one repeats.
    pub fn script(self, url: impl Into<String>, replies: Vec<Reply>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(url.into(), replies.into_iter().collect());
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests_for(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(Reply::Status(404)),
            None => Reply::Status(404),
        }
    }
}

/// Decrements the in-flight counter even when the request future is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HttpSource for MockHttpSource {
    async fn get(&self, url: &str, _headers: &[(String, String)]) -> Result<Bytes, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(Arc::clone(&self.in_flight));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self.next_reply(url) {
            Reply::Body(body) => Ok(body),
            Reply::Status(status) => Err(FetchError::Http {
                status,
                url: url.to_string(),
            }),
            Reply::Network(kind) => Err(FetchError::Network {
                kind,
                url: url.to_string(),
                message: "scripted failure".to_string(),
            }),
            Reply::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

// =============================================================================
// Test Image Creation
// =============================================================================

/// A solid-colour RGB JPEG.
pub fn solid_jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(color));
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, 95);
    encoder.encode_image(&img).unwrap();
    buf
}

/// Colour used for tile `index` so regions can be told apart after stitching.
pub fn tile_color(index: usize) -> [u8; 3] {
    const PALETTE: [[u8; 3]; 6] = [
        [200, 30, 30],
        [30, 200, 30],
        [30, 30, 200],
        [200, 200, 30],
        [30, 200, 200],
        [200, 30, 200],
    ];
    PALETTE[index % PALETTE.len()]
}

/// True when every channel is within `tolerance` of `expected`.
pub fn close_to(pixel: &Rgb<u8>, expected: [u8; 3], tolerance: u8) -> bool {
    pixel
        .0
        .iter()
        .zip(expected)
        .all(|(a, b)| a.abs_diff(b) <= tolerance)
}

/// Split a complete JPEG into shared tables and an abbreviated stream.
///
/// Tables hold SOI, every DQT/DHT segment and EOI; the abbreviated stream
/// keeps everything else.
pub fn split_jpeg_tables(jpeg: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut tables = vec![0xFF, 0xD8];
    let mut tile = vec![0xFF, 0xD8];
    let mut pos = 2;

    while pos + 4 <= jpeg.len() {
        let marker = jpeg[pos + 1];
        if marker == 0xDA {
            tile.extend_from_slice(&jpeg[pos..]);
            break;
        }
        let length = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        let segment = &jpeg[pos..pos + 2 + length];
        if marker == 0xDB || marker == 0xC4 {
            tables.extend_from_slice(segment);
        } else {
            tile.extend_from_slice(segment);
        }
        pos += 2 + length;
    }

    tables.extend_from_slice(&[0xFF, 0xD9]);
    (tables, tile)
}

// =============================================================================
// Container Builder
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrderType {
    LittleEndian,
    BigEndian,
}

/// One tiled directory of a test container.
pub struct DirectorySpec {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub compression: u16,
    /// Payload per tile, row-major; empty payloads produce zero byte counts
    pub tiles: Vec<Vec<u8>>,
    pub jpeg_tables: Option<Vec<u8>>,
}

impl DirectorySpec {
    /// JPEG-compressed directory whose tiles are solid colours from [`tile_color`].
    pub fn solid_jpeg(width: u32, height: u32, tile: u32) -> Self {
        let count = (width.div_ceil(tile) * height.div_ceil(tile)) as usize;
        Self {
            width,
            height,
            tile_width: tile,
            tile_height: tile,
            compression: 7,
            tiles: (0..count)
                .map(|i| solid_jpeg(tile, tile, tile_color(i)))
                .collect(),
            jpeg_tables: None,
        }
    }

    /// Same as [`solid_jpeg`](Self::solid_jpeg) with tables moved to the directory.
    pub fn abbreviated_jpeg(width: u32, height: u32, tile: u32) -> Self {
        let mut dir = Self::solid_jpeg(width, height, tile);
        let mut shared = None;
        for payload in &mut dir.tiles {
            let (tables, abbreviated) = split_jpeg_tables(payload);
            *payload = abbreviated;
            shared.get_or_insert(tables);
        }
        dir.jpeg_tables = shared;
        dir
    }
}

/// Builder for test containers, classic or 64-bit offsets, either byte order.
pub struct ContainerBuilder {
    byte_order: ByteOrderType,
    big: bool,
    directories: Vec<DirectorySpec>,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self {
            byte_order: ByteOrderType::LittleEndian,
            big: false,
            directories: Vec::new(),
        }
    }

    pub fn with_byte_order(mut self, order: ByteOrderType) -> Self {
        self.byte_order = order;
        self
    }

    pub fn with_big_offsets(mut self, big: bool) -> Self {
        self.big = big;
        self
    }

    pub fn add_directory(mut self, directory: DirectorySpec) -> Self {
        self.directories.push(directory);
        self
    }

    /// Build the file: header, then per directory its entries, value arrays
    /// and tile payloads.
    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        match self.byte_order {
            ByteOrderType::LittleEndian => out.extend_from_slice(b"II"),
            ByteOrderType::BigEndian => out.extend_from_slice(b"MM"),
        }

        let offset_size = if self.big { 8 } else { 4 };
        if self.big {
            self.put(&mut out, 43, 2);
            self.put(&mut out, 8, 2);
            self.put(&mut out, 0, 2);
        } else {
            self.put(&mut out, 42, 2);
        }
        let mut link_at = out.len();
        self.put(&mut out, 0, offset_size);

        for dir in &self.directories {
            let ifd_at = out.len() as u64;
            self.patch(&mut out, link_at, ifd_at, offset_size);

            let count = dir.tiles.len() as u64;
            let offset_elem = if self.big { 8 } else { 4 };
            let offsets_len = count * offset_elem;
            let counts_len = count * 4;

            let mut entries: Vec<(u16, u16, u64)> = vec![
                (256, 4, 1),
                (257, 4, 1),
                (259, 3, 1),
                (322, 4, 1),
                (323, 4, 1),
                (324, if self.big { 16 } else { 4 }, count),
                (325, 4, count),
            ];
            if let Some(tables) = &dir.jpeg_tables {
                entries.push((347, 7, tables.len() as u64));
            }

            let entry_size = if self.big { 20 } else { 12 };
            let count_size = if self.big { 8 } else { 2 };
            let ifd_len = count_size + entries.len() * entry_size + offset_size;

            // out-of-line data follows the directory: offsets, counts, tables, tiles
            let inline = |len: u64| len <= offset_size as u64;
            let mut data_at = ifd_at + ifd_len as u64;
            let offsets_at = data_at;
            if !inline(offsets_len) {
                data_at += offsets_len;
            }
            let counts_at = data_at;
            if !inline(counts_len) {
                data_at += counts_len;
            }
            let tables_at = data_at;
            data_at += dir.jpeg_tables.as_ref().map_or(0, |t| t.len() as u64);
            let tiles_at = data_at;

            let mut offsets = Vec::new();
            let mut cursor = tiles_at;
            for tile in &dir.tiles {
                let at = if tile.is_empty() { 0 } else { cursor };
                self.put(&mut offsets, at, offset_elem as usize);
                cursor += tile.len() as u64;
            }
            let mut counts = Vec::new();
            for tile in &dir.tiles {
                self.put(&mut counts, tile.len() as u64, 4);
            }

            self.put(&mut out, entries.len() as u64, count_size);
            for (tag, ty, n) in &entries {
                self.put(&mut out, *tag as u64, 2);
                self.put(&mut out, *ty as u64, 2);
                self.put(&mut out, *n, if self.big { 8 } else { 4 });
                let start = out.len();
                match tag {
                    256 => self.put(&mut out, dir.width as u64, 4),
                    257 => self.put(&mut out, dir.height as u64, 4),
                    259 => self.put(&mut out, dir.compression as u64, 2),
                    322 => self.put(&mut out, dir.tile_width as u64, 4),
                    323 => self.put(&mut out, dir.tile_height as u64, 4),
                    324 if inline(offsets_len) => out.extend_from_slice(&offsets),
                    324 => self.put(&mut out, offsets_at, offset_size),
                    325 if inline(counts_len) => out.extend_from_slice(&counts),
                    325 => self.put(&mut out, counts_at, offset_size),
                    347 => self.put(&mut out, tables_at, offset_size),
                    _ => {}
                }
                while out.len() < start + offset_size {
                    out.push(0);
                }
            }
            link_at = out.len();
            self.put(&mut out, 0, offset_size);

            if !inline(offsets_len) {
                out.extend_from_slice(&offsets);
            }
            if !inline(counts_len) {
                out.extend_from_slice(&counts);
            }
            if let Some(tables) = &dir.jpeg_tables {
                out.extend_from_slice(tables);
            }
            for tile in &dir.tiles {
                out.extend_from_slice(tile);
            }
        }

        out
    }

    fn put(&self, out: &mut Vec<u8>, value: u64, size: usize) {
        let bytes = match self.byte_order {
            ByteOrderType::LittleEndian => value.to_le_bytes()[..size].to_vec(),
            ByteOrderType::BigEndian => value.to_be_bytes()[8 - size..].to_vec(),
        };
        out.extend_from_slice(&bytes);
    }

    fn patch(&self, out: &mut [u8], at: usize, value: u64, size: usize) {
        let bytes = match self.byte_order {
            ByteOrderType::LittleEndian => value.to_le_bytes()[..size].to_vec(),
            ByteOrderType::BigEndian => value.to_be_bytes()[8 - size..].to_vec(),
        };
        out[at..at + size].copy_from_slice(&bytes);
    }
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Pyramid Helpers
// =============================================================================

/// A Deep Zoom XML descriptor.
pub fn dzi_xml(width: u32, height: u32, tile_size: u32, overlap: u32, format: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Image xmlns="http://schemas.microsoft.com/deepzoom/2008" TileSize="{tile_size}" Overlap="{overlap}" Format="{format}">
  <Size Width="{width}" Height="{height}"/>
</Image>"#
    )
}

/// Every tile of the full-resolution level of a pyramid whose descriptor
/// lives at `descriptor_url`, in index order. Tiles carry their overlap and
/// are solid colours from [`tile_color`].
pub fn pyramid_tiles(
    descriptor_url: &str,
    width: u32,
    height: u32,
    tile_size: u32,
    overlap: u32,
) -> Vec<(String, Vec<u8>)> {
    let level = max_level(width, height);
    let base = descriptor_url.trim_end_matches(".dzi");
    let columns = width.div_ceil(tile_size);
    let rows = height.div_ceil(tile_size);

    let mut tiles = Vec::new();
    for row in 0..rows {
        for col in 0..columns {
            let x = col * tile_size;
            let y = row * tile_size;
            let w = tile_size.min(width - x)
                + if col > 0 { overlap } else { 0 }
                + if col + 1 < columns { overlap } else { 0 };
            let h = tile_size.min(height - y)
                + if row > 0 { overlap } else { 0 }
                + if row + 1 < rows { overlap } else { 0 };
            let url = format!("{base}_files/{level}/{col}_{row}.jpg");
            let jpeg = solid_jpeg(w, h, tile_color(tiles.len()));
            tiles.push((url, jpeg));
        }
    }
    tiles
}

/// Populate `source` with a pyramid's descriptor and tiles. Returns the
/// source and the tile URLs in index order.
pub fn serve_pyramid(
    mut source: MockHttpSource,
    descriptor_url: &str,
    width: u32,
    height: u32,
    tile_size: u32,
    overlap: u32,
) -> (MockHttpSource, Vec<String>) {
    source = source.with_body(
        descriptor_url,
        dzi_xml(width, height, tile_size, overlap, "jpg"),
    );

    let mut urls = Vec::new();
    for (url, jpeg) in pyramid_tiles(descriptor_url, width, height, tile_size, overlap) {
        source = source.with_body(url.clone(), jpeg);
        urls.push(url);
    }
    (source, urls)
}

/// Deep Zoom maximum level for the given full-resolution size.
pub fn max_level(width: u32, height: u32) -> u32 {
    let max = width.max(height).max(1);
    32 - (max - 1).leading_zeros()
}
