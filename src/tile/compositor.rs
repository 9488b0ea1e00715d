//! Compositing of fetched tiles into one raster.
//!
//! Two implementations sit behind the [`Compositor`] trait:
//!
//! - [`RasterCompositor`] decodes every tile, crops its overlap and draws it
//!   on a white canvas, then encodes the canvas as JPEG.
//! - [`FirstTileCompositor`] returns the first tile's bytes unchanged. It is
//!   the degraded mode used when a canvas cannot be produced at all.
//!
//! [`detect_compositor`] picks one at startup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::{Rgb, RgbImage};
use tracing::{debug, warn};

use crate::error::StitchError;

use super::encoder::{decode_rgb, dimensions, JpegPageEncoder, DEFAULT_JPEG_QUALITY};
use super::types::{FetchedTile, TileDescriptor};

/// Tiles decoded per batch (default).
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Time allowed to decode one batch (default).
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

/// Canvas size and batching for one composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositePlan {
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl CompositePlan {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            quality: DEFAULT_JPEG_QUALITY,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }
}

/// Encoded page produced by a compositor.
#[derive(Debug, Clone)]
pub struct StitchedImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub tiles_drawn: usize,
    /// Tiles supplied but not drawn (undecodable, timed out, or off-canvas)
    pub tiles_skipped: usize,
    /// True when only a single tile was returned instead of a composite
    pub degraded: bool,
    /// True when the canvas was smaller than the declared image size
    pub clamped: bool,
}

/// Turns a set of fetched tiles into one encoded image.
#[async_trait]
pub trait Compositor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn composite(
        &self,
        plan: CompositePlan,
        tiles: Vec<FetchedTile>,
    ) -> Result<StitchedImage, StitchError>;
}

// =============================================================================
// Raster compositor
// =============================================================================

/// Full compositor: decode, crop, draw, encode.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterCompositor;

impl RasterCompositor {
    /// Check that the codecs this compositor needs work on this build.
    pub fn codecs_available() -> bool {
        let canvas = RgbImage::from_pixel(1, 1, BACKGROUND);
        JpegPageEncoder::default()
            .encode(&canvas)
            .ok()
            .and_then(|jpeg| decode_rgb(&jpeg).ok())
            .is_some()
    }
}

fn allocate_canvas(width: u32, height: u32) -> Result<RgbImage, StitchError> {
    let failed = || StitchError::CanvasAllocation { width, height };

    let len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(3))
        .ok_or_else(failed)?;

    let mut buffer: Vec<u8> = Vec::new();
    buffer.try_reserve_exact(len).map_err(|_| failed())?;
    buffer.resize(len, BACKGROUND.0[0]);

    RgbImage::from_raw(width, height, buffer).ok_or_else(failed)
}

/// Copy the cropped part of `tile` onto `canvas` at the tile's destination.
///
/// Returns false when nothing of the tile lands on the canvas.
fn draw_tile(canvas: &mut RgbImage, tile: &RgbImage, descriptor: &TileDescriptor) -> bool {
    let (canvas_w, canvas_h) = canvas.dimensions();
    let (tile_w, tile_h) = tile.dimensions();
    let dest = descriptor.dest;
    let (src_x, src_y) = (descriptor.crop.left, descriptor.crop.top);

    if dest.x >= canvas_w || dest.y >= canvas_h || src_x >= tile_w || src_y >= tile_h {
        return false;
    }

    let width = dest.width.min(tile_w - src_x).min(canvas_w - dest.x) as usize;
    let height = dest.height.min(tile_h - src_y).min(canvas_h - dest.y) as usize;
    if width == 0 || height == 0 {
        return false;
    }
    if width < dest.width as usize || height < dest.height as usize {
        debug!(
            tile = descriptor.index,
            expected_width = dest.width,
            expected_height = dest.height,
            width,
            height,
            "Tile covers only part of its destination"
        );
    }

    let src = tile.as_raw();
    let dst: &mut [u8] = canvas;
    let (canvas_w, tile_w) = (canvas_w as usize, tile_w as usize);
    let span = width * 3;
    for row in 0..height {
        let s = ((src_y as usize + row) * tile_w + src_x as usize) * 3;
        let d = ((dest.y as usize + row) * canvas_w + dest.x as usize) * 3;
        dst[d..d + span].copy_from_slice(&src[s..s + span]);
    }
    true
}

fn decode_batch(batch: Vec<FetchedTile>) -> Vec<(TileDescriptor, Option<RgbImage>)> {
    batch
        .into_iter()
        .map(|tile| match decode_rgb(&tile.data) {
            Ok(image) => (tile.descriptor, Some(image)),
            Err(e) => {
                warn!(
                    tile = tile.descriptor.index,
                    column = tile.descriptor.column,
                    row = tile.descriptor.row,
                    error = %e,
                    "Skipping undecodable tile"
                );
                (tile.descriptor, None)
            }
        })
        .collect()
}

#[async_trait]
impl Compositor for RasterCompositor {
    fn name(&self) -> &'static str {
        "raster"
    }

    async fn composite(
        &self,
        plan: CompositePlan,
        tiles: Vec<FetchedTile>,
    ) -> Result<StitchedImage, StitchError> {
        if plan.width == 0 || plan.height == 0 {
            return Err(StitchError::InvalidDimensions {
                width: plan.width,
                height: plan.height,
            });
        }
        if tiles.is_empty() {
            return Err(StitchError::NoTiles);
        }

        let total = tiles.len();
        let mut canvas = allocate_canvas(plan.width, plan.height)?;
        let mut drawn = 0;
        let batch_size = plan.batch_size.max(1);
        let mut remaining = tiles.into_iter();

        loop {
            let batch: Vec<FetchedTile> = remaining.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            let first = batch[0].descriptor.index;
            let count = batch.len();

            let decode = tokio::task::spawn_blocking(move || decode_batch(batch));
            match tokio::time::timeout(plan.batch_timeout, decode).await {
                Ok(Ok(decoded)) => {
                    for (descriptor, image) in decoded {
                        if let Some(image) = image {
                            if draw_tile(&mut canvas, &image, &descriptor) {
                                drawn += 1;
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(first_tile = first, count, error = %e, "Tile decode task failed, skipping batch");
                }
                Err(_) => {
                    warn!(
                        first_tile = first,
                        count,
                        timeout_s = plan.batch_timeout.as_secs(),
                        "Tile batch timed out, skipping"
                    );
                }
            }
            tokio::task::yield_now().await;
        }

        if drawn == 0 {
            return Err(StitchError::NoTilesDecoded { total });
        }

        let encoder = JpegPageEncoder::new(plan.quality);
        let data = tokio::task::spawn_blocking(move || encoder.encode(&canvas))
            .await
            .map_err(|e| StitchError::Encode(e.to_string()))??;

        debug!(
            width = plan.width,
            height = plan.height,
            drawn,
            skipped = total - drawn,
            bytes = data.len(),
            "Composited page"
        );

        Ok(StitchedImage {
            data,
            width: plan.width,
            height: plan.height,
            tiles_drawn: drawn,
            tiles_skipped: total - drawn,
            degraded: false,
            clamped: false,
        })
    }
}

// =============================================================================
// First-tile fallback
// =============================================================================

/// Degraded compositor returning the first tile's bytes unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstTileCompositor;

#[async_trait]
impl Compositor for FirstTileCompositor {
    fn name(&self) -> &'static str {
        "first-tile"
    }

    async fn composite(
        &self,
        _plan: CompositePlan,
        tiles: Vec<FetchedTile>,
    ) -> Result<StitchedImage, StitchError> {
        let total = tiles.len();
        let first = tiles
            .into_iter()
            .min_by_key(|t| t.descriptor.index)
            .ok_or(StitchError::NoTiles)?;

        let (width, height) = dimensions(&first.data)
            .unwrap_or((first.descriptor.dest.width, first.descriptor.dest.height));

        warn!(
            tile = first.descriptor.index,
            total, "Returning single tile instead of a composite"
        );

        Ok(StitchedImage {
            data: first.data,
            width,
            height,
            tiles_drawn: 1,
            tiles_skipped: total - 1,
            degraded: true,
            clamped: false,
        })
    }
}

/// Pick the compositor this runtime supports.
pub fn detect_compositor() -> Arc<dyn Compositor> {
    if RasterCompositor::codecs_available() {
        debug!("Using raster compositor");
        Arc::new(RasterCompositor)
    } else {
        warn!("Raster compositing unavailable, pages will be single tiles");
        Arc::new(FirstTileCompositor)
    }
}
