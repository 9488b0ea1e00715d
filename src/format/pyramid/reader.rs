//! Deep Zoom pyramid reader: descriptor retrieval and tile enumeration.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PyramidError;
use crate::io::{destination_of, HttpSource};
use crate::resilience::ResilienceContext;
use crate::tile::{
    Crop, PixelRect, SourceFormat, TileDescriptor, TileLocation, TileSourceDescriptor,
};

use super::descriptor::PyramidDescriptor;
use super::geometry::{level_dimensions, max_level, tile_grid};
use super::naming::{base_url, TileNaming};

/// Largest tile grid accepted for one level.
pub const MAX_TILES_PER_LEVEL: u64 = 1 << 20;

/// Tiles of one pyramid level, ready for fetching.
#[derive(Debug, Clone)]
pub struct PyramidLayout {
    pub descriptor: TileSourceDescriptor,
    pub pyramid: PyramidDescriptor,
    pub max_level: u32,
    pub tiles: Vec<TileDescriptor>,
}

/// Reads Deep Zoom pyramids.
#[derive(Debug, Clone, Default)]
pub struct PyramidReader {
    naming: TileNaming,
}

impl PyramidReader {
    pub fn new(naming: TileNaming) -> Self {
        Self { naming }
    }

    /// Download and parse a descriptor.
    ///
    /// The request passes the destination's circuit breaker but is not
    /// retried here; callers decide whether to retry the whole page.
    pub async fn fetch_descriptor(
        http: &dyn HttpSource,
        resilience: &ResilienceContext,
        url: &str,
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<PyramidDescriptor, PyramidError> {
        let destination = destination_of(url)?;
        let body = resilience
            .call_once(&destination, cancel, || http.get(url, headers))
            .await?;
        Self::parse_descriptor(url, &body)
    }

    /// Parse an already-downloaded descriptor body.
    pub fn parse_descriptor(url: &str, body: &[u8]) -> Result<PyramidDescriptor, PyramidError> {
        let text = String::from_utf8_lossy(body);
        let descriptor = PyramidDescriptor::parse(&text)?;
        debug!(
            url,
            width = descriptor.width,
            height = descriptor.height,
            tile_size = descriptor.tile_size,
            overlap = descriptor.overlap,
            "Parsed pyramid descriptor"
        );
        Ok(descriptor)
    }

    /// Enumerate the tiles of `level`, or of the maximum level when `None`.
    ///
    /// Destination rectangles are nominal (overlap excluded); the overlap a
    /// tile carries on each side is recorded as crop.
    pub fn layout(
        &self,
        descriptor_url: &str,
        pyramid: &PyramidDescriptor,
        level: Option<u32>,
    ) -> Result<PyramidLayout, PyramidError> {
        let max = max_level(pyramid.width, pyramid.height);
        let level = level.unwrap_or(max);
        let (width, height) = level_dimensions(pyramid.width, pyramid.height, level, max)
            .ok_or(PyramidError::LevelOutOfRange { level, max })?;

        let tile_size = pyramid.tile_size;
        let overlap = pyramid.overlap;
        let (columns, rows) = tile_grid(width, height, tile_size);
        let base = base_url(descriptor_url);

        let count = u64::from(columns) * u64::from(rows);
        if count > MAX_TILES_PER_LEVEL {
            return Err(PyramidError::TooManyTiles {
                columns,
                rows,
                limit: MAX_TILES_PER_LEVEL,
            });
        }

        let mut tiles = Vec::with_capacity(count as usize);
        for row in 0..rows {
            for col in 0..columns {
                let x = col * tile_size;
                let y = row * tile_size;
                let url = self.naming.tile_url(base, level, col, row, &pyramid.format);

                tiles.push(TileDescriptor {
                    index: tiles.len(),
                    column: col,
                    row,
                    location: TileLocation::Url { url },
                    dest: PixelRect::new(x, y, tile_size.min(width - x), tile_size.min(height - y)),
                    crop: Crop {
                        left: if col > 0 { overlap } else { 0 },
                        top: if row > 0 { overlap } else { 0 },
                        right: if col + 1 < columns { overlap } else { 0 },
                        bottom: if row + 1 < rows { overlap } else { 0 },
                    },
                });
            }
        }

        debug!(
            url = descriptor_url,
            level,
            max_level = max,
            columns,
            rows,
            "Enumerated pyramid tiles"
        );

        Ok(PyramidLayout {
            descriptor: TileSourceDescriptor {
                format: SourceFormat::Pyramid,
                location: descriptor_url.to_string(),
                width,
                height,
                tile_width: tile_size,
                tile_height: tile_size,
                overlap,
                codec: pyramid.format.clone(),
                level: Some(level),
            },
            pyramid: pyramid.clone(),
            max_level: max,
            tiles,
        })
    }
}
