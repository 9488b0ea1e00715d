//! Format-agnostic tile descriptions shared by both readers, the fetch
//! orchestrator and the stitcher.

use bytes::Bytes;
use serde::Serialize;

/// Where a page's tiles come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Single downloaded file with an embedded tile table
    Container,
    /// Descriptor plus one URL per tile
    Pyramid,
}

/// Axis-aligned pixel rectangle in full-resolution image space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[inline]
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    #[inline]
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    #[inline]
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn intersects(&self, other: &PixelRect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }
}

/// Pixels to discard from each edge of a fetched tile before placing it.
///
/// Non-zero only for pyramid tiles that carry overlap with their neighbours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Crop {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// How to obtain a tile's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TileLocation {
    /// Byte range inside an already-downloaded container
    Range { offset: u64, length: u64 },
    /// Independent resource fetched over HTTP
    Url { url: String },
}

/// Metadata of a tile source: dimensions, tiling and codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileSourceDescriptor {
    pub format: SourceFormat,

    /// Container URL or descriptor URL
    pub location: String,

    /// Full-resolution size in pixels
    pub width: u32,
    pub height: u32,

    /// Nominal tile size, excluding overlap
    pub tile_width: u32,
    pub tile_height: u32,

    /// Pixels each tile extends into its neighbours (pyramids only)
    pub overlap: u32,

    /// Codec of individual tiles, e.g. "jpeg", "jpg" or "png"
    pub codec: String,

    /// Pyramid level the tiles were taken from, if any
    pub level: Option<u32>,
}

impl TileSourceDescriptor {
    pub fn columns(&self) -> u32 {
        self.width.div_ceil(self.tile_width.max(1))
    }

    pub fn rows(&self) -> u32 {
        self.height.div_ceil(self.tile_height.max(1))
    }

    pub fn tile_count(&self) -> usize {
        self.columns() as usize * self.rows() as usize
    }
}

/// One tile of a page.
///
/// `dest` is where the tile's pixels land on the full canvas *after* `crop`
/// has been applied. Across a page, destination rectangles never overlap and
/// together cover the image exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileDescriptor {
    /// Position in row-major order
    pub index: usize,
    pub column: u32,
    pub row: u32,
    pub location: TileLocation,
    pub dest: PixelRect,
    pub crop: Crop,
}

impl TileDescriptor {
    /// URL of the tile, if it is fetched independently.
    pub fn url(&self) -> Option<&str> {
        match &self.location {
            TileLocation::Url { url } => Some(url),
            TileLocation::Range { .. } => None,
        }
    }

    /// Pixel area covered by the tile as fetched, overlap included.
    pub fn source_rect(&self) -> PixelRect {
        PixelRect::new(
            self.dest.x.saturating_sub(self.crop.left),
            self.dest.y.saturating_sub(self.crop.top),
            self.crop.left + self.dest.width + self.crop.right,
            self.crop.top + self.dest.height + self.crop.bottom,
        )
    }
}

/// A tile whose encoded bytes have been retrieved.
#[derive(Debug, Clone)]
pub struct FetchedTile {
    pub descriptor: TileDescriptor,
    pub data: Bytes,
}
