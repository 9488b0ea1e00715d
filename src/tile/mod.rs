//! Tile model and page stitching.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │  Container reader    │   │  Pyramid reader      │
//! └──────────┬───────────┘   └──────────┬───────────┘
//!            │  TileSourceDescriptor + TileDescriptors
//!            ▼                          ▼
//! ┌─────────────────────────────────────────────────┐
//! │              Fetch orchestrator                 │
//! └────────────────────────┬────────────────────────┘
//!                          │  FetchedTiles
//!                          ▼
//! ┌─────────────────────────────────────────────────┐
//! │                 TileStitcher                    │
//! │  ┌──────────────────┐  ┌─────────────────────┐  │
//! │  │   Compositor     │  │  JPEG encoder       │  │
//! │  │ (raster or       │  │                     │  │
//! │  │  first tile)     │  │                     │  │
//! │  └──────────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileSourceDescriptor`], [`TileDescriptor`], [`FetchedTile`]: the
//!   format-agnostic tile model
//! - [`TileStitcher`]: clamps the canvas and drives a [`Compositor`]
//! - [`RasterCompositor`] / [`FirstTileCompositor`]: full and degraded
//!   compositing
//! - [`JpegPageEncoder`]: encodes the finished canvas

mod compositor;
mod encoder;
mod stitcher;
mod types;

pub use compositor::{
    detect_compositor, CompositePlan, Compositor, FirstTileCompositor, RasterCompositor,
    StitchedImage, DEFAULT_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT,
};
pub use encoder::{
    clamp_quality, decode_rgb, dimensions, JpegPageEncoder, DEFAULT_JPEG_QUALITY,
    MAX_JPEG_QUALITY, MIN_JPEG_QUALITY,
};
pub use stitcher::{StitchSettings, TileStitcher, DEFAULT_MAX_CANVAS_EDGE};
pub use types::{
    Crop, FetchedTile, PixelRect, SourceFormat, TileDescriptor, TileLocation,
    TileSourceDescriptor,
};
