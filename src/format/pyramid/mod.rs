//! Deep Zoom pyramid support.
//!
//! # Key Concepts
//!
//! - **Descriptor**: a small XML or JSON document giving full-resolution size,
//!   tile size, overlap and tile format.
//!
//! - **Levels**: level 0 is one pixel, the maximum level is
//!   `ceil(log2(max(width, height)))` and holds the full-resolution image.
//!
//! - **Overlap**: every tile repeats `overlap` pixels of each neighbour it has.
//!   Tiles are placed at their nominal position after cropping that overlap.

mod descriptor;
mod geometry;
mod naming;
mod reader;

pub use descriptor::{PyramidDescriptor, DEFAULT_FORMAT, DEFAULT_OVERLAP, DEFAULT_TILE_SIZE};
pub use geometry::{level_dimensions, max_level, tile_grid};
pub use naming::{base_url, TileNaming, DEFAULT_TEMPLATE};
pub use reader::{PyramidLayout, PyramidReader, MAX_TILES_PER_LEVEL};
