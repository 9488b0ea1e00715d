//! Tile source readers.
//!
//! Two source shapes are supported:
//!
//! - **Containers**: one file holding every tile plus a table of their byte
//!   ranges (see [`container`]).
//! - **Pyramids**: a descriptor plus one URL per tile (see [`pyramid`]).
//!
//! Both produce the same [`TileSourceDescriptor`](crate::tile::TileSourceDescriptor)
//! and [`TileDescriptor`](crate::tile::TileDescriptor) values so that fetching
//! and stitching do not care where tiles came from.

pub mod container;
pub mod detect;
pub mod jpeg;
pub mod pyramid;

pub use detect::{detect_from_bytes, detect_from_url, is_container_header};
pub use jpeg::{is_abbreviated_stream, merge_jpeg_tables, prepare_tile_jpeg};
