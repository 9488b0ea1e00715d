//! Reader for single-file tiled containers (TIFF-family, including ZIF).
//!
//! # Key Concepts
//!
//! - **Byte order**: the header declares II (little-endian) or MM (big-endian);
//!   every multi-byte value afterwards honours it.
//!
//! - **Classic vs 64-bit offsets**: version 42 uses 32-bit offsets and 12-byte
//!   entries, version 43 uses 64-bit offsets and 20-byte entries.
//!
//! - **Directories**: each image in the file is described by a directory. The
//!   reader picks the largest tiled one, which is the full-resolution page.
//!
//! - **Inline vs offset values**: small values sit inside the entry, larger
//!   arrays (tile offsets, byte counts, JPEG tables) live at an offset.

mod parser;
mod reader;
mod tags;
mod values;

pub use parser::{ByteOrder, ContainerHeader, Ifd, IfdEntry, BIG_HEADER_SIZE, CLASSIC_HEADER_SIZE};
pub use reader::{ContainerReader, ParsedContainer, MAX_TILES_PER_IMAGE};
pub use tags::{Compression, FieldType, Tag};
pub use values::ValueReader;
