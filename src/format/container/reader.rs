//! Tile table extraction from a downloaded container.
//!
//! The reader walks the directory chain, picks the highest-resolution tiled
//! image and turns its tile offset/byte-count tables into [`TileDescriptor`]s
//! addressed as byte ranges of the in-memory buffer.

use std::collections::HashSet;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::ContainerError;
use crate::format::jpeg::prepare_tile_jpeg;
use crate::tile::{
    Crop, FetchedTile, PixelRect, SourceFormat, TileDescriptor, TileLocation, TileSourceDescriptor,
};

use super::parser::{ContainerHeader, Ifd};
use super::tags::{Compression, Tag};
use super::values::ValueReader;

/// Upper bound on directories visited, guards against offset cycles.
const MAX_DIRECTORIES: usize = 64;

/// One tiled image found in the container.
#[derive(Debug, Clone)]
struct TiledImage {
    width: u32,
    height: u32,
    tile_width: u32,
    tile_height: u32,
    compression: Compression,
    offsets: Vec<u64>,
    byte_counts: Vec<u64>,
    jpeg_tables: Option<Bytes>,
}

impl TiledImage {
    fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    fn read(buf: &[u8], header: &ContainerHeader, ifd: &Ifd) -> Result<Self, ContainerError> {
        let order = header.byte_order;

        if !ifd.has(Tag::TileWidth) && ifd.has(Tag::StripOffsets) {
            return Err(ContainerError::StripOrganization);
        }

        let width = ifd.required_u32(Tag::ImageWidth, order)?;
        let height = ifd.required_u32(Tag::ImageLength, order)?;
        let tile_width = ifd.required_u32(Tag::TileWidth, order)?;
        let tile_height = ifd.required_u32(Tag::TileLength, order)?;

        if width == 0 || height == 0 {
            return Err(ContainerError::InvalidTagValue {
                tag: Tag::ImageWidth.name(),
                message: format!("image dimensions must be positive, got {}x{}", width, height),
            });
        }
        if tile_width == 0 || tile_height == 0 {
            return Err(ContainerError::InvalidTagValue {
                tag: Tag::TileWidth.name(),
                message: format!(
                    "tile dimensions must be positive, got {}x{}",
                    tile_width, tile_height
                ),
            });
        }

        let compression = Compression::from_u16(
            ifd.optional_u32(Tag::Compression, order)
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(1),
        );

        let values = ValueReader::new(buf, header);
        let offsets_entry = ifd
            .get_entry_by_tag(Tag::TileOffsets)
            .ok_or(ContainerError::MissingTag(Tag::TileOffsets.name()))?;
        let counts_entry = ifd
            .get_entry_by_tag(Tag::TileByteCounts)
            .ok_or(ContainerError::MissingTag(Tag::TileByteCounts.name()))?;
        let offsets = values.read_u64_array(Tag::TileOffsets, offsets_entry)?;
        let byte_counts = values.read_u64_array(Tag::TileByteCounts, counts_entry)?;

        if offsets.len() != byte_counts.len() {
            return Err(ContainerError::InvalidTagValue {
                tag: Tag::TileByteCounts.name(),
                message: format!(
                    "{} tile offsets but {} byte counts",
                    offsets.len(),
                    byte_counts.len()
                ),
            });
        }

        let jpeg_tables = match ifd.get_entry_by_tag(Tag::JpegTables) {
            Some(entry) => Some(Bytes::copy_from_slice(
                values.read_bytes(Tag::JpegTables, entry)?,
            )),
            None => None,
        };

        Ok(TiledImage {
            width,
            height,
            tile_width,
            tile_height,
            compression,
            offsets,
            byte_counts,
            jpeg_tables,
        })
    }
}

// =============================================================================
// ParsedContainer
// =============================================================================

/// Result of reading a container: its descriptor, tile table and backing bytes.
#[derive(Debug, Clone)]
pub struct ParsedContainer {
    pub descriptor: TileSourceDescriptor,
    pub tiles: Vec<TileDescriptor>,
    jpeg_tables: Option<Bytes>,
    data: Bytes,
}

impl ParsedContainer {
    pub fn jpeg_tables(&self) -> Option<&Bytes> {
        self.jpeg_tables.as_ref()
    }

    /// Decodable bytes of one tile, or `None` for an empty entry (offset or
    /// byte count 0, or a grid cell the tile table does not reach).
    ///
    /// Abbreviated JPEG tiles are merged with the shared tables.
    pub fn tile_bytes(&self, tile: &TileDescriptor) -> Option<Bytes> {
        let TileLocation::Range { offset, length } = tile.location else {
            return None;
        };
        if offset == 0 || length == 0 {
            return None;
        }
        let raw = self.data.slice(offset as usize..(offset + length) as usize);
        Some(prepare_tile_jpeg(self.jpeg_tables.as_deref(), raw))
    }

    /// Split the tile table into tiles with data and indices of empty entries.
    pub fn split_tiles(&self) -> (Vec<FetchedTile>, Vec<usize>) {
        let mut fetched = Vec::with_capacity(self.tiles.len());
        let mut empty = Vec::new();
        for tile in &self.tiles {
            match self.tile_bytes(tile) {
                Some(data) => fetched.push(FetchedTile {
                    descriptor: tile.clone(),
                    data,
                }),
                None => empty.push(tile.index),
            }
        }
        (fetched, empty)
    }
}

// =============================================================================
// ContainerReader
// =============================================================================

/// Largest tile grid accepted for one image.
pub const MAX_TILES_PER_IMAGE: u64 = 1 << 20;

/// Reads tiled containers held entirely in memory.
pub struct ContainerReader;

impl ContainerReader {
    /// Parse `data` (downloaded from `location`) into a tile table.
    ///
    /// # Errors
    /// Any header or directory error of the first directory, or of the chosen
    /// image when it fails validation. Later directories that fail to parse
    /// only end the walk.
    pub fn parse(location: &str, data: Bytes) -> Result<ParsedContainer, ContainerError> {
        let header = ContainerHeader::parse(&data)?;
        let image = Self::select_image(&data, &header)?;

        let descriptor = TileSourceDescriptor {
            format: SourceFormat::Container,
            location: location.to_string(),
            width: image.width,
            height: image.height,
            tile_width: image.tile_width,
            tile_height: image.tile_height,
            overlap: 0,
            codec: image.compression.codec().to_string(),
            level: None,
        };

        let tiles = Self::build_tiles(&descriptor, &image, data.len() as u64)?;

        debug!(
            location,
            width = descriptor.width,
            height = descriptor.height,
            tiles = tiles.len(),
            codec = %descriptor.codec,
            has_jpeg_tables = image.jpeg_tables.is_some(),
            "Parsed container"
        );

        let jpeg_tables = if image.compression.is_jpeg() {
            image.jpeg_tables
        } else {
            None
        };

        Ok(ParsedContainer {
            descriptor,
            tiles,
            jpeg_tables,
            data,
        })
    }

    /// Walk the directory chain and keep the largest tiled image.
    fn select_image(buf: &[u8], header: &ContainerHeader) -> Result<TiledImage, ContainerError> {
        let first = Ifd::parse(buf, header.first_ifd_offset, header)?;
        let mut first_error = None;
        let mut best: Option<TiledImage> = None;

        let mut visited = HashSet::new();
        let mut next = Some(first);
        while let Some(ifd) = next.take() {
            visited.insert(ifd.offset);

            match TiledImage::read(buf, header, &ifd) {
                Ok(image) => {
                    if best.as_ref().map_or(true, |b| image.area() > b.area()) {
                        best = Some(image);
                    }
                }
                Err(e) => {
                    debug!(offset = ifd.offset, error = %e, "Skipping directory");
                    first_error.get_or_insert(e);
                }
            }

            let offset = ifd.next_ifd_offset;
            if offset == 0 || visited.contains(&offset) || visited.len() >= MAX_DIRECTORIES {
                break;
            }
            match Ifd::parse(buf, offset, header) {
                Ok(ifd) => next = Some(ifd),
                Err(e) => warn!(offset, error = %e, "Stopping directory walk"),
            }
        }

        match (best, first_error) {
            (Some(image), _) => Ok(image),
            (None, Some(e)) => Err(e),
            (None, None) => Err(ContainerError::MissingTag(Tag::TileOffsets.name())),
        }
    }

    /// One descriptor per grid cell, in row-major order.
    ///
    /// Cells past the end of the tile table get an empty range.
    fn build_tiles(
        descriptor: &TileSourceDescriptor,
        image: &TiledImage,
        size: u64,
    ) -> Result<Vec<TileDescriptor>, ContainerError> {
        let columns = descriptor.columns();
        let rows = descriptor.rows();
        let grid = u64::from(columns) * u64::from(rows);
        if grid > MAX_TILES_PER_IMAGE {
            return Err(ContainerError::TooManyTiles {
                columns,
                rows,
                limit: MAX_TILES_PER_IMAGE,
            });
        }
        let grid = grid as usize;
        let entries = image.offsets.len().min(image.byte_counts.len());

        if entries < grid {
            warn!(
                entries,
                expected = grid,
                "Container tile table is shorter than the tile grid"
            );
        } else if entries > grid {
            debug!(entries, expected = grid, "Ignoring extra tile table entries");
        }

        let mut tiles = Vec::with_capacity(grid);
        for index in 0..grid {
            let (offset, length) = if index < entries {
                (image.offsets[index], image.byte_counts[index])
            } else {
                (0, 0)
            };

            if offset != 0 && length != 0 {
                match offset.checked_add(length) {
                    Some(end) if end <= size => {}
                    _ => {
                        return Err(ContainerError::TileOutOfBounds {
                            index,
                            offset,
                            length,
                            size,
                        })
                    }
                }
            }

            let column = index as u32 % columns;
            let row = index as u32 / columns;
            let x = column * descriptor.tile_width;
            let y = row * descriptor.tile_height;

            tiles.push(TileDescriptor {
                index,
                column,
                row,
                location: TileLocation::Range { offset, length },
                dest: PixelRect::new(
                    x,
                    y,
                    descriptor.tile_width.min(descriptor.width - x),
                    descriptor.tile_height.min(descriptor.height - y),
                ),
                crop: Crop::default(),
            });
        }

        Ok(tiles)
    }
}
