//! Directory entry vocabulary: field types, tag identifiers and compression codes.
//!
//! Only the tags needed to locate tiles inside a container are named here.
//! Everything else in a directory is carried through as a raw tag number and
//! ignored by the reader.

// =============================================================================
// Field Types
// =============================================================================

/// Encoding of the values stored in a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FieldType {
    Byte = 1,
    Ascii = 2,
    Short = 3,
    Long = 4,
    Undefined = 7,
    /// 64-bit unsigned integer, only found in the 64-bit variant
    Long8 = 16,
}

impl FieldType {
    /// Value field width of a classic directory entry.
    pub const INLINE_THRESHOLD_CLASSIC: u64 = 4;

    /// Value field width of a 64-bit directory entry.
    pub const INLINE_THRESHOLD_BIG: u64 = 8;

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(FieldType::Byte),
            2 => Some(FieldType::Ascii),
            3 => Some(FieldType::Short),
            4 => Some(FieldType::Long),
            7 => Some(FieldType::Undefined),
            16 => Some(FieldType::Long8),
            _ => None,
        }
    }

    #[inline]
    pub const fn element_size(self) -> u64 {
        match self {
            FieldType::Byte | FieldType::Ascii | FieldType::Undefined => 1,
            FieldType::Short => 2,
            FieldType::Long => 4,
            FieldType::Long8 => 8,
        }
    }

    /// Whether `count` values of this type are stored directly in the entry's
    /// value field rather than at an offset.
    #[inline]
    pub fn fits_inline(self, count: u64, is_big: bool) -> bool {
        let threshold = if is_big {
            Self::INLINE_THRESHOLD_BIG
        } else {
            Self::INLINE_THRESHOLD_CLASSIC
        };
        self.element_size()
            .checked_mul(count)
            .is_some_and(|total| total <= threshold)
    }

    /// True for the unsigned integer types used by dimension and offset tags.
    #[inline]
    pub const fn is_integer(self) -> bool {
        matches!(self, FieldType::Short | FieldType::Long | FieldType::Long8)
    }
}

// =============================================================================
// Tags
// =============================================================================

/// Tag identifiers the container reader understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Tag {
    ImageWidth = 256,
    ImageLength = 257,
    Compression = 259,
    StripOffsets = 273,
    StripByteCounts = 279,
    TileWidth = 322,
    TileLength = 323,
    TileOffsets = 324,
    TileByteCounts = 325,
    /// Shared quantization/Huffman tables for abbreviated JPEG tiles
    JpegTables = 347,
}

impl Tag {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            256 => Some(Tag::ImageWidth),
            257 => Some(Tag::ImageLength),
            259 => Some(Tag::Compression),
            273 => Some(Tag::StripOffsets),
            279 => Some(Tag::StripByteCounts),
            322 => Some(Tag::TileWidth),
            323 => Some(Tag::TileLength),
            324 => Some(Tag::TileOffsets),
            325 => Some(Tag::TileByteCounts),
            347 => Some(Tag::JpegTables),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Human-readable name used in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Tag::ImageWidth => "ImageWidth",
            Tag::ImageLength => "ImageLength",
            Tag::Compression => "Compression",
            Tag::StripOffsets => "StripOffsets",
            Tag::StripByteCounts => "StripByteCounts",
            Tag::TileWidth => "TileWidth",
            Tag::TileLength => "TileLength",
            Tag::TileOffsets => "TileOffsets",
            Tag::TileByteCounts => "TileByteCounts",
            Tag::JpegTables => "JPEGTables",
        }
    }
}

// =============================================================================
// Compression
// =============================================================================

/// Compression codes a tile payload may be stored with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lzw,
    OldJpeg,
    Jpeg,
    Deflate,
    Jpeg2000,
    Other(u16),
}

impl Compression {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Compression::None,
            5 => Compression::Lzw,
            6 => Compression::OldJpeg,
            7 => Compression::Jpeg,
            8 | 32946 => Compression::Deflate,
            33003 | 33005 | 34712 => Compression::Jpeg2000,
            other => Compression::Other(other),
        }
    }

    /// Codec name reported in the tile source descriptor.
    pub fn codec(self) -> &'static str {
        match self {
            Compression::None => "raw",
            Compression::Lzw => "lzw",
            Compression::OldJpeg | Compression::Jpeg => "jpeg",
            Compression::Deflate => "deflate",
            Compression::Jpeg2000 => "jpeg2000",
            Compression::Other(_) => "unknown",
        }
    }

    #[inline]
    pub fn is_jpeg(self) -> bool {
        matches!(self, Compression::Jpeg | Compression::OldJpeg)
    }
}
