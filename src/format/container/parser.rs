//! Container header and directory parsing.
//!
//! Everything here works on a fully downloaded buffer. All reads are bounds
//! checked and surface [`ContainerError`] instead of panicking on truncated or
//! hostile input.
//!
//! # Header layouts
//!
//! ## Classic (8 bytes)
//! ```text
//! Bytes 0-1: Byte order ("II" little-endian, "MM" big-endian)
//! Bytes 2-3: Version (42)
//! Bytes 4-7: Offset to first directory
//! ```
//!
//! ## 64-bit offsets (16 bytes)
//! ```text
//! Bytes 0-1:  Byte order
//! Bytes 2-3:  Version (43)
//! Bytes 4-5:  Offset byte size (must be 8)
//! Bytes 6-7:  Reserved
//! Bytes 8-15: Offset to first directory
//! ```
//!
//! # Directory layout
//!
//! A directory is an entry count (2 or 8 bytes), followed by fixed-size
//! entries (12 or 20 bytes), followed by the offset of the next directory
//! (4 or 8 bytes, zero terminates the chain).

use crate::error::ContainerError;

use super::tags::{FieldType, Tag};

// =============================================================================
// Constants
// =============================================================================

const BYTE_ORDER_LITTLE_ENDIAN: [u8; 2] = *b"II";
const BYTE_ORDER_BIG_ENDIAN: [u8; 2] = *b"MM";

const VERSION_CLASSIC: u16 = 42;
const VERSION_BIG: u16 = 43;

pub const CLASSIC_HEADER_SIZE: usize = 8;
pub const BIG_HEADER_SIZE: usize = 16;

const CLASSIC_ENTRY_SIZE: u64 = 12;
const BIG_ENTRY_SIZE: u64 = 20;

// =============================================================================
// ByteOrder
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    /// Read a u16 at `offset`, or `None` if the buffer is too short.
    pub fn u16_at(self, buf: &[u8], offset: usize) -> Option<u16> {
        let bytes: [u8; 2] = buf.get(offset..offset.checked_add(2)?)?.try_into().ok()?;
        Some(match self {
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
        })
    }

    pub fn u32_at(self, buf: &[u8], offset: usize) -> Option<u32> {
        let bytes: [u8; 4] = buf.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
        Some(match self {
            ByteOrder::LittleEndian => u32::from_le_bytes(bytes),
            ByteOrder::BigEndian => u32::from_be_bytes(bytes),
        })
    }

    pub fn u64_at(self, buf: &[u8], offset: usize) -> Option<u64> {
        let bytes: [u8; 8] = buf.get(offset..offset.checked_add(8)?)?.try_into().ok()?;
        Some(match self {
            ByteOrder::LittleEndian => u64::from_le_bytes(bytes),
            ByteOrder::BigEndian => u64::from_be_bytes(bytes),
        })
    }
}

// =============================================================================
// ContainerHeader
// =============================================================================

/// Parsed container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub byte_order: ByteOrder,

    /// 64-bit offsets, 20-byte entries, 8-byte inline values
    pub is_big: bool,

    pub first_ifd_offset: u64,
}

impl ContainerHeader {
    /// Parse the header at the start of `buf`.
    ///
    /// # Errors
    /// - `FileTooSmall` if the header is truncated
    /// - `InvalidMagic` if the byte-order marker is not II or MM
    /// - `InvalidVersion` if the version is not 42 or 43
    /// - `InvalidBigTiffOffsetSize` if a 64-bit header declares an offset size other than 8
    /// - `InvalidIfdOffset` if the first directory lies outside the buffer
    pub fn parse(buf: &[u8]) -> Result<Self, ContainerError> {
        if buf.len() < CLASSIC_HEADER_SIZE {
            return Err(ContainerError::FileTooSmall {
                required: CLASSIC_HEADER_SIZE as u64,
                actual: buf.len() as u64,
            });
        }

        let byte_order = match [buf[0], buf[1]] {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            other => return Err(ContainerError::InvalidMagic(u16::from_be_bytes(other))),
        };

        let version = byte_order.u16_at(buf, 2).unwrap_or_default();
        let (is_big, first_ifd_offset) = match version {
            VERSION_CLASSIC => {
                let offset = byte_order.u32_at(buf, 4).unwrap_or_default();
                (false, u64::from(offset))
            }
            VERSION_BIG => {
                if buf.len() < BIG_HEADER_SIZE {
                    return Err(ContainerError::FileTooSmall {
                        required: BIG_HEADER_SIZE as u64,
                        actual: buf.len() as u64,
                    });
                }
                let offset_size = byte_order.u16_at(buf, 4).unwrap_or_default();
                if offset_size != 8 {
                    return Err(ContainerError::InvalidBigTiffOffsetSize(offset_size));
                }
                (true, byte_order.u64_at(buf, 8).unwrap_or_default())
            }
            other => return Err(ContainerError::InvalidVersion(other)),
        };

        let header_size = if is_big { BIG_HEADER_SIZE } else { CLASSIC_HEADER_SIZE } as u64;
        if first_ifd_offset < header_size || first_ifd_offset >= buf.len() as u64 {
            return Err(ContainerError::InvalidIfdOffset(first_ifd_offset));
        }

        Ok(ContainerHeader {
            byte_order,
            is_big,
            first_ifd_offset,
        })
    }

    #[inline]
    pub fn entry_size(&self) -> u64 {
        if self.is_big {
            BIG_ENTRY_SIZE
        } else {
            CLASSIC_ENTRY_SIZE
        }
    }

    /// Width of the entry-count field at the start of a directory.
    #[inline]
    pub fn count_size(&self) -> u64 {
        if self.is_big {
            8
        } else {
            2
        }
    }

    /// Width of offsets and of the inline value field.
    #[inline]
    pub fn offset_size(&self) -> u64 {
        if self.is_big {
            8
        } else {
            4
        }
    }

    /// Read an offset-width unsigned value.
    fn offset_at(&self, buf: &[u8], offset: usize) -> Option<u64> {
        if self.is_big {
            self.byte_order.u64_at(buf, offset)
        } else {
            self.byte_order.u32_at(buf, offset).map(u64::from)
        }
    }
}

// =============================================================================
// IfdEntry
// =============================================================================

/// One directory entry.
///
/// Values small enough to fit in the entry are stored inline in
/// `value_offset_bytes`; larger values live elsewhere in the buffer and
/// `value_offset_bytes` holds their offset instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdEntry {
    pub tag_id: u16,

    /// `None` when the type code is not one the reader knows
    pub field_type: Option<FieldType>,

    pub field_type_raw: u16,

    pub count: u64,

    /// Raw value field (4 or 8 bytes), still in file byte order
    pub value_offset_bytes: Vec<u8>,

    pub is_inline: bool,
}

impl IfdEntry {
    fn parse(buf: &[u8], at: usize, header: &ContainerHeader) -> Option<Self> {
        let order = header.byte_order;
        let tag_id = order.u16_at(buf, at)?;
        let field_type_raw = order.u16_at(buf, at + 2)?;
        let field_type = FieldType::from_u16(field_type_raw);

        let (count, value_at) = if header.is_big {
            (order.u64_at(buf, at + 4)?, at + 12)
        } else {
            (u64::from(order.u32_at(buf, at + 4)?), at + 8)
        };

        let width = header.offset_size() as usize;
        let value_offset_bytes = buf.get(value_at..value_at + width)?.to_vec();
        let is_inline = field_type.is_some_and(|ft| ft.fits_inline(count, header.is_big));

        Some(IfdEntry {
            tag_id,
            field_type,
            field_type_raw,
            count,
            value_offset_bytes,
            is_inline,
        })
    }

    pub fn tag(&self) -> Option<Tag> {
        Tag::from_u16(self.tag_id)
    }

    /// Total size of the entry's values in bytes.
    pub fn value_byte_size(&self) -> Option<u64> {
        self.field_type?.element_size().checked_mul(self.count)
    }

    /// Offset of out-of-line values. Meaningless for inline entries.
    pub fn value_offset(&self, byte_order: ByteOrder) -> u64 {
        match self.value_offset_bytes.len() {
            8 => byte_order.u64_at(&self.value_offset_bytes, 0).unwrap_or_default(),
            _ => u64::from(byte_order.u32_at(&self.value_offset_bytes, 0).unwrap_or_default()),
        }
    }

    /// Single inline integer value (Short, Long or Long8 with count 1).
    pub fn inline_u64(&self, byte_order: ByteOrder) -> Option<u64> {
        if self.count != 1 || !self.is_inline {
            return None;
        }
        let bytes = &self.value_offset_bytes;
        match self.field_type? {
            FieldType::Short => byte_order.u16_at(bytes, 0).map(u64::from),
            FieldType::Long => byte_order.u32_at(bytes, 0).map(u64::from),
            FieldType::Long8 => byte_order.u64_at(bytes, 0),
            _ => None,
        }
    }

    pub fn inline_u32(&self, byte_order: ByteOrder) -> Option<u32> {
        self.inline_u64(byte_order).and_then(|v| u32::try_from(v).ok())
    }
}

// =============================================================================
// Ifd
// =============================================================================

/// A parsed directory: its entries plus the link to the next directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ifd {
    pub offset: u64,
    pub entries: Vec<IfdEntry>,
    pub next_ifd_offset: u64,
}

impl Ifd {
    /// Parse the directory that starts at `offset`.
    ///
    /// # Errors
    /// - `InvalidIfdOffset` if the entry count cannot be read at `offset`
    /// - `EntryCountMismatch` if the declared entries run past the end of the buffer
    pub fn parse(buf: &[u8], offset: u64, header: &ContainerHeader) -> Result<Self, ContainerError> {
        let start = usize::try_from(offset).map_err(|_| ContainerError::InvalidIfdOffset(offset))?;
        let count = if header.is_big {
            header.byte_order.u64_at(buf, start)
        } else {
            header.byte_order.u16_at(buf, start).map(u64::from)
        }
        .ok_or(ContainerError::InvalidIfdOffset(offset))?;

        let body_start = offset + header.count_size();
        let available = (buf.len() as u64).saturating_sub(body_start);
        let required = count
            .checked_mul(header.entry_size())
            .and_then(|n| n.checked_add(header.offset_size()));
        match required {
            Some(required) if required <= available => {}
            _ => {
                return Err(ContainerError::EntryCountMismatch {
                    offset,
                    count,
                    available,
                })
            }
        }

        let body_start = body_start as usize;
        let entry_size = header.entry_size() as usize;
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = body_start + i * entry_size;
            let entry = IfdEntry::parse(buf, at, header).ok_or(ContainerError::EntryCountMismatch {
                offset,
                count,
                available,
            })?;
            entries.push(entry);
        }

        let next_at = body_start + count as usize * entry_size;
        let next_ifd_offset = header.offset_at(buf, next_at).unwrap_or_default();

        Ok(Ifd {
            offset,
            entries,
            next_ifd_offset,
        })
    }

    pub fn get_entry_by_tag(&self, tag: Tag) -> Option<&IfdEntry> {
        self.entries.iter().find(|e| e.tag_id == tag.as_u16())
    }

    pub fn has(&self, tag: Tag) -> bool {
        self.get_entry_by_tag(tag).is_some()
    }

    /// Required single-valued integer tag.
    pub fn required_u32(&self, tag: Tag, byte_order: ByteOrder) -> Result<u32, ContainerError> {
        let entry = self
            .get_entry_by_tag(tag)
            .ok_or(ContainerError::MissingTag(tag.name()))?;
        entry
            .inline_u32(byte_order)
            .ok_or_else(|| ContainerError::InvalidTagValue {
                tag: tag.name(),
                message: format!(
                    "expected a single integer, got type {} with count {}",
                    entry.field_type_raw, entry.count
                ),
            })
    }

    pub fn optional_u32(&self, tag: Tag, byte_order: ByteOrder) -> Option<u32> {
        self.get_entry_by_tag(tag)?.inline_u32(byte_order)
    }
}
