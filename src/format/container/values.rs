//! Reading entry values out of a downloaded container buffer.
//!
//! Small values live inline in the directory entry; anything larger is stored
//! at an offset elsewhere in the buffer. [`ValueReader`] hides the difference.

use crate::error::ContainerError;

use super::parser::{ContainerHeader, IfdEntry};
use super::tags::{FieldType, Tag};

/// Reads entry values from an in-memory container.
pub struct ValueReader<'a> {
    buf: &'a [u8],
    header: &'a ContainerHeader,
}

impl<'a> ValueReader<'a> {
    pub fn new(buf: &'a [u8], header: &'a ContainerHeader) -> Self {
        Self { buf, header }
    }

    /// Raw bytes of an entry's value, inline or out-of-line.
    pub fn read_bytes(&self, tag: Tag, entry: &'a IfdEntry) -> Result<&'a [u8], ContainerError> {
        let size = entry
            .value_byte_size()
            .ok_or(ContainerError::UnknownFieldType(entry.field_type_raw))?;

        if entry.is_inline {
            return Ok(&entry.value_offset_bytes[..size as usize]);
        }

        let offset = entry.value_offset(self.header.byte_order);
        let out_of_bounds = || ContainerError::ValueOutOfBounds {
            tag: tag.name(),
            offset,
            len: size,
            size: self.buf.len() as u64,
        };
        let end = offset.checked_add(size).ok_or_else(out_of_bounds)?;
        if end > self.buf.len() as u64 {
            return Err(out_of_bounds());
        }
        Ok(&self.buf[offset as usize..end as usize])
    }

    /// Integer array stored as Short, Long or Long8, widened to u64.
    pub fn read_u64_array(&self, tag: Tag, entry: &'a IfdEntry) -> Result<Vec<u64>, ContainerError> {
        let field_type = entry
            .field_type
            .ok_or(ContainerError::UnknownFieldType(entry.field_type_raw))?;
        if !field_type.is_integer() {
            return Err(ContainerError::InvalidTagValue {
                tag: tag.name(),
                message: format!("expected an integer array, got {:?}", field_type),
            });
        }

        let bytes = self.read_bytes(tag, entry)?;
        let order = self.header.byte_order;
        let step = field_type.element_size() as usize;

        let values = bytes
            .chunks_exact(step)
            .filter_map(|chunk| match field_type {
                FieldType::Short => order.u16_at(chunk, 0).map(u64::from),
                FieldType::Long => order.u32_at(chunk, 0).map(u64::from),
                _ => order.u64_at(chunk, 0),
            })
            .collect();
        Ok(values)
    }
}
