//! JPEG stream helpers for container tiles.
//!
//! Containers may store tiles as *abbreviated* JPEG streams: each tile holds
//! only its frame and scan, while the quantization and Huffman tables live once
//! in the directory's JPEGTables entry. Such tiles must be spliced together
//! with the shared tables before any decoder will accept them.
//!
//! ```text
//! tables: SOI  DQT DHT ...  EOI
//! tile:   SOI  SOF SOS <scan> EOI
//! merged: SOI  DQT DHT ...  SOF SOS <scan> EOI
//! ```

use bytes::{Bytes, BytesMut};

const MARKER_PREFIX: u8 = 0xFF;
const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const DQT: u8 = 0xDB;
const DHT: u8 = 0xC4;

/// Walks the marker segments that precede the entropy-coded scan.
///
/// Yields marker codes (the byte after 0xFF) and stops after SOS, at EOI or at
/// the first malformed segment.
struct HeaderSegments<'a> {
    data: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> HeaderSegments<'a> {
    fn new(data: &'a [u8]) -> Option<Self> {
        if data.len() < 4 || data[0] != MARKER_PREFIX || data[1] != SOI {
            return None;
        }
        Some(Self {
            data,
            pos: 2,
            done: false,
        })
    }
}

impl Iterator for HeaderSegments<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.done {
            return None;
        }

        // Fill bytes (0xFF runs) are allowed before a marker
        while self.data.get(self.pos) == Some(&MARKER_PREFIX)
            && self.data.get(self.pos + 1) == Some(&MARKER_PREFIX)
        {
            self.pos += 1;
        }

        if self.data.get(self.pos) != Some(&MARKER_PREFIX) {
            self.done = true;
            return None;
        }
        let marker = *self.data.get(self.pos + 1)?;

        if marker == SOS || marker == EOI {
            self.done = true;
            return Some(marker);
        }

        let len_bytes = self.data.get(self.pos + 2..self.pos + 4)?;
        let length = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        if length < 2 {
            self.done = true;
            return None;
        }
        self.pos += 2 + length;
        Some(marker)
    }
}

/// True when the stream reaches its scan without defining any tables.
pub fn is_abbreviated_stream(data: &[u8]) -> bool {
    let Some(segments) = HeaderSegments::new(data) else {
        return false;
    };
    for marker in segments {
        match marker {
            DQT | DHT => return false,
            SOS => return true,
            _ => {}
        }
    }
    false
}

/// Splice shared tables in front of an abbreviated tile.
///
/// The tables' trailing EOI and the tile's leading SOI are dropped so the
/// result is a single well-formed stream.
pub fn merge_jpeg_tables(tables: &[u8], tile: &[u8]) -> Bytes {
    if tables.is_empty() {
        return Bytes::copy_from_slice(tile);
    }
    if tile.is_empty() {
        return Bytes::new();
    }

    let tables = tables
        .strip_suffix(&[MARKER_PREFIX, EOI])
        .unwrap_or(tables);
    let tile = tile.strip_prefix(&[MARKER_PREFIX, SOI]).unwrap_or(tile);

    let mut merged = BytesMut::with_capacity(tables.len() + tile.len());
    merged.extend_from_slice(tables);
    merged.extend_from_slice(tile);
    merged.freeze()
}

/// Make a container tile decodable on its own.
///
/// Complete streams are passed through untouched.
pub fn prepare_tile_jpeg(tables: Option<&[u8]>, tile: Bytes) -> Bytes {
    match tables {
        Some(tables) if is_abbreviated_stream(&tile) => merge_jpeg_tables(tables, &tile),
        _ => tile,
    }
}
