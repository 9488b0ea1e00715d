//! Source format detection.
//!
//! A page URL is classified by its extension first. When the extension says
//! nothing, the downloaded bytes are sniffed: a container starts with a
//! byte-order marker and version, a pyramid descriptor is XML or JSON
//! mentioning an `Image` element.

use crate::tile::SourceFormat;

use super::container::CLASSIC_HEADER_SIZE;

const CONTAINER_EXTENSIONS: [&str; 4] = ["zif", "tif", "tiff", "btf"];
const PYRAMID_EXTENSIONS: [&str; 3] = ["dzi", "xml", "json"];

/// Classify by the URL path's extension.
pub fn detect_from_url(url: &str) -> Option<SourceFormat> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = file.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();

    if CONTAINER_EXTENSIONS.contains(&ext.as_str()) {
        Some(SourceFormat::Container)
    } else if PYRAMID_EXTENSIONS.contains(&ext.as_str()) {
        Some(SourceFormat::Pyramid)
    } else {
        None
    }
}

/// Classify downloaded bytes.
pub fn detect_from_bytes(bytes: &[u8]) -> Option<SourceFormat> {
    if is_container_header(bytes) {
        return Some(SourceFormat::Container);
    }

    let head = &bytes[..bytes.len().min(1024)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    let looks_structured = text.starts_with('<') || text.starts_with('{');
    if looks_structured && text.to_ascii_lowercase().contains("image") {
        Some(SourceFormat::Pyramid)
    } else {
        None
    }
}

/// Quick check for a container byte-order marker and version.
pub fn is_container_header(bytes: &[u8]) -> bool {
    if bytes.len() < CLASSIC_HEADER_SIZE {
        return false;
    }
    let version = match &bytes[..2] {
        b"II" => u16::from_le_bytes([bytes[2], bytes[3]]),
        b"MM" => u16::from_be_bytes([bytes[2], bytes[3]]),
        _ => return false,
    };
    version == 42 || version == 43
}
