//! Tile URL construction.
//!
//! The standard layout is `{base}_files/{level}/{col}_{row}.{format}` where
//! `base` is the descriptor URL without its `.dzi`/`.xml`/`.json` suffix.
//! Sources with a non-standard layout can supply their own template using the
//! same placeholders.

use crate::error::PyramidError;

pub const DEFAULT_TEMPLATE: &str = "{base}_files/{level}/{col}_{row}.{format}";

const DESCRIPTOR_SUFFIXES: [&str; 3] = [".dzi", ".xml", ".json"];

/// Strip the descriptor suffix (case-insensitive) from a descriptor URL.
///
/// Any query string is dropped.
pub fn base_url(descriptor_url: &str) -> &str {
    let path = descriptor_url
        .split_once('?')
        .map_or(descriptor_url, |(path, _)| path);
    for suffix in DESCRIPTOR_SUFFIXES {
        let split = path.len().saturating_sub(suffix.len());
        if let (Some(head), Some(tail)) = (path.get(..split), path.get(split..)) {
            if tail.eq_ignore_ascii_case(suffix) {
                return head;
            }
        }
    }
    path
}

/// Builds tile URLs from a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileNaming {
    template: String,
}

impl Default for TileNaming {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl TileNaming {
    /// Custom template; must reference `{level}`, `{col}` and `{row}`.
    pub fn with_template(template: impl Into<String>) -> Result<Self, PyramidError> {
        let template = template.into();
        let complete = ["{level}", "{col}", "{row}"]
            .iter()
            .all(|p| template.contains(p));
        if !complete {
            return Err(PyramidError::InvalidTemplate(template));
        }
        Ok(Self { template })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn tile_url(&self, base: &str, level: u32, col: u32, row: u32, format: &str) -> String {
        self.template
            .replace("{base}", base)
            .replace("{level}", &level.to_string())
            .replace("{col}", &col.to_string())
            .replace("{row}", &row.to_string())
            .replace("{format}", format)
    }
}
