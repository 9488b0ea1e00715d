//! Deep Zoom descriptor parsing.
//!
//! Two encodings are accepted:
//!
//! ```xml
//! <Image xmlns="http://schemas.microsoft.com/deepzoom/2008"
//!        TileSize="256" Overlap="1" Format="jpg">
//!   <Size Width="4000" Height="3000"/>
//! </Image>
//! ```
//!
//! ```json
//! {"Image": {"TileSize": "256", "Overlap": "1", "Format": "jpg",
//!            "Size": {"Width": "4000", "Height": "3000"}}}
//! ```
//!
//! Element and attribute names are matched case-insensitively and numeric
//! values may be given as strings or numbers.

use serde::Serialize;
use serde_json::Value;

use crate::error::PyramidError;

pub const DEFAULT_TILE_SIZE: u32 = 256;
pub const DEFAULT_OVERLAP: u32 = 1;
pub const DEFAULT_FORMAT: &str = "jpg";

/// Parsed pyramid descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PyramidDescriptor {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub overlap: u32,
    pub format: String,
}

impl PyramidDescriptor {
    /// Parse an XML or JSON descriptor body.
    pub fn parse(body: &str) -> Result<Self, PyramidError> {
        let body = body.trim_start_matches('\u{feff}').trim();
        if body.starts_with('{') {
            Self::parse_json(body)
        } else {
            Self::parse_xml(body)
        }
    }

    pub fn parse_xml(body: &str) -> Result<Self, PyramidError> {
        let doc = roxmltree::Document::parse(body).map_err(|e| PyramidError::Xml(e.to_string()))?;

        let image = doc
            .descendants()
            .find(|n| n.is_element() && n.tag_name().name().eq_ignore_ascii_case("Image"))
            .ok_or(PyramidError::MissingElement("Image element"))?;
        let size = image
            .children()
            .find(|n| n.is_element() && n.tag_name().name().eq_ignore_ascii_case("Size"))
            .ok_or(PyramidError::MissingElement("Size element"))?;

        Self::from_fields(
            attr(size, "Width"),
            attr(size, "Height"),
            attr(image, "TileSize"),
            attr(image, "Overlap"),
            attr(image, "Format"),
        )
    }

    pub fn parse_json(body: &str) -> Result<Self, PyramidError> {
        let root: Value = serde_json::from_str(body).map_err(|e| PyramidError::Json(e.to_string()))?;
        let image = field(&root, "Image").ok_or(PyramidError::MissingElement("Image object"))?;
        let size = field(image, "Size").ok_or(PyramidError::MissingElement("Size object"))?;

        Self::from_fields(
            field(size, "Width").and_then(scalar),
            field(size, "Height").and_then(scalar),
            field(image, "TileSize").and_then(scalar),
            field(image, "Overlap").and_then(scalar),
            field(image, "Format").and_then(scalar),
        )
    }

    fn from_fields(
        width: Option<String>,
        height: Option<String>,
        tile_size: Option<String>,
        overlap: Option<String>,
        format: Option<String>,
    ) -> Result<Self, PyramidError> {
        let width = width.ok_or(PyramidError::MissingElement("Width attribute"))?;
        let height = height.ok_or(PyramidError::MissingElement("Height attribute"))?;

        let width = positive("Width", &width)?;
        let height = positive("Height", &height)?;
        let tile_size = match tile_size {
            Some(v) => positive("TileSize", &v)?,
            None => DEFAULT_TILE_SIZE,
        };
        let overlap = match overlap {
            Some(v) => v.parse::<u32>().map_err(|_| PyramidError::InvalidAttribute {
                name: "Overlap",
                value: v.clone(),
            })?,
            None => DEFAULT_OVERLAP,
        };
        let format = format
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| DEFAULT_FORMAT.to_string());

        Ok(PyramidDescriptor {
            width,
            height,
            tile_size,
            overlap,
            format,
        })
    }
}

fn positive(name: &'static str, value: &str) -> Result<u32, PyramidError> {
    match value.parse::<u32>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(PyramidError::InvalidAttribute {
            name,
            value: value.to_string(),
        }),
    }
}

/// Case-insensitive attribute lookup.
fn attr(node: roxmltree::Node<'_, '_>, name: &str) -> Option<String> {
    node.attributes()
        .find(|a| a.name().eq_ignore_ascii_case(name))
        .map(|a| a.value().trim().to_string())
}

/// Case-insensitive object lookup.
fn field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    value
        .as_object()?
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
