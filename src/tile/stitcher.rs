//! Page stitching: canvas sizing and compositor fallback.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::StitchError;

use super::compositor::{
    detect_compositor, CompositePlan, Compositor, FirstTileCompositor, StitchedImage,
    DEFAULT_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT,
};
use super::encoder::{clamp_quality, DEFAULT_JPEG_QUALITY};
use super::types::FetchedTile;

/// Largest canvas edge allocated by default.
pub const DEFAULT_MAX_CANVAS_EDGE: u32 = 16384;

/// Settings for [`TileStitcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StitchSettings {
    /// Canvas edges are clamped to this many pixels
    pub max_canvas_edge: u32,
    pub jpeg_quality: u8,
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for StitchSettings {
    fn default() -> Self {
        Self {
            max_canvas_edge: DEFAULT_MAX_CANVAS_EDGE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }
}

/// Assembles a page from its fetched tiles.
///
/// Wraps a [`Compositor`] with canvas clamping and falls back to the first
/// tile when the canvas cannot be allocated.
#[derive(Clone)]
pub struct TileStitcher {
    compositor: Arc<dyn Compositor>,
    settings: StitchSettings,
}

impl std::fmt::Debug for TileStitcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileStitcher")
            .field("compositor", &self.compositor.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl TileStitcher {
    pub fn new(compositor: Arc<dyn Compositor>, settings: StitchSettings) -> Self {
        Self {
            compositor,
            settings,
        }
    }

    /// Stitcher using whichever compositor this runtime supports.
    pub fn detect(settings: StitchSettings) -> Self {
        Self::new(detect_compositor(), settings)
    }

    pub fn settings(&self) -> &StitchSettings {
        &self.settings
    }

    pub fn compositor_name(&self) -> &'static str {
        self.compositor.name()
    }

    /// Composite `tiles` into a `width` x `height` page.
    pub async fn stitch(
        &self,
        width: u32,
        height: u32,
        tiles: Vec<FetchedTile>,
    ) -> Result<StitchedImage, StitchError> {
        if width == 0 || height == 0 {
            return Err(StitchError::InvalidDimensions { width, height });
        }

        let max = self.settings.max_canvas_edge.max(1);
        let (canvas_w, canvas_h) = (width.min(max), height.min(max));
        let clamped = (canvas_w, canvas_h) != (width, height);
        if clamped {
            warn!(
                width,
                height,
                canvas_width = canvas_w,
                canvas_height = canvas_h,
                "Image exceeds maximum canvas size, output is cropped"
            );
        }

        let plan = CompositePlan {
            width: canvas_w,
            height: canvas_h,
            quality: clamp_quality(self.settings.jpeg_quality),
            batch_size: self.settings.batch_size,
            batch_timeout: self.settings.batch_timeout,
        };

        let first = tiles.iter().min_by_key(|t| t.descriptor.index).cloned();
        let total = tiles.len();

        let mut image = match self.compositor.composite(plan, tiles).await {
            Err(StitchError::CanvasAllocation { width, height }) => {
                warn!(width, height, "Canvas allocation failed, falling back to first tile");
                let mut image = FirstTileCompositor
                    .composite(plan, first.into_iter().collect())
                    .await?;
                image.tiles_skipped = total.saturating_sub(image.tiles_drawn);
                image
            }
            result => result?,
        };
        image.clamped = clamped;

        info!(
            width = image.width,
            height = image.height,
            drawn = image.tiles_drawn,
            skipped = image.tiles_skipped,
            degraded = image.degraded,
            compositor = self.compositor.name(),
            "Stitched page"
        );
        Ok(image)
    }
}
