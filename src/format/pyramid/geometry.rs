//! Deep Zoom level geometry.
//!
//! Level 0 is a single pixel; the maximum level is full resolution.
//! Each level below the maximum halves both dimensions, rounding up.

/// `ceil(log2(max(width, height)))`, computed without floating point.
pub fn max_level(width: u32, height: u32) -> u32 {
    let longest = width.max(height);
    if longest <= 1 {
        return 0;
    }
    u32::BITS - (longest - 1).leading_zeros()
}

/// Dimensions of `level`, or `None` if it lies above `max_level`.
pub fn level_dimensions(width: u32, height: u32, level: u32, max_level: u32) -> Option<(u32, u32)> {
    if level > max_level {
        return None;
    }
    let (mut w, mut h) = (width, height);
    for _ in level..max_level {
        w = w.div_ceil(2);
        h = h.div_ceil(2);
    }
    Some((w.max(1), h.max(1)))
}

/// Columns and rows of tiles needed to cover a level.
pub fn tile_grid(level_width: u32, level_height: u32, tile_size: u32) -> (u32, u32) {
    let tile_size = tile_size.max(1);
    (
        level_width.div_ceil(tile_size).max(1),
        level_height.div_ceil(tile_size).max(1),
    )
}
