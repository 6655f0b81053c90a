//! Partition level matrices into fixed-size tiles.

use crate::pyramid::LevelMatrix;
use crate::roi::Overlay;

/// One tile's worth of normalized values, ready to colour-map.
#[derive(Debug, Clone, PartialEq)]
pub struct TileSpec {
    pub zoom: u32,
    /// Tile column in the level's tile grid.
    pub x: usize,
    /// Tile row in the level's tile grid; 0 is the highest frequencies.
    pub y: usize,
    pub width: usize,
    pub height: usize,
    /// Row-major pixel values in [0, 1], image row 0 at the top.
    pub pixels: Vec<f32>,
    /// Region-of-interest boxes to draw over the pixels.
    pub overlays: Vec<Overlay>,
}

impl TileSpec {
    pub fn pixel(&self, px: usize, py: usize) -> f32 {
        self.pixels[py * self.width + px]
    }
}

/// Number of tiles along each axis for a `width × height` level.
pub fn tile_grid(width: usize, height: usize, tile_width: usize, tile_height: usize) -> (usize, usize) {
    (width.div_ceil(tile_width), height.div_ceil(tile_height))
}

/// Cut a level (or a strip of one) into tiles, row-major.
///
/// `level.first_column` must be a multiple of `tile_width`; strips produced by
/// the pipeline always are. Frequency rows are read top-down from the highest
/// row so low frequencies end up at the bottom of the image. Edge tiles are
/// clipped to the level and zero-area tiles are never emitted.
pub fn slice_tiles(level: &LevelMatrix, tile_width: usize, tile_height: usize) -> Vec<TileSpec> {
    let width = level.width();
    let height = level.height();
    if width == 0 || height == 0 || tile_width == 0 || tile_height == 0 {
        return Vec::new();
    }

    let first_tile_x = level.first_column / tile_width;
    let (tiles_x, tiles_y) = tile_grid(width, height, tile_width, tile_height);
    let mut tiles = Vec::with_capacity(tiles_x * tiles_y);

    for ty in 0..tiles_y {
        let start_y = ty * tile_height;
        let h = (start_y + tile_height).min(height) - start_y;
        for tx in 0..tiles_x {
            let start_x = tx * tile_width;
            let w = (start_x + tile_width).min(width) - start_x;
            if w == 0 || h == 0 {
                continue;
            }

            let mut pixels = Vec::with_capacity(w * h);
            for y in 0..h {
                let row = height - 1 - (start_y + y);
                pixels.extend((0..w).map(|x| level.grid.get(start_x + x, row)));
            }

            tiles.push(TileSpec {
                zoom: level.zoom,
                x: first_tile_x + tx,
                y: ty,
                width: w,
                height: h,
                pixels,
                overlays: Vec::new(),
            });
        }
    }
    tiles
}
