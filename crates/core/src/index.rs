//! Metadata describing a generated pyramid.
//!
//! The index records everything a viewer needs to address tiles and map
//! pixels back to time and frequency: the resolved STFT parameters, the
//! per-level geometry and the storage key prefix. [`tile_bounds`] derives the
//! physical extent of any tile from the index alone.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ColormapName, ImageFormat, ZoomLevel};
use crate::normalize::DbStats;
use crate::pyramid::LevelGeometry;
use crate::stft::StftParams;
use crate::tiles::tile_grid;

/// Lifecycle of a generation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LevelSummary {
    pub zoom: u32,
    pub px_per_sec: f64,
    pub hz_per_px: f64,
    pub time_factor: usize,
    pub freq_factor: usize,
    /// Level matrix size in pixels.
    pub width: usize,
    pub height: usize,
    pub tiles_x: usize,
    pub tiles_y: usize,
    /// Tiles actually written for this level.
    pub tile_count: usize,
}

impl LevelSummary {
    pub fn zoom_level(&self) -> ZoomLevel {
        ZoomLevel {
            zoom: self.zoom,
            px_per_sec: self.px_per_sec,
            hz_per_px: self.hz_per_px,
        }
    }
}

/// Tile size and encoding shared by every level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Tiling {
    pub tile_width: usize,
    pub tile_height: usize,
    pub image_format: ImageFormat,
    pub colormap: ColormapName,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PyramidIndex {
    pub run_id: Uuid,
    pub key_prefix: String,
    pub status: RunStatus,
    pub duration_s: f64,
    pub stft: StftParams,
    pub min_db: f32,
    pub max_db: f32,
    /// Level mapped to 0 in every tile.
    pub floor_db: f64,
    #[serde(flatten)]
    pub tiling: Tiling,
    pub levels: Vec<LevelSummary>,
    pub total_tiles: usize,
    /// Detection events outlined on the tiles.
    #[serde(default)]
    pub roi_boxes: usize,
}

impl PyramidIndex {
    pub fn level(&self, zoom: u32) -> Option<&LevelSummary> {
        self.levels.iter().find(|l| l.zoom == zoom)
    }

    pub fn tile_key(&self, zoom: u32, x: usize, y: usize) -> String {
        tile_key(&self.key_prefix, zoom, x, y, self.tiling.image_format.extension())
    }

    /// Keys of every tile in the pyramid, coarsest level first, row-major.
    pub fn tile_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.total_tiles);
        for level in &self.levels {
            for y in 0..level.tiles_y {
                for x in 0..level.tiles_x {
                    keys.push(self.tile_key(level.zoom, x, y));
                }
            }
        }
        keys
    }
}

/// Storage key of one tile: `{prefix}/{zoom}/{x}/{y}.{ext}`.
pub fn tile_key(prefix: &str, zoom: u32, x: usize, y: usize, extension: &str) -> String {
    format!("{}/{}/{}/{}.{}", prefix.trim_end_matches('/'), zoom, x, y, extension)
}

/// Build the index of a completed run.
///
/// `tile_counts[i]` is the number of tiles written for `geometries[i]`.
pub fn assemble(
    geometries: &[LevelGeometry],
    tile_counts: &[usize],
    stft: &StftParams,
    stats: &DbStats,
    tiling: Tiling,
    key_prefix: &str,
    run_id: Uuid,
) -> PyramidIndex {
    let levels: Vec<LevelSummary> = geometries
        .iter()
        .zip(tile_counts)
        .map(|(g, &tile_count)| {
            let (tiles_x, tiles_y) = tile_grid(g.width, g.height, tiling.tile_width, tiling.tile_height);
            LevelSummary {
                zoom: g.zoom(),
                px_per_sec: g.level.px_per_sec,
                hz_per_px: g.level.hz_per_px,
                time_factor: g.time_factor,
                freq_factor: g.freq_factor,
                width: g.width,
                height: g.height,
                tiles_x,
                tiles_y,
                tile_count,
            }
        })
        .collect();
    let total_tiles = levels.iter().map(|l| l.tile_count).sum();

    PyramidIndex {
        run_id,
        key_prefix: key_prefix.to_string(),
        status: RunStatus::Completed,
        duration_s: stft.duration_s(),
        stft: stft.clone(),
        min_db: stats.min_db,
        max_db: stats.max_db,
        floor_db: stats.floor_db(stft.dynamic_range_db),
        tiling,
        levels,
        total_tiles,
        roi_boxes: 0,
    }
}

/// Physical extent of one tile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TileBounds {
    pub start_s: f64,
    pub end_s: f64,
    pub min_hz: f64,
    pub max_hz: f64,
    pub width_px: usize,
    pub height_px: usize,
}

/// Time and frequency covered by tile `(zoom, x, y)`, or `None` if the index
/// has no such tile.
///
/// Time runs from the start of the tile's first frame to the start of the
/// frame after its last one. Frequencies follow the level's row edges, so
/// mel levels report their real band. Tile row 0 is the top of the spectrum.
pub fn tile_bounds(index: &PyramidIndex, zoom: u32, x: usize, y: usize) -> Option<TileBounds> {
    let summary = index.level(zoom)?;
    if x >= summary.tiles_x || y >= summary.tiles_y {
        return None;
    }
    let geometry = LevelGeometry::new(&index.stft, &summary.zoom_level()).ok()?;
    let (tw, th) = (index.tiling.tile_width, index.tiling.tile_height);

    let col_start = x * tw;
    let col_end = ((x + 1) * tw).min(geometry.width);
    let first_frame = geometry.frame_range(col_start).start;
    let end_frame = geometry.frame_range(col_end - 1).end;

    // Image rows count down from the top; level rows count up from the bottom.
    let top_row = geometry.height - y * th;
    let bottom_row = geometry.height.saturating_sub((y + 1) * th);
    let edges = geometry.row_edges_hz();

    Some(TileBounds {
        start_s: index.stft.frame_time_s(first_frame),
        end_s: index.stft.frame_time_s(end_frame),
        min_hz: edges[bottom_row],
        max_hz: edges[top_row],
        width_px: col_end - col_start,
        height_px: top_row - bottom_row,
    })
}
