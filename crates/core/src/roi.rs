//! Region-of-interest boxes drawn over detection events.
//!
//! Events arrive in clip time (milliseconds) and Hz. Each becomes a [`RoiBox`]
//! clamped to the recording, then a [`LevelRect`] in the cell space of every
//! zoom level, and finally one [`Overlay`] per tile the rectangle touches.

use serde::{Deserialize, Serialize};

use crate::pyramid::LevelGeometry;
use crate::stft::StftParams;

/// Band assumed for events that carry no frequency limits.
pub const DEFAULT_MIN_HZ: f64 = 1000.0;
pub const DEFAULT_MAX_HZ: f64 = 8000.0;

/// Height given to events whose lower limit is not below the upper one.
const FALLBACK_BAND_HZ: f64 = 1000.0;

/// A detected acoustic event. Unknown fields (labels, confidences) are
/// ignored when deserializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    #[serde(default)]
    pub start_ms: f64,
    #[serde(default)]
    pub end_ms: f64,
    #[serde(default)]
    pub f_min_hz: Option<f64>,
    #[serde(default)]
    pub f_max_hz: Option<f64>,
}

/// An event clamped to the recording.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoiBox {
    pub start_s: f64,
    pub end_s: f64,
    pub min_hz: f64,
    pub max_hz: f64,
}

impl RoiBox {
    /// `None` when the time range is empty or inverted, or lies entirely
    /// outside `0..duration_s`.
    pub fn from_event(event: &DetectionEvent, duration_s: f64) -> Option<Self> {
        let start = event.start_ms / 1000.0;
        let end = event.end_ms / 1000.0;
        if start.is_nan() || end.is_nan() || start >= end || start >= duration_s || end <= 0.0 {
            return None;
        }
        let start_s = start.max(0.0);
        let end_s = end.min(duration_s);

        let min_hz = event.f_min_hz.unwrap_or(DEFAULT_MIN_HZ);
        let mut max_hz = event.f_max_hz.unwrap_or(DEFAULT_MAX_HZ);
        if min_hz >= max_hz {
            max_hz = min_hz + FALLBACK_BAND_HZ;
        }
        if end_s <= start_s || min_hz.is_nan() || max_hz.is_nan() || max_hz <= min_hz {
            return None;
        }
        Some(Self { start_s, end_s, min_hz, max_hz })
    }
}

/// Boxes for every usable event, in input order.
pub fn roi_boxes(events: &[DetectionEvent], duration_s: f64) -> Vec<RoiBox> {
    let boxes: Vec<RoiBox> = events
        .iter()
        .enumerate()
        .filter_map(|(i, event)| {
            let roi = RoiBox::from_event(event, duration_s);
            if roi.is_none() {
                log::debug!(
                    "Skipping event {}: {} ms..{} ms in a {:.3}s clip",
                    i,
                    event.start_ms,
                    event.end_ms,
                    duration_s
                );
            }
            roi
        })
        .collect();
    if !events.is_empty() {
        log::info!("{} of {} events mapped to ROI boxes", boxes.len(), events.len());
    }
    boxes
}

/// Cells of one level covered by a box: columns `col0..col1`, rows
/// `row0..row1` counted up from the lowest frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelRect {
    pub col0: usize,
    pub col1: usize,
    pub row0: usize,
    pub row1: usize,
}

/// The part of a box inside one tile, in tile pixels with row 0 at the top.
/// A side flag is set only where the box really ends inside this tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overlay {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
    pub left: bool,
    pub top: bool,
    pub right: bool,
    pub bottom: bool,
}

impl LevelRect {
    /// `None` when the box misses the level's analysed band.
    pub fn locate(roi: &RoiBox, params: &StftParams, geometry: &LevelGeometry) -> Option<Self> {
        if geometry.width == 0 || geometry.height == 0 {
            return None;
        }
        let column_s = params.frame_time_s(geometry.time_factor);
        let col0 = ((roi.start_s / column_s).floor().max(0.0) as usize).min(geometry.width - 1);
        let col1 = ((roi.end_s / column_s).ceil() as usize).clamp(col0 + 1, geometry.width);

        let edges = geometry.row_edges_hz();
        let height = geometry.height;
        if roi.max_hz <= edges[0] || roi.min_hz >= edges[height] {
            return None;
        }
        // Row r spans edges[r]..edges[r + 1].
        let row0 = edges[1..].iter().position(|&e| e > roi.min_hz).unwrap_or(height - 1);
        let row1 = edges[..height]
            .iter()
            .rposition(|&e| e < roi.max_hz)
            .map_or(row0 + 1, |r| r + 1)
            .max(row0 + 1);

        Some(Self { col0, col1, row0, row1 })
    }

    /// Clip to the tile whose top-left pixel sits at level column `left`,
    /// image row `top`.
    pub fn overlay(&self, level_height: usize, left: usize, top: usize, width: usize, height: usize) -> Option<Overlay> {
        let box_top = level_height.saturating_sub(self.row1);
        let box_bottom = level_height.saturating_sub(self.row0);

        let x0 = self.col0.max(left);
        let x1 = self.col1.min(left + width);
        let y0 = box_top.max(top);
        let y1 = box_bottom.min(top + height);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some(Overlay {
            x0: x0 - left,
            y0: y0 - top,
            x1: x1 - left,
            y1: y1 - top,
            left: self.col0 >= left,
            top: box_top >= top,
            right: self.col1 <= left + width,
            bottom: box_bottom <= top + height,
        })
    }
}

/// Per-level rectangles for `boxes`, one list per geometry.
pub fn level_rects(boxes: &[RoiBox], params: &StftParams, geometries: &[LevelGeometry]) -> Vec<Vec<LevelRect>> {
    geometries
        .iter()
        .map(|g| boxes.iter().filter_map(|b| LevelRect::locate(b, params, g)).collect())
        .collect()
}
