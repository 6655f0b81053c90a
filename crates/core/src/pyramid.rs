//! Per-zoom-level box downsampling of the normalized spectrogram.
//!
//! Each level reduces groups of `time_factor` frames and a band of FFT bins
//! into one cell, averaging only the cells that exist (partial groups at the
//! edges are not biased by padding). Rows stay in ascending frequency order;
//! flipping for display happens when tiles are sliced.
//!
//! The same [`LevelAccumulator`] serves both the whole-matrix path
//! ([`build_levels`]) and the streaming pipeline, which feeds frames batch by
//! batch and receives finished time strips one tile column wide.

use std::ops::Range;

use rayon::prelude::*;

use crate::config::{FrequencyScale, ZoomLevel};
use crate::error::{PyramidError, Result};
use crate::grid::Grid;
use crate::stft::StftParams;

/// Slack for float rounding before taking a floor or ceiling.
const EPS: f64 = 1e-9;

pub fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

pub fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// FFT bins inside the analysed band `[min_freq_hz, max_freq_hz)`.
pub fn analysed_bins(params: &StftParams) -> Result<Range<usize>> {
    let bin_hz = params.bin_hz();
    let lo = ((params.min_freq_hz / bin_hz) - EPS).ceil().max(0.0) as usize;
    let hi = (((params.max_freq_hz / bin_hz) - EPS).ceil() as usize).min(params.n_freq_bins);
    if lo >= hi {
        return Err(PyramidError::InvalidInput(format!(
            "analysed band {}..{} Hz contains no FFT bins of width {} Hz",
            params.min_freq_hz, params.max_freq_hz, bin_hz
        )));
    }
    Ok(lo..hi)
}

/// Shape of one zoom level, derivable from the STFT parameters alone.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelGeometry {
    pub level: ZoomLevel,
    pub time_factor: usize,
    pub freq_factor: usize,
    pub n_frames: usize,
    /// Columns of the level matrix.
    pub width: usize,
    /// Rows of the level matrix.
    pub height: usize,
    /// Absolute FFT bin range averaged into each row, lowest row first.
    bands: Vec<Range<usize>>,
    /// Row `j` spans `edges_hz[j]..edges_hz[j + 1]`.
    edges_hz: Vec<f64>,
}

impl LevelGeometry {
    pub fn new(params: &StftParams, level: &ZoomLevel) -> Result<Self> {
        let bins = analysed_bins(params)?;
        let n_bins = bins.len();
        let bandwidth = params.max_freq_hz - params.min_freq_hz;

        let time_factor = ((1000.0 / (level.px_per_sec * params.frame_duration_ms())) + EPS)
            .floor()
            .max(1.0) as usize;
        let freq_factor = ((level.hz_per_px * n_bins as f64 / bandwidth) + EPS)
            .floor()
            .max(1.0) as usize;

        let width = params.n_frames.div_ceil(time_factor);
        let height = n_bins.div_ceil(freq_factor);

        let (bands, edges_hz) = match params.frequency_scale {
            FrequencyScale::Linear => linear_bands(&bins, freq_factor, height, params.bin_hz()),
            FrequencyScale::Mel => mel_bands(&bins, height, params),
        };

        Ok(Self {
            level: *level,
            time_factor,
            freq_factor,
            n_frames: params.n_frames,
            width,
            height,
            bands,
            edges_hz,
        })
    }

    pub fn zoom(&self) -> u32 {
        self.level.zoom
    }

    pub fn bands(&self) -> &[Range<usize>] {
        &self.bands
    }

    pub fn row_edges_hz(&self) -> &[f64] {
        &self.edges_hz
    }

    /// Source frames averaged into level column `column`.
    pub fn frame_range(&self, column: usize) -> Range<usize> {
        let start = (column * self.time_factor).min(self.n_frames);
        let end = ((column + 1) * self.time_factor).min(self.n_frames);
        start..end
    }
}

fn linear_bands(bins: &Range<usize>, factor: usize, height: usize, bin_hz: f64) -> (Vec<Range<usize>>, Vec<f64>) {
    let bands = (0..height)
        .map(|j| {
            let lo = bins.start + j * factor;
            lo..(lo + factor).min(bins.end)
        })
        .collect();
    let edges = (0..=height)
        .map(|j| (bins.start + j * factor).min(bins.end) as f64 * bin_hz)
        .collect();
    (bands, edges)
}

fn mel_bands(bins: &Range<usize>, height: usize, params: &StftParams) -> (Vec<Range<usize>>, Vec<f64>) {
    let bin_hz = params.bin_hz();
    let mel_lo = hz_to_mel(params.min_freq_hz);
    let mel_hi = hz_to_mel(params.max_freq_hz);
    let step = (mel_hi - mel_lo) / height as f64;

    let mut edges: Vec<f64> = (0..=height).map(|j| mel_to_hz(mel_lo + j as f64 * step)).collect();
    edges[0] = params.min_freq_hz;
    edges[height] = params.max_freq_hz;

    let bands = edges
        .windows(2)
        .map(|pair| {
            let lo = ((pair[0] / bin_hz + EPS).floor() as usize).clamp(bins.start, bins.end - 1);
            let hi = ((pair[1] / bin_hz - EPS).ceil() as usize).clamp(lo + 1, bins.end);
            lo..hi
        })
        .collect();
    (bands, edges)
}

/// A downsampled level, or a time strip of one.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelMatrix {
    pub zoom: u32,
    /// Level column of `grid` column 0.
    pub first_column: usize,
    pub grid: Grid,
}

impl LevelMatrix {
    pub fn width(&self) -> usize {
        self.grid.columns()
    }

    pub fn height(&self) -> usize {
        self.grid.rows()
    }
}

/// Builds one level from frames fed in order, emitting strips of
/// `strip_width` columns as soon as their last frame arrives.
#[derive(Debug)]
pub struct LevelAccumulator {
    geometry: LevelGeometry,
    strip_width: usize,
    strip_start: usize,
    sums: Vec<f64>,
    counts: Vec<u32>,
    next_frame: usize,
}

impl LevelAccumulator {
    pub fn new(geometry: LevelGeometry, strip_width: usize) -> Self {
        let strip_width = strip_width.clamp(1, geometry.width.max(1));
        let cells = strip_width * geometry.height;
        Self {
            sums: vec![0.0; cells],
            counts: vec![0; strip_width],
            geometry,
            strip_width,
            strip_start: 0,
            next_frame: 0,
        }
    }

    pub fn geometry(&self) -> &LevelGeometry {
        &self.geometry
    }

    /// Level cells held while a strip is being filled.
    pub fn resident_cells(&self) -> usize {
        self.sums.len()
    }

    /// True once every frame of the recording has been consumed.
    pub fn is_complete(&self) -> bool {
        self.next_frame >= self.geometry.n_frames
    }

    /// Feed consecutive frames starting at `first_frame`; `cells` holds
    /// `rows` values per frame. Returns every strip completed by this batch.
    pub fn push_frames(&mut self, first_frame: usize, cells: &[f32], rows: usize) -> Result<Vec<LevelMatrix>> {
        if first_frame != self.next_frame {
            return Err(PyramidError::Internal(format!(
                "zoom {} expected frame {}, got {}",
                self.geometry.zoom(),
                self.next_frame,
                first_frame
            )));
        }
        let mut finished = Vec::new();
        for (offset, column) in cells.chunks_exact(rows).enumerate() {
            if let Some(strip) = self.push_frame(first_frame + offset, column)? {
                finished.push(strip);
            }
        }
        Ok(finished)
    }

    fn push_frame(&mut self, frame: usize, column: &[f32]) -> Result<Option<LevelMatrix>> {
        let height = self.geometry.height;
        let local = frame / self.geometry.time_factor - self.strip_start;

        let sums = &mut self.sums[local * height..(local + 1) * height];
        for (sum, band) in sums.iter_mut().zip(&self.geometry.bands) {
            let cells = &column[band.clone()];
            let total: f64 = cells.iter().map(|&v| v as f64).sum();
            *sum += total / cells.len() as f64;
        }
        self.counts[local] += 1;
        self.next_frame = frame + 1;

        let strip_end = (self.strip_start + self.strip_width).min(self.geometry.width);
        let last_frame = (strip_end * self.geometry.time_factor).min(self.geometry.n_frames) - 1;
        if frame == last_frame {
            self.take_strip(strip_end).map(Some)
        } else {
            Ok(None)
        }
    }

    fn take_strip(&mut self, strip_end: usize) -> Result<LevelMatrix> {
        let height = self.geometry.height;
        let columns = strip_end - self.strip_start;
        let mut data = Vec::with_capacity(columns * height);
        for c in 0..columns {
            let count = self.counts[c].max(1) as f64;
            data.extend(self.sums[c * height..(c + 1) * height].iter().map(|&s| (s / count) as f32));
        }

        let grid = Grid::from_vec(columns, height, data)
            .ok_or_else(|| PyramidError::Internal(format!("zoom {} strip size mismatch", self.geometry.zoom())))?;
        let strip = LevelMatrix {
            zoom: self.geometry.zoom(),
            first_column: self.strip_start,
            grid,
        };
        self.sums.iter_mut().for_each(|s| *s = 0.0);
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.strip_start = strip_end;
        Ok(strip)
    }
}

/// Downsample a whole normalized spectrogram to every level, in parallel.
pub fn build_levels(normalized: &Grid, geometries: &[LevelGeometry]) -> Result<Vec<LevelMatrix>> {
    geometries
        .par_iter()
        .map(|geometry| {
            if normalized.columns() != geometry.n_frames {
                return Err(PyramidError::InvalidInput(format!(
                    "matrix has {} frames, zoom {} expects {}",
                    normalized.columns(),
                    geometry.zoom(),
                    geometry.n_frames
                )));
            }
            if geometry.bands.last().map(|b| b.end).unwrap_or(0) > normalized.rows() {
                return Err(PyramidError::InvalidInput(format!(
                    "matrix has {} frequency rows, fewer than zoom {} reads",
                    normalized.rows(),
                    geometry.zoom()
                )));
            }

            let mut acc = LevelAccumulator::new(geometry.clone(), geometry.width);
            let mut strips = acc.push_frames(0, normalized.as_slice(), normalized.rows())?;
            strips.pop().ok_or_else(|| {
                PyramidError::Internal(format!("zoom {} produced no columns", geometry.zoom()))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_zoom_levels, PyramidConfig};

    fn params(n_frames: usize, scale: FrequencyScale) -> StftParams {
        let config = PyramidConfig { frequency_scale: scale, ..Default::default() };
        let mut p = StftParams::new(32000, 320_000, &config).unwrap();
        p.n_frames = n_frames;
        p
    }

    fn level(px_per_sec: f64, hz_per_px: f64) -> ZoomLevel {
        ZoomLevel { zoom: 0, px_per_sec, hz_per_px }
    }

    #[test]
    fn test_default_level_factors() {
        let p = params(997, FrequencyScale::Linear);
        let factors: Vec<(usize, usize, usize, usize)> = default_zoom_levels()
            .iter()
            .map(|l| {
                let g = LevelGeometry::new(&p, l).unwrap();
                (g.time_factor, g.freq_factor, g.width, g.height)
            })
            .collect();
        assert_eq!(
            factors,
            vec![(16, 16, 63, 32), (8, 8, 125, 64), (4, 4, 250, 128), (2, 2, 499, 256), (1, 1, 997, 512)]
        );
    }

    #[test]
    fn test_factors_never_below_one() {
        let p = params(100, FrequencyScale::Linear);
        let g = LevelGeometry::new(&p, &level(10_000.0, 1.0)).unwrap();
        assert_eq!(g.time_factor, 1);
        assert_eq!(g.freq_factor, 1);
        assert_eq!(g.width, 100);
        assert_eq!(g.height, 512);
    }

    #[test]
    fn test_width_monotonic_in_px_per_sec() {
        let p = params(12_345, FrequencyScale::Linear);
        let mut last = 0;
        for px in [1.0, 3.0, 7.5, 12.5, 33.0, 50.0, 99.0, 100.0, 400.0] {
            let g = LevelGeometry::new(&p, &level(px, 100.0)).unwrap();
            assert!(g.width >= last, "{} px/s gave {} columns after {}", px, g.width, last);
            last = g.width;
        }
    }

    #[test]
    fn test_band_limits_restrict_bins() {
        let config = PyramidConfig {
            min_freq_hz: 1000.0,
            max_freq_hz: Some(8000.0),
            ..Default::default()
        };
        let p = StftParams::new(32000, 320_000, &config).unwrap();
        assert_eq!(analysed_bins(&p).unwrap(), 32..256);
        let g = LevelGeometry::new(&p, &level(100.0, 62.5)).unwrap();
        assert_eq!(g.freq_factor, 2);
        assert_eq!(g.height, 112);
        assert_eq!(g.bands()[0], 32..34);
        assert_eq!(g.row_edges_hz()[0], 1000.0);
        assert_eq!(*g.row_edges_hz().last().unwrap(), 8000.0);
    }

    #[test]
    fn test_mel_bands_cover_band_in_order() {
        let p = params(50, FrequencyScale::Mel);
        let g = LevelGeometry::new(&p, &level(100.0, 125.0)).unwrap();
        assert_eq!(g.height, 128);
        assert_eq!(g.row_edges_hz().len(), 129);
        for pair in g.row_edges_hz().windows(2) {
            assert!(pair[1] > pair[0]);
        }
        for band in g.bands() {
            assert!(!band.is_empty() && band.end <= 512);
        }
        // Mel rows are narrower at the bottom than at the top.
        let low = g.row_edges_hz()[1] - g.row_edges_hz()[0];
        let high = g.row_edges_hz()[128] - g.row_edges_hz()[127];
        assert!(high > 4.0 * low, "low {} high {}", low, high);
    }

    #[test]
    fn test_mel_round_trip() {
        for hz in [0.0, 440.0, 1000.0, 16000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
    }

    #[test]
    fn test_box_average_excludes_out_of_bounds() {
        let mut p = params(5, FrequencyScale::Linear);
        p.n_fft = 4;
        p.n_freq_bins = 2;
        p.sample_rate = 4;
        p.hop_samples = 1;
        p.min_freq_hz = 0.0;
        p.max_freq_hz = 2.0;
        // 250 ms frames: 2 px/s -> 2 frames per column; 2 Hz/px over 2 Hz -> 2 bins per row.
        let g = LevelGeometry::new(&p, &level(2.0, 2.0)).unwrap();
        assert_eq!((g.time_factor, g.freq_factor, g.width, g.height), (2, 2, 3, 1));

        let grid = Grid::from_vec(5, 2, vec![1.0, 1.0, 1.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.2, 0.4]).unwrap();
        let levels = build_levels(&grid, &[g]).unwrap();
        let out = levels[0].grid.as_slice();
        assert_eq!(out.len(), 3);
        assert!((out[0] - 0.75).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        // Last column has one frame, not two half-empty ones.
        assert!((out[2] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_streaming_strips_match_whole_matrix() {
        let p = params(203, FrequencyScale::Linear);
        let geometry = LevelGeometry::new(&p, &level(25.0, 125.0)).unwrap();
        let rows = p.n_freq_bins;
        let data: Vec<f32> = (0..203 * rows).map(|i| ((i * 37) % 101) as f32 / 100.0).collect();
        let grid = Grid::from_vec(203, rows, data).unwrap();

        let whole = build_levels(&grid, &[geometry.clone()]).unwrap().remove(0);

        let mut acc = LevelAccumulator::new(geometry, 16);
        let mut strips = Vec::new();
        let mut frame = 0;
        for batch in [5usize, 64, 1, 100, 33] {
            let cells = &grid.as_slice()[frame * rows..(frame + batch) * rows];
            strips.extend(acc.push_frames(frame, cells, rows).unwrap());
            frame += batch;
        }
        assert!(acc.is_complete());
        assert_eq!(strips.len(), whole.width().div_ceil(16));

        for strip in &strips {
            assert_eq!(strip.first_column % 16, 0);
            for c in 0..strip.width() {
                assert_eq!(strip.grid.column(c), whole.grid.column(strip.first_column + c));
            }
        }
    }

    #[test]
    fn test_out_of_order_frames_rejected() {
        let p = params(10, FrequencyScale::Linear);
        let geometry = LevelGeometry::new(&p, &level(100.0, 31.25)).unwrap();
        let mut acc = LevelAccumulator::new(geometry, 4);
        let cells = vec![0.0f32; 512];
        assert!(acc.push_frames(3, &cells, 512).is_err());
    }

    #[test]
    fn test_build_levels_checks_shape() {
        let p = params(10, FrequencyScale::Linear);
        let geometry = LevelGeometry::new(&p, &level(100.0, 31.25)).unwrap();
        let grid = Grid::new(9, 512, 0.0);
        assert!(build_levels(&grid, &[geometry]).is_err());
    }
}
