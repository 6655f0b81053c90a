//! Short-time Fourier transform into a dB magnitude matrix.
//!
//! Frames are Hann-windowed, zero-padded to `n_fft`, transformed with a real
//! radix-2 FFT and reduced to `n_fft / 2` power bins in decibels. Work is done
//! in batches of frames so callers can bound how much of the spectrogram is
//! resident; frames inside a batch are transformed in parallel.

use std::f64::consts::PI;
use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;
use realfft::{RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::config::{FrequencyScale, PyramidConfig};
use crate::error::{PyramidError, Result};
use crate::grid::Grid;
use crate::pcm::PcmBuffer;

/// Power below which a bin is treated as silent.
pub const POWER_FLOOR: f64 = 1e-10;

/// dB value of a silent bin.
pub const SILENCE_DB: f32 = -100.0;

/// Analysis parameters resolved against a concrete recording.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StftParams {
    pub sample_rate: u32,
    /// Length of the analysed recording.
    pub n_samples: usize,
    pub n_fft: usize,
    pub hop_ms: f64,
    pub win_ms: f64,
    pub hop_samples: usize,
    pub win_samples: usize,
    /// `n_fft / 2`; the Nyquist bin is dropped.
    pub n_freq_bins: usize,
    pub n_frames: usize,
    pub min_freq_hz: f64,
    /// Upper edge of the analysed band, clamped to Nyquist.
    pub max_freq_hz: f64,
    pub frequency_scale: FrequencyScale,
    pub dynamic_range_db: f64,
}

impl StftParams {
    /// Resolve the configuration for `n_samples` samples at `sample_rate`.
    ///
    /// Fails with `InvalidInput` when the window is longer than the FFT, when
    /// hop or window round to zero samples, or when the analysed band holds no
    /// bins.
    pub fn new(sample_rate: u32, n_samples: usize, config: &PyramidConfig) -> Result<Self> {
        if sample_rate == 0 {
            return Err(PyramidError::InvalidInput("sample rate must be positive".into()));
        }
        if n_samples == 0 {
            return Err(PyramidError::InvalidInput("PCM buffer is empty".into()));
        }
        if config.n_fft < 2 || !config.n_fft.is_power_of_two() {
            return Err(PyramidError::InvalidInput(format!(
                "n_fft must be a power of two >= 2, got {}",
                config.n_fft
            )));
        }

        let sr = sample_rate as f64;
        let win_samples = (config.win_ms * sr / 1000.0).round() as usize;
        let hop_samples = (config.hop_ms * sr / 1000.0).round() as usize;
        if win_samples == 0 || hop_samples == 0 {
            return Err(PyramidError::InvalidInput(format!(
                "window ({} ms) and hop ({} ms) must each span at least one sample at {} Hz",
                config.win_ms, config.hop_ms, sample_rate
            )));
        }
        if win_samples > config.n_fft {
            return Err(PyramidError::InvalidInput(format!(
                "window of {} ms is {} samples at {} Hz, longer than n_fft = {} (use n_fft >= {})",
                config.win_ms,
                win_samples,
                sample_rate,
                config.n_fft,
                smallest_fft_for(win_samples)
            )));
        }

        let nyquist = sr / 2.0;
        let max_freq_hz = config.max_freq_hz.unwrap_or(nyquist).min(nyquist);
        if config.min_freq_hz >= max_freq_hz {
            return Err(PyramidError::InvalidInput(format!(
                "analysed band {}..{} Hz is empty at {} Hz sample rate",
                config.min_freq_hz, max_freq_hz, sample_rate
            )));
        }

        Ok(Self {
            sample_rate,
            n_samples,
            n_fft: config.n_fft,
            hop_ms: config.hop_ms,
            win_ms: config.win_ms,
            hop_samples,
            win_samples,
            n_freq_bins: config.n_fft / 2,
            n_frames: frame_count(n_samples, win_samples, hop_samples),
            min_freq_hz: config.min_freq_hz,
            max_freq_hz,
            frequency_scale: config.frequency_scale,
            dynamic_range_db: config.dynamic_range_db,
        })
    }

    /// Width of one FFT bin in Hz.
    pub fn bin_hz(&self) -> f64 {
        self.sample_rate as f64 / self.n_fft as f64
    }

    /// Time between two consecutive frames.
    pub fn frame_duration_ms(&self) -> f64 {
        self.hop_samples as f64 * 1000.0 / self.sample_rate as f64
    }

    pub fn duration_s(&self) -> f64 {
        self.n_samples as f64 / self.sample_rate as f64
    }

    /// Start time of `frame` in seconds.
    pub fn frame_time_s(&self, frame: usize) -> f64 {
        (frame * self.hop_samples) as f64 / self.sample_rate as f64
    }
}

/// Number of frames for `n_samples`: `(N - win) / hop + 1`, or a single
/// zero-padded frame when the signal is shorter than the window.
pub fn frame_count(n_samples: usize, win_samples: usize, hop_samples: usize) -> usize {
    if n_samples < win_samples {
        1
    } else {
        (n_samples - win_samples) / hop_samples + 1
    }
}

/// Smallest valid FFT length that holds `win_samples`.
pub fn smallest_fft_for(win_samples: usize) -> usize {
    win_samples.next_power_of_two().max(2)
}

/// Symmetric Hann window.
pub fn hann_window(len: usize) -> Vec<f32> {
    if len == 1 {
        return vec![1.0];
    }
    let denom = (len - 1) as f64;
    (0..len)
        .map(|i| (0.5 * (1.0 - (2.0 * PI * i as f64 / denom).cos())) as f32)
        .collect()
}

/// `10 * log10(max(power, 1e-10))`.
pub fn power_to_db(power: f64) -> f32 {
    (10.0 * power.max(POWER_FLOOR).log10()) as f32
}

/// A planned transform for one set of [`StftParams`].
pub struct StftEngine {
    params: StftParams,
    window: Vec<f32>,
    fft: Arc<dyn RealToComplex<f32>>,
}

impl StftEngine {
    pub fn new(params: StftParams) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(params.n_fft);
        let window = hann_window(params.win_samples);
        Self { params, window, fft }
    }

    pub fn params(&self) -> &StftParams {
        &self.params
    }

    /// Consecutive frame ranges of at most `batch_size` frames covering the
    /// whole recording.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Range<usize>> {
        let n_frames = self.params.n_frames;
        let step = batch_size.max(1);
        (0..n_frames)
            .step_by(step)
            .map(move |start| start..(start + step).min(n_frames))
    }

    /// Compute dB columns for `frames` into `out`, which must hold
    /// `frames.len() * n_freq_bins` cells laid out one frame after another.
    pub fn compute_frames(&self, samples: &[f32], frames: Range<usize>, out: &mut [f32]) -> Result<()> {
        let bins = self.params.n_freq_bins;
        if out.len() != frames.len() * bins {
            return Err(PyramidError::Internal(format!(
                "frame buffer holds {} cells, expected {}",
                out.len(),
                frames.len() * bins
            )));
        }
        let first = frames.start;

        out.par_chunks_mut(bins).enumerate().try_for_each_init(
            || {
                (
                    self.fft.make_input_vec(),
                    self.fft.make_output_vec(),
                    self.fft.make_scratch_vec(),
                )
            },
            |(input, spectrum, scratch), (i, column)| {
                let start = (first + i) * self.params.hop_samples;
                input.fill(0.0);
                if start < samples.len() {
                    let end = (start + self.params.win_samples).min(samples.len());
                    for ((dst, &s), &w) in input.iter_mut().zip(&samples[start..end]).zip(&self.window) {
                        *dst = s * w;
                    }
                }

                self.fft
                    .process_with_scratch(input, spectrum, scratch)
                    .map_err(|e| PyramidError::Internal(format!("forward FFT failed: {}", e)))?;

                for (cell, c) in column.iter_mut().zip(spectrum.iter()) {
                    let re = c.re as f64;
                    let im = c.im as f64;
                    *cell = power_to_db(re * re + im * im);
                }
                Ok(())
            },
        )
    }
}

/// Compute the full spectrogram of `samples`.
///
/// The whole matrix is materialised, so recordings with more frames than
/// `config.max_resident_frames` are refused with `ResourceExhausted`; the
/// pipeline streams instead of calling this.
pub fn compute_spectrogram(samples: &[f32], sample_rate: u32, config: &PyramidConfig) -> Result<Grid> {
    let pcm = PcmBuffer::new(samples, sample_rate)?;
    config.validate()?;
    let params = StftParams::new(pcm.sample_rate(), pcm.len(), config)?;
    if params.n_frames > config.max_resident_frames {
        return Err(PyramidError::ResourceExhausted {
            required: params.n_frames,
            limit: config.max_resident_frames,
        });
    }

    let bins = params.n_freq_bins;
    let mut grid = Grid::new(params.n_frames, bins, SILENCE_DB);
    let engine = StftEngine::new(params);
    for batch in engine.batches(config.frame_batch_size) {
        let cells = &mut grid.as_mut_slice()[batch.start * bins..batch.end * bins];
        engine.compute_frames(pcm.samples(), batch, cells)?;
    }
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sr: u32, seconds: f64) -> Vec<f32> {
        let n = (sr as f64 * seconds) as usize;
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / sr as f64).sin() as f32)
            .collect()
    }

    fn test_config() -> PyramidConfig {
        PyramidConfig {
            n_fft: 1024,
            hop_ms: 10.0,
            win_ms: 32.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_sine_energy_in_nearest_bin() {
        let sr = 32000;
        let config = test_config();
        let bin_hz = sr as f64 / config.n_fft as f64;
        for &freq in &[300.0, 4000.0, 13500.0] {
            let samples = sine(freq, sr, 0.5);
            let grid = compute_spectrogram(&samples, sr, &config).unwrap();
            let column = grid.column(grid.columns() / 2);
            let peak = column
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(i, _)| i)
                .unwrap();
            let expected = (freq / bin_hz).round() as i64;
            assert!(
                (peak as i64 - expected).abs() <= 1,
                "{} Hz: peak at bin {}, expected {}",
                freq,
                peak,
                expected
            );
        }
    }

    #[test]
    fn test_dimensions() {
        let sr = 32000;
        let samples = vec![0.1f32; 32000];
        let grid = compute_spectrogram(&samples, sr, &test_config()).unwrap();
        assert_eq!(grid.rows(), 512);
        // (32000 - 1024) / 320 + 1
        assert_eq!(grid.columns(), 97);
    }

    #[test]
    fn test_silence_floors_at_minus_100() {
        let samples = vec![0.0f32; 8000];
        let grid = compute_spectrogram(&samples, 16000, &test_config()).unwrap();
        assert!(grid.as_slice().iter().all(|&v| v == SILENCE_DB));
    }

    #[test]
    fn test_short_signal_single_padded_frame() {
        let samples = vec![0.5f32; 100];
        let grid = compute_spectrogram(&samples, 32000, &test_config()).unwrap();
        assert_eq!(grid.columns(), 1);
        assert!(grid.as_slice().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_batching_matches_single_batch() {
        let sr = 16000;
        let samples = sine(1000.0, sr, 1.0);
        let small = PyramidConfig { frame_batch_size: 7, ..test_config() };
        let large = PyramidConfig { frame_batch_size: 4096, max_resident_frames: 8192, ..test_config() };
        let a = compute_spectrogram(&samples, sr, &small).unwrap();
        let b = compute_spectrogram(&samples, sr, &large).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_window_longer_than_fft_is_rejected() {
        let config = PyramidConfig { n_fft: 512, ..test_config() };
        let err = compute_spectrogram(&[0.0; 32000], 32000, &config).unwrap_err();
        match err {
            PyramidError::InvalidInput(msg) => assert!(msg.contains("n_fft >= 1024"), "got {}", msg),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_invalid_inputs() {
        let config = test_config();
        assert!(matches!(compute_spectrogram(&[], 16000, &config), Err(PyramidError::InvalidInput(_))));
        assert!(matches!(compute_spectrogram(&[0.0; 10], 0, &config), Err(PyramidError::InvalidInput(_))));
        let bad_fft = PyramidConfig { n_fft: 1000, ..config };
        assert!(matches!(compute_spectrogram(&[0.0; 10], 16000, &bad_fft), Err(PyramidError::InvalidInput(_))));
    }

    #[test]
    fn test_resident_ceiling() {
        let config = PyramidConfig { frame_batch_size: 16, max_resident_frames: 16, ..test_config() };
        let samples = vec![0.0f32; 32000];
        let err = compute_spectrogram(&samples, 32000, &config).unwrap_err();
        assert!(matches!(err, PyramidError::ResourceExhausted { required: 97, limit: 16 }));
    }

    #[test]
    fn test_frame_count() {
        assert_eq!(frame_count(100, 1024, 320), 1);
        assert_eq!(frame_count(1024, 1024, 320), 1);
        assert_eq!(frame_count(1344, 1024, 320), 2);
    }

    #[test]
    fn test_hann_window_shape() {
        let w = hann_window(5);
        assert!(w[0].abs() < 1e-7 && w[4].abs() < 1e-7);
        assert!((w[2] - 1.0).abs() < 1e-7);
        assert_eq!(hann_window(1), vec![1.0]);
    }

    #[test]
    fn test_power_to_db() {
        assert_eq!(power_to_db(0.0), SILENCE_DB);
        assert!((power_to_db(1.0)).abs() < 1e-7);
        assert!((power_to_db(100.0) - 20.0).abs() < 1e-5);
    }

    #[test]
    fn test_params_clamp_band_to_nyquist() {
        let config = PyramidConfig { max_freq_hz: Some(48000.0), ..test_config() };
        let params = StftParams::new(32000, 32000, &config).unwrap();
        assert_eq!(params.max_freq_hz, 16000.0);
        assert_eq!(params.bin_hz(), 31.25);
        assert_eq!(params.frame_duration_ms(), 10.0);
    }

    #[test]
    fn test_smallest_fft_for() {
        assert_eq!(smallest_fft_for(1411), 2048);
        assert_eq!(smallest_fft_for(1024), 1024);
        assert_eq!(smallest_fft_for(1), 2);
    }
}
