//! Pyramid generation settings.
//!
//! Every option has a default and can be overridden per invocation, either
//! field by field or by deserializing a JSON document (missing fields keep
//! their defaults). [`PyramidConfig::validate`] checks the settings that do not
//! depend on the recording; checks that need the sample rate live in
//! [`crate::stft::StftParams::new`].

use serde::{Deserialize, Serialize};

use crate::error::{PyramidError, Result};

/// One resolution tier of the pyramid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ZoomLevel {
    pub zoom: u32,
    /// Horizontal density: pixels per second of audio.
    pub px_per_sec: f64,
    /// Vertical density: hertz covered by one pixel row.
    pub hz_per_px: f64,
}

/// Spacing of the rows of a rendered level.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyScale {
    #[default]
    Linear,
    /// Rows equally spaced on the mel scale.
    Mel,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ColormapName {
    #[default]
    Viridis,
    Grayscale,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
}

impl ImageFormat {
    /// File extension used in tile keys.
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

impl std::str::FromStr for FrequencyScale {
    type Err = PyramidError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(FrequencyScale::Linear),
            "mel" | "perceptual" => Ok(FrequencyScale::Mel),
            other => Err(PyramidError::InvalidInput(format!("unknown frequency scale '{}'", other))),
        }
    }
}

impl std::str::FromStr for ColormapName {
    type Err = PyramidError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "viridis" => Ok(ColormapName::Viridis),
            "grayscale" | "greyscale" | "gray" | "grey" => Ok(ColormapName::Grayscale),
            other => Err(PyramidError::InvalidInput(format!("unknown colormap '{}'", other))),
        }
    }
}

impl std::str::FromStr for ImageFormat {
    type Err = PyramidError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "png" => Ok(ImageFormat::Png),
            other => Err(PyramidError::InvalidInput(format!("unknown image format '{}'", other))),
        }
    }
}

/// Largest tile edge accepted, in pixels.
pub const MAX_TILE_EDGE: u32 = 8192;

/// Default zoom ladder, coarsest first. Each step doubles both densities.
pub fn default_zoom_levels() -> Vec<ZoomLevel> {
    [(6.25, 500.0), (12.5, 250.0), (25.0, 125.0), (50.0, 62.5), (100.0, 31.25)]
        .iter()
        .enumerate()
        .map(|(i, &(px_per_sec, hz_per_px))| ZoomLevel {
            zoom: i as u32,
            px_per_sec,
            hz_per_px,
        })
        .collect()
}

/// Full set of pyramid generation options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PyramidConfig {
    pub tile_width: u32,
    pub tile_height: u32,
    /// FFT length; must be a power of two and at least the window length.
    pub n_fft: usize,
    pub hop_ms: f64,
    pub win_ms: f64,
    /// Lower edge of the analysed band.
    pub min_freq_hz: f64,
    /// Upper edge of the analysed band; `None` means Nyquist.
    pub max_freq_hz: Option<f64>,
    pub frequency_scale: FrequencyScale,
    pub colormap: ColormapName,
    /// Window below the loudest cell kept in the normalized range.
    pub dynamic_range_db: f64,
    pub image_format: ImageFormat,
    /// JPEG quality, 1-100. Ignored for PNG.
    pub jpeg_quality: u8,
    pub zoom_levels: Vec<ZoomLevel>,
    /// Frames transformed per STFT batch.
    pub frame_batch_size: usize,
    /// Ceiling on spectrogram frames (or frame-equivalents of level data)
    /// held in memory at once.
    pub max_resident_frames: usize,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            tile_width: 1024,
            tile_height: 512,
            n_fft: 1024,
            hop_ms: 10.0,
            win_ms: 32.0,
            min_freq_hz: 0.0,
            max_freq_hz: None,
            frequency_scale: FrequencyScale::Linear,
            colormap: ColormapName::Viridis,
            dynamic_range_db: 80.0,
            image_format: ImageFormat::Jpeg,
            jpeg_quality: 85,
            zoom_levels: default_zoom_levels(),
            frame_batch_size: 512,
            max_resident_frames: 65_536,
        }
    }
}

fn invalid(msg: impl Into<String>) -> PyramidError {
    PyramidError::InvalidInput(msg.into())
}

fn positive_finite(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(format!("{} must be a positive finite number, got {}", name, value)));
    }
    Ok(())
}

impl PyramidConfig {
    /// Parse a JSON configuration; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PyramidConfig = serde_json::from_str(json)
            .map_err(|e| invalid(format!("malformed configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every setting that does not depend on the recording.
    pub fn validate(&self) -> Result<()> {
        for (name, edge) in [("tile_width", self.tile_width), ("tile_height", self.tile_height)] {
            if edge == 0 || edge > MAX_TILE_EDGE {
                return Err(invalid(format!("{} must be in 1..={}, got {}", name, MAX_TILE_EDGE, edge)));
            }
        }

        if self.n_fft < 2 || !self.n_fft.is_power_of_two() {
            return Err(invalid(format!("n_fft must be a power of two >= 2, got {}", self.n_fft)));
        }

        positive_finite("hop_ms", self.hop_ms)?;
        positive_finite("win_ms", self.win_ms)?;
        positive_finite("dynamic_range_db", self.dynamic_range_db)?;

        if !self.min_freq_hz.is_finite() || self.min_freq_hz < 0.0 {
            return Err(invalid(format!("min_freq_hz must be >= 0, got {}", self.min_freq_hz)));
        }
        if let Some(max) = self.max_freq_hz {
            positive_finite("max_freq_hz", max)?;
            if max <= self.min_freq_hz {
                return Err(invalid(format!(
                    "max_freq_hz ({}) must exceed min_freq_hz ({})",
                    max, self.min_freq_hz
                )));
            }
        }

        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(invalid(format!("jpeg_quality must be in 1..=100, got {}", self.jpeg_quality)));
        }

        if self.frame_batch_size == 0 {
            return Err(invalid("frame_batch_size must be at least 1"));
        }
        if self.max_resident_frames < self.frame_batch_size {
            return Err(invalid(format!(
                "max_resident_frames ({}) is smaller than frame_batch_size ({})",
                self.max_resident_frames, self.frame_batch_size
            )));
        }

        validate_zoom_levels(&self.zoom_levels)
    }
}

/// Zoom levels must be ordered coarsest to finest with strictly increasing
/// resolution on both axes.
pub fn validate_zoom_levels(levels: &[ZoomLevel]) -> Result<()> {
    if levels.is_empty() {
        return Err(invalid("at least one zoom level is required"));
    }
    for level in levels {
        positive_finite(&format!("zoom {} px_per_sec", level.zoom), level.px_per_sec)?;
        positive_finite(&format!("zoom {} hz_per_px", level.zoom), level.hz_per_px)?;
    }
    for pair in levels.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if b.zoom <= a.zoom {
            return Err(invalid(format!("zoom levels out of order: {} then {}", a.zoom, b.zoom)));
        }
        if b.px_per_sec <= a.px_per_sec {
            return Err(invalid(format!(
                "px_per_sec must increase with zoom ({} at zoom {}, {} at zoom {})",
                a.px_per_sec, a.zoom, b.px_per_sec, b.zoom
            )));
        }
        if b.hz_per_px >= a.hz_per_px {
            return Err(invalid(format!(
                "hz_per_px must decrease with zoom ({} at zoom {}, {} at zoom {})",
                a.hz_per_px, a.zoom, b.hz_per_px, b.zoom
            )));
        }
    }
    Ok(())
}

/// Parse a zoom ladder written as `px_per_sec:hz_per_px` pairs separated by
/// commas, e.g. `"10:200,20:100,40:50"`. Zoom numbers are assigned from 0.
pub fn parse_zoom_levels(s: &str) -> Result<Vec<ZoomLevel>> {
    let mut levels = Vec::new();
    for (i, part) in s.split(',').map(str::trim).filter(|p| !p.is_empty()).enumerate() {
        let (px, hz) = part
            .split_once(':')
            .ok_or_else(|| invalid(format!("zoom level '{}' is not px_per_sec:hz_per_px", part)))?;
        let px_per_sec: f64 = px
            .trim()
            .parse()
            .map_err(|_| invalid(format!("bad px_per_sec in '{}'", part)))?;
        let hz_per_px: f64 = hz
            .trim()
            .parse()
            .map_err(|_| invalid(format!("bad hz_per_px in '{}'", part)))?;
        levels.push(ZoomLevel { zoom: i as u32, px_per_sec, hz_per_px });
    }
    validate_zoom_levels(&levels)?;
    Ok(levels)
}
