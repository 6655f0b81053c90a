//! Borrowed mono PCM input.

use crate::error::{PyramidError, Result};

/// Mono `f32` samples at a fixed rate, borrowed from the caller for the
/// duration of a generation run.
#[derive(Debug, Clone, Copy)]
pub struct PcmBuffer<'a> {
    samples: &'a [f32],
    sample_rate: u32,
}

impl<'a> PcmBuffer<'a> {
    /// Rejects empty buffers, a zero sample rate, and non-finite samples.
    pub fn new(samples: &'a [f32], sample_rate: u32) -> Result<Self> {
        if samples.is_empty() {
            return Err(PyramidError::InvalidInput("PCM buffer is empty".into()));
        }
        if sample_rate == 0 {
            return Err(PyramidError::InvalidInput("sample rate must be positive".into()));
        }
        if let Some(i) = samples.iter().position(|s| !s.is_finite()) {
            return Err(PyramidError::InvalidInput(format!(
                "sample {} is not a finite number",
                i
            )));
        }
        Ok(Self { samples, sample_rate })
    }

    pub fn samples(&self) -> &'a [f32] {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false; construction rejects empty buffers.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}
