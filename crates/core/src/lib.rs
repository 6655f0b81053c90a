//! Spectrogram tile pyramids for long audio recordings.
//!
//! A recording is analysed with a short-time Fourier transform, normalized
//! to a fixed dynamic range, downsampled once per zoom level and cut into
//! fixed-size colour-mapped image tiles. [`PyramidGenerator`] runs the whole
//! pipeline with bounded memory and hands tiles to a [`TileSink`]; the returned
//! [`PyramidIndex`] describes how to address them.

pub mod audio;
pub mod config;
pub mod error;
pub mod grid;
pub mod index;
pub mod normalize;
pub mod pcm;
pub mod pipeline;
pub mod pyramid;
pub mod render;
pub mod roi;
pub mod sink;
pub mod stft;
pub mod tiles;

pub use config::{ColormapName, FrequencyScale, ImageFormat, PyramidConfig, ZoomLevel};
pub use error::{PyramidError, Result, TileFailure};
pub use index::{tile_bounds, tile_key, PyramidIndex, RunStatus, TileBounds};
pub use pcm::PcmBuffer;
pub use pipeline::{CancelToken, LogProgress, ProgressEvent, ProgressSink, PyramidGenerator};
pub use render::{ImageRenderer, RenderError, TileRenderer};
pub use roi::{DetectionEvent, RoiBox};
pub use sink::{FsTileSink, MemoryTileSink, TileSink};
