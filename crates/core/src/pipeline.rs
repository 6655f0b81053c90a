//! Generation runs: PCM in, published tile pyramid and index out.
//!
//! A run makes two passes over the recording. The first computes the STFT
//! batch by batch only to find the global dB range. The second recomputes
//! each batch, normalizes it, feeds every zoom level's accumulator, slices
//! finished strips into tiles and renders them in parallel. Rendered tiles go
//! through a bounded channel to a writer thread that owns the sink, so encoding
//! and storage overlap while memory stays bounded by the batch size and one
//! strip per level, independent of recording length.
//!
//! Publication is all-or-nothing: the sink is committed only when every tile
//! rendered and was stored, otherwise it is aborted. Nothing touches the sink
//! before the input has been validated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use rayon::prelude::*;
use uuid::Uuid;

use crate::config::PyramidConfig;
use crate::error::{PyramidError, Result, TileFailure};
use crate::index::{self, PyramidIndex, RunStatus, Tiling};
use crate::normalize::{DbStats, Normalizer};
use crate::pcm::PcmBuffer;
use crate::pyramid::{LevelAccumulator, LevelGeometry};
use crate::render::{ImageRenderer, TileRenderer};
use crate::roi::{level_rects, roi_boxes, DetectionEvent, LevelRect};
use crate::sink::{default_key_prefix, TileSink};
use crate::stft::{StftEngine, StftParams};
use crate::tiles::slice_tiles;

/// Rendered tiles buffered between the render workers and the writer.
const WRITE_QUEUE: usize = 64;

/// Namespace for generated key prefixes.
pub const DEFAULT_NAMESPACE: &str = "pyramids";

/// Shared flag for stopping a run from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PyramidError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Events emitted while a run progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Status(RunStatus),

    /// First pass finished.
    StatsComputed { min_db: f32, max_db: f32, n_frames: usize },

    TileRendered { zoom: u32, x: usize, y: usize, bytes: usize },

    /// The last tile of a level has been handed to the sink.
    LevelCompleted { zoom: u32, tiles: usize },
}

/// Receives [`ProgressEvent`]s on the thread driving the run.
pub trait ProgressSink: Send {
    fn on_event(&mut self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(ProgressEvent) + Send,
{
    fn on_event(&mut self, event: ProgressEvent) {
        self(event)
    }
}

/// Ignores every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_event(&mut self, _event: ProgressEvent) {}
}

/// Forwards events to the `log` facade.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_event(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::Status(status) => log::info!("Run {}", status),
            ProgressEvent::StatsComputed { min_db, max_db, n_frames } => {
                log::info!("Analysed {} frames: {:.1} dB to {:.1} dB", n_frames, min_db, max_db)
            }
            ProgressEvent::TileRendered { zoom, x, y, bytes } => {
                log::trace!("Tile {}/{}/{} ({} bytes)", zoom, x, y, bytes)
            }
            ProgressEvent::LevelCompleted { zoom, tiles } => {
                log::info!("Zoom {} complete: {} tiles", zoom, tiles)
            }
        }
    }
}

/// Frames-equivalent of what a run keeps resident: one STFT batch plus one
/// strip (up to `tile_width` columns) of every level, converted to frames of
/// `n_freq_bins` cells.
pub fn estimate_resident_frames(
    params: &StftParams,
    geometries: &[LevelGeometry],
    tile_width: usize,
    frame_batch_size: usize,
) -> usize {
    let bins = params.n_freq_bins.max(1);
    let levels: usize = geometries
        .iter()
        .map(|g| (tile_width.min(g.width) * g.height).div_ceil(bins))
        .sum();
    frame_batch_size.min(params.n_frames) + levels
}

/// A tile on its way to the sink.
struct EncodedTile {
    key: String,
    bytes: Vec<u8>,
}

struct PassOutcome {
    tile_counts: Vec<usize>,
    failures: Vec<TileFailure>,
}

/// Drives one pyramid generation at a time.
pub struct PyramidGenerator {
    config: PyramidConfig,
    renderer: Box<dyn TileRenderer>,
    progress: Box<dyn ProgressSink>,
    cancel: CancelToken,
    namespace: String,
    key_prefix: Option<String>,
    events: Vec<DetectionEvent>,
    status: RunStatus,
}

impl PyramidGenerator {
    /// Validates `config`; the default renderer follows its colormap and
    /// image format.
    pub fn new(config: PyramidConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            renderer: Box::new(ImageRenderer::from_config(&config)),
            config,
            progress: Box::new(NoProgress),
            cancel: CancelToken::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            key_prefix: None,
            events: Vec::new(),
            status: RunStatus::Pending,
        })
    }

    pub fn with_renderer(mut self, renderer: impl TileRenderer + 'static) -> Self {
        self.renderer = Box::new(renderer);
        self
    }

    pub fn with_progress(mut self, progress: impl ProgressSink + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Use a fixed key prefix instead of one derived from the input.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Namespace for derived key prefixes (`{namespace}/{fingerprint}`).
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Detection events to outline on every level.
    pub fn with_events(mut self, events: Vec<DetectionEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &PyramidConfig {
        &self.config
    }

    /// Status of the most recent run.
    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.progress.on_event(ProgressEvent::Status(status));
    }

    /// Run the whole pipeline and publish the result through `sink`.
    ///
    /// On any error nothing is published: the sink is aborted for the run's
    /// prefix and the status ends as `Failed`.
    pub fn generate(&mut self, pcm: &PcmBuffer<'_>, sink: &mut dyn TileSink) -> Result<PyramidIndex> {
        self.set_status(RunStatus::Processing);
        let result = self.run(pcm, sink);
        match &result {
            Ok(index) => {
                log::info!("Published {} tiles under {}", index.total_tiles, index.key_prefix);
                self.set_status(RunStatus::Completed);
            }
            Err(e) => {
                log::error!("Pyramid generation failed: {}", e);
                self.set_status(RunStatus::Failed);
            }
        }
        result
    }

    fn run(&mut self, pcm: &PcmBuffer<'_>, sink: &mut dyn TileSink) -> Result<PyramidIndex> {
        let config = &self.config;
        let params = StftParams::new(pcm.sample_rate(), pcm.len(), config)?;
        let geometries = config
            .zoom_levels
            .iter()
            .map(|level| LevelGeometry::new(&params, level))
            .collect::<Result<Vec<_>>>()?;

        let tile_width = config.tile_width as usize;
        let required = estimate_resident_frames(&params, &geometries, tile_width, config.frame_batch_size);
        if required > config.max_resident_frames {
            return Err(PyramidError::ResourceExhausted {
                required,
                limit: config.max_resident_frames,
            });
        }

        let prefix = match &self.key_prefix {
            Some(p) => p.trim_matches('/').to_string(),
            None => default_key_prefix(&self.namespace, pcm, config, &self.events)?,
        };
        if prefix.is_empty() {
            return Err(PyramidError::InvalidInput("key prefix is empty".into()));
        }

        log::info!(
            "Generating pyramid for {:.1}s at {} Hz: {} frames x {} bins, {} levels, prefix {}",
            pcm.duration_s(),
            pcm.sample_rate(),
            params.n_frames,
            params.n_freq_bins,
            geometries.len(),
            prefix
        );
        for g in &geometries {
            log::debug!(
                "Zoom {}: {}x{} px (time factor {}, freq factor {})",
                g.zoom(),
                g.width,
                g.height,
                g.time_factor,
                g.freq_factor
            );
        }

        let boxes = roi_boxes(&self.events, params.duration_s());
        let rects = level_rects(&boxes, &params, &geometries);

        // From here on every failure discards what the run staged.
        let engine = StftEngine::new(params.clone());
        let (stats, pass) = match self.publish(&engine, pcm, &geometries, &rects, &prefix, sink) {
            Ok(done) => done,
            Err(e) => {
                abort_quietly(sink, &prefix);
                return Err(e);
            }
        };

        let tiling = Tiling {
            tile_width,
            tile_height: self.config.tile_height as usize,
            image_format: self.config.image_format,
            colormap: self.config.colormap,
        };
        let mut index = index::assemble(
            &geometries,
            &pass.tile_counts,
            &params,
            &stats,
            tiling,
            &prefix,
            Uuid::new_v4(),
        );
        index.roi_boxes = boxes.len();
        Ok(index)
    }

    /// Open the sink, run both passes and commit.
    fn publish(
        &mut self,
        engine: &StftEngine,
        pcm: &PcmBuffer<'_>,
        geometries: &[LevelGeometry],
        rects: &[Vec<LevelRect>],
        prefix: &str,
        sink: &mut dyn TileSink,
    ) -> Result<(DbStats, PassOutcome)> {
        sink.begin(prefix).map_err(PyramidError::Storage)?;
        let stats = self.stats_pass(engine, pcm)?;
        let pass = self.render_pass(engine, pcm, geometries, rects, &stats, prefix, sink)?;
        if !pass.failures.is_empty() {
            return Err(PyramidError::RenderFailures(pass.failures));
        }
        self.cancel.check()?;
        sink.commit(prefix).map_err(PyramidError::Storage)?;
        Ok((stats, pass))
    }

    /// First pass: global dB range, one batch resident at a time.
    fn stats_pass(&mut self, engine: &StftEngine, pcm: &PcmBuffer<'_>) -> Result<DbStats> {
        let bins = engine.params().n_freq_bins;
        let batch_size = self.config.frame_batch_size;
        let mut buf = vec![0.0f32; batch_size.min(engine.params().n_frames) * bins];
        let mut stats = DbStats::empty();

        for batch in engine.batches(batch_size) {
            self.cancel.check()?;
            let cells = &mut buf[..batch.len() * bins];
            engine.compute_frames(pcm.samples(), batch, cells)?;
            stats.update(cells);
        }
        if stats.is_empty() {
            return Err(PyramidError::Internal("no frames analysed".into()));
        }

        self.progress.on_event(ProgressEvent::StatsComputed {
            min_db: stats.min_db,
            max_db: stats.max_db,
            n_frames: engine.params().n_frames,
        });
        Ok(stats)
    }

    /// Second pass: normalize, downsample, slice, render and store.
    #[allow(clippy::too_many_arguments)]
    fn render_pass(
        &mut self,
        engine: &StftEngine,
        pcm: &PcmBuffer<'_>,
        geometries: &[LevelGeometry],
        rects: &[Vec<LevelRect>],
        stats: &DbStats,
        prefix: &str,
        sink: &mut dyn TileSink,
    ) -> Result<PassOutcome> {
        let (tx, rx) = bounded::<EncodedTile>(WRITE_QUEUE);
        let writer_sink = &mut *sink;
        let scaler = stats.scaler(self.config.dynamic_range_db);

        let (pass, written) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || write_tiles(rx, writer_sink));
            let pass = self.stream_levels(engine, pcm, geometries, rects, scaler, prefix, &tx);
            drop(tx);
            (pass, writer.join())
        });

        let written = written.map_err(|_| PyramidError::Internal("tile writer panicked".into()))?;
        // A writer error is the root cause of any send failure in the pass.
        let written = written.map_err(PyramidError::Storage)?;
        let pass = pass?;
        log::debug!("Writer stored {} tiles", written);
        Ok(pass)
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_levels(
        &mut self,
        engine: &StftEngine,
        pcm: &PcmBuffer<'_>,
        geometries: &[LevelGeometry],
        rects: &[Vec<LevelRect>],
        scaler: Normalizer,
        prefix: &str,
        tx: &Sender<EncodedTile>,
    ) -> Result<PassOutcome> {
        let Self { config, renderer, progress, cancel, .. } = self;
        let (config, cancel): (&PyramidConfig, &CancelToken) = (config, cancel);
        let renderer: &dyn TileRenderer = &**renderer;
        let bins = engine.params().n_freq_bins;
        let (tile_width, tile_height) = (config.tile_width as usize, config.tile_height as usize);

        let mut accumulators: Vec<LevelAccumulator> = geometries
            .iter()
            .map(|g| LevelAccumulator::new(g.clone(), tile_width))
            .collect();
        let mut tile_counts = vec![0usize; geometries.len()];
        let mut failures = Vec::new();
        let mut buf = vec![0.0f32; config.frame_batch_size.min(engine.params().n_frames) * bins];

        for batch in engine.batches(config.frame_batch_size) {
            cancel.check()?;
            let first_frame = batch.start;
            let cells = &mut buf[..batch.len() * bins];
            engine.compute_frames(pcm.samples(), batch, cells)?;
            scaler.apply_in_place(cells);
            let cells: &[f32] = cells;

            let strips = accumulators
                .par_iter_mut()
                .map(|acc| acc.push_frames(first_frame, cells, bins))
                .collect::<Result<Vec<_>>>()?;

            for (level, level_strips) in strips.into_iter().enumerate() {
                for strip in level_strips {
                    cancel.check()?;
                    let strip_end = strip.first_column + strip.width();
                    log::debug!(
                        "Zoom {}: columns {}..{} ready",
                        strip.zoom,
                        strip.first_column,
                        strip_end
                    );

                    let level_height = geometries[level].height;
                    let rendered: Vec<_> = slice_tiles(&strip, tile_width, tile_height)
                        .into_par_iter()
                        .map(|mut tile| {
                            if cancel.is_cancelled() {
                                return None;
                            }
                            tile.overlays = rects[level]
                                .iter()
                                .filter_map(|r| {
                                    r.overlay(
                                        level_height,
                                        tile.x * tile_width,
                                        tile.y * tile_height,
                                        tile.width,
                                        tile.height,
                                    )
                                })
                                .collect();
                            let result = renderer.render(&tile);
                            Some((tile.zoom, tile.x, tile.y, result))
                        })
                        .collect();
                    cancel.check()?;

                    for (zoom, x, y, result) in rendered.into_iter().flatten() {
                        match result {
                            Ok(bytes) => {
                                progress.on_event(ProgressEvent::TileRendered { zoom, x, y, bytes: bytes.len() });
                                let key = index::tile_key(prefix, zoom, x, y, renderer.extension());
                                tx.send(EncodedTile { key, bytes }).map_err(|_| {
                                    PyramidError::Storage(anyhow::anyhow!("tile writer stopped"))
                                })?;
                                tile_counts[level] += 1;
                            }
                            Err(e) => {
                                log::warn!("Tile {}/{}/{} failed to render: {}", zoom, x, y, e);
                                failures.push(TileFailure { zoom, x, y, reason: e.to_string() });
                            }
                        }
                    }

                    if strip_end == geometries[level].width {
                        progress.on_event(ProgressEvent::LevelCompleted {
                            zoom: strip.zoom,
                            tiles: tile_counts[level],
                        });
                    }
                }
            }
        }

        if let Some(acc) = accumulators.iter().find(|acc| !acc.is_complete()) {
            return Err(PyramidError::Internal(format!(
                "zoom {} did not receive every frame",
                acc.geometry().zoom()
            )));
        }
        Ok(PassOutcome { tile_counts, failures })
    }
}

fn write_tiles(rx: Receiver<EncodedTile>, sink: &mut dyn TileSink) -> anyhow::Result<usize> {
    let mut written = 0;
    for tile in rx {
        sink.put(&tile.key, &tile.bytes)?;
        written += 1;
    }
    Ok(written)
}

fn abort_quietly(sink: &mut dyn TileSink, prefix: &str) {
    if let Err(e) = sink.abort(prefix) {
        log::warn!("Failed to discard partial pyramid {}: {:#}", prefix, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_zoom_levels, ImageFormat};
    use crate::sink::MemoryTileSink;
    use std::sync::Mutex;

    fn tone(sr: u32, seconds: f64) -> Vec<f32> {
        let n = (sr as f64 * seconds) as usize;
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * 440.0 * i as f64 / sr as f64).sin() as f32 * 0.5)
            .collect()
    }

    fn small_config() -> PyramidConfig {
        PyramidConfig {
            tile_width: 64,
            tile_height: 64,
            image_format: ImageFormat::Png,
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_publishes_every_tile() {
        let samples = tone(16000, 2.0);
        let pcm = PcmBuffer::new(&samples, 16000).unwrap();
        let mut generator = PyramidGenerator::new(small_config()).unwrap().with_key_prefix("t/run");
        let mut sink = MemoryTileSink::new();

        let index = generator.generate(&pcm, &mut sink).unwrap();
        assert_eq!(generator.status(), RunStatus::Completed);
        assert_eq!(index.status, RunStatus::Completed);
        assert_eq!(index.levels.len(), 5);
        assert_eq!(sink.published().len(), index.total_tiles);
        assert!(sink.staged().is_empty());
        for key in index.tile_keys() {
            assert!(sink.get(&key).is_some(), "missing {}", key);
        }
        for level in &index.levels {
            assert_eq!(level.tile_count, level.tiles_x * level.tiles_y);
        }
    }

    #[test]
    fn test_progress_events_in_order() {
        let samples = tone(8000, 1.0);
        let pcm = PcmBuffer::new(&samples, 8000).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let mut generator = PyramidGenerator::new(small_config())
            .unwrap()
            .with_progress(move |e: ProgressEvent| seen.lock().unwrap().push(e));
        generator.generate(&pcm, &mut MemoryTileSink::new()).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.first(), Some(&ProgressEvent::Status(RunStatus::Processing)));
        assert_eq!(events.last(), Some(&ProgressEvent::Status(RunStatus::Completed)));
        assert!(matches!(events[1], ProgressEvent::StatsComputed { .. }));
        let completed: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::LevelCompleted { zoom, .. } => Some(*zoom),
                _ => None,
            })
            .collect();
        let mut sorted = completed.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_estimate_bounded_by_strip_not_length() {
        let config = PyramidConfig::default();
        let estimate = |seconds: usize| {
            let params = StftParams::new(32000, seconds * 32000, &config).unwrap();
            let geometries: Vec<LevelGeometry> = default_zoom_levels()
                .iter()
                .map(|l| LevelGeometry::new(&params, l).unwrap())
                .collect();
            estimate_resident_frames(&params, &geometries, 1024, 512)
        };
        // Beyond the point where every level spans a full strip the
        // estimate stops growing.
        assert_eq!(estimate(3600), estimate(7200));
        assert!(estimate(3600) < PyramidConfig::default().max_resident_frames);
    }

    #[test]
    fn test_invalid_input_fails_before_work() {
        let samples = vec![0.0f32; 100];
        let pcm = PcmBuffer::new(&samples, 8000).unwrap();
        let config = PyramidConfig { n_fft: 128, ..small_config() };
        let mut generator = PyramidGenerator::new(config).unwrap();
        let mut sink = MemoryTileSink::new();
        let err = generator.generate(&pcm, &mut sink).unwrap_err();
        assert!(matches!(err, PyramidError::InvalidInput(_)));
        assert_eq!(generator.status(), RunStatus::Failed);
        assert_eq!(sink.commits() + sink.aborts(), 0);
    }

    /// Accepts tiles but refuses to publish them.
    #[derive(Default)]
    struct ReadOnlyStore {
        staged: usize,
        aborted: bool,
    }

    impl TileSink for ReadOnlyStore {
        fn begin(&mut self, _prefix: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn put(&mut self, _key: &str, _bytes: &[u8]) -> anyhow::Result<()> {
            self.staged += 1;
            Ok(())
        }

        fn commit(&mut self, prefix: &str) -> anyhow::Result<()> {
            anyhow::bail!("store is read-only, cannot publish {}", prefix)
        }

        fn abort(&mut self, _prefix: &str) -> anyhow::Result<()> {
            self.aborted = true;
            Ok(())
        }
    }

    #[test]
    fn test_failed_commit_aborts() {
        let samples = tone(8000, 1.0);
        let pcm = PcmBuffer::new(&samples, 8000).unwrap();
        let mut generator = PyramidGenerator::new(small_config()).unwrap();
        let mut store = ReadOnlyStore::default();

        let err = generator.generate(&pcm, &mut store).unwrap_err();
        assert!(matches!(err, PyramidError::Storage(_)), "got {:?}", err);
        assert!(store.staged > 0);
        assert!(store.aborted);
        assert_eq!(generator.status(), RunStatus::Failed);
    }

    #[test]
    fn test_begin_drops_leftovers_under_prefix() {
        let samples = tone(8000, 1.0);
        let pcm = PcmBuffer::new(&samples, 8000).unwrap();
        let mut sink = MemoryTileSink::new();
        sink.put("t/run/9/0/0.png", b"stale").unwrap();
        sink.put("other/0/0/0.png", b"kept").unwrap();

        let mut generator = PyramidGenerator::new(small_config()).unwrap().with_key_prefix("t/run");
        let index = generator.generate(&pcm, &mut sink).unwrap();
        assert!(sink.get("t/run/9/0/0.png").is_none());
        assert_eq!(sink.published().len(), index.total_tiles);
        assert!(sink.staged().contains_key("other/0/0/0.png"));
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!token.is_cancelled());
        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(PyramidError::Cancelled)));
    }
}
