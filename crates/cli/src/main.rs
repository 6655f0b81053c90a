//! Sonotile CLI: render audio recordings into spectrogram tile pyramids.

mod archive;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use sonotile_core::audio::io::decode_audio;
use sonotile_core::config::parse_zoom_levels;
use sonotile_core::pipeline::DEFAULT_NAMESPACE;
use sonotile_core::sink::atomic_write;
use sonotile_core::stft::smallest_fft_for;
use sonotile_core::{
    DetectionEvent, FsTileSink, LogProgress, PcmBuffer, PyramidConfig, PyramidGenerator, PyramidIndex, TileSink,
    tile_bounds,
};

use archive::ZipTileSink;

// ─── Top-level CLI ───────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "sonotile",
    about = "Zoomable spectrogram tile pyramids for long recordings",
    version,
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a recording and write its tile pyramid
    Generate(GenerateArgs),
    /// Print the time and frequency extent of one tile
    Bounds(BoundsArgs),
    /// Print the default configuration as JSON
    Config,
}

// ─── Generate ────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct GenerateArgs {
    /// Input audio file (WAV, FLAC, MP3, MP4/AAC)
    input: PathBuf,

    /// Directory tiles are published under
    #[arg(long, default_value = "./sonotile-output")]
    output_dir: PathBuf,

    /// Write a single zip archive instead of a directory tree
    #[arg(long)]
    archive: Option<PathBuf>,

    /// JSON configuration file; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tile width in pixels
    #[arg(long)]
    tile_width: Option<u32>,

    /// Tile height in pixels
    #[arg(long)]
    tile_height: Option<u32>,

    /// FFT length (power of two)
    #[arg(long)]
    n_fft: Option<usize>,

    /// Raise n_fft to the smallest power of two holding the window
    #[arg(long, default_value_t = false)]
    auto_fft: bool,

    /// Hop between frames (ms)
    #[arg(long)]
    hop_ms: Option<f64>,

    /// Analysis window length (ms)
    #[arg(long)]
    win_ms: Option<f64>,

    /// Lower edge of the analysed band (Hz)
    #[arg(long)]
    min_freq: Option<f64>,

    /// Upper edge of the analysed band (Hz, default Nyquist)
    #[arg(long)]
    max_freq: Option<f64>,

    /// Frequency axis
    #[arg(long, value_parser = ["linear", "mel", "perceptual"])]
    scale: Option<String>,

    /// Colour map
    #[arg(long, value_parser = ["viridis", "grayscale"])]
    colormap: Option<String>,

    /// Dynamic range kept below the loudest cell (dB)
    #[arg(long)]
    dynamic_range: Option<f64>,

    /// Tile image format
    #[arg(long, value_parser = ["jpeg", "jpg", "png"])]
    format: Option<String>,

    /// JPEG quality (1-100)
    #[arg(long)]
    quality: Option<u8>,

    /// Zoom ladder as px_per_sec:hz_per_px pairs, e.g. "10:200,20:100"
    #[arg(long)]
    zoom_levels: Option<String>,

    /// Frames per STFT batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Ceiling on frames held in memory
    #[arg(long)]
    max_resident_frames: Option<usize>,

    /// Fixed key prefix (default: {namespace}/{content fingerprint})
    #[arg(long)]
    prefix: Option<String>,

    /// JSON list of detection events to outline (start_ms, end_ms, f_min_hz, f_max_hz)
    #[arg(long)]
    events: Option<PathBuf>,

    /// Namespace for generated key prefixes
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Show verbose output
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

// ─── Bounds ──────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct BoundsArgs {
    /// index.json written by `generate`
    index: PathBuf,
    zoom: u32,
    x: usize,
    y: usize,
}

// ─── Main ────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    // Init logging
    let log_level = match &cli.command {
        Command::Generate(a) if a.verbose => "debug",
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Bounds(args) => run_bounds(args),
        Command::Config => print_default_config(),
    };

    if let Err(e) = result {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

// ─── Config assembly ─────────────────────────────────────────────

fn build_config(args: &GenerateArgs) -> Result<PyramidConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            PyramidConfig::from_json(&json).with_context(|| format!("Invalid config: {}", path.display()))?
        }
        None => PyramidConfig::default(),
    };

    if let Some(v) = args.tile_width {
        config.tile_width = v;
    }
    if let Some(v) = args.tile_height {
        config.tile_height = v;
    }
    if let Some(v) = args.n_fft {
        config.n_fft = v;
    }
    if let Some(v) = args.hop_ms {
        config.hop_ms = v;
    }
    if let Some(v) = args.win_ms {
        config.win_ms = v;
    }
    if let Some(v) = args.min_freq {
        config.min_freq_hz = v;
    }
    if args.max_freq.is_some() {
        config.max_freq_hz = args.max_freq;
    }
    if let Some(s) = &args.scale {
        config.frequency_scale = s.parse()?;
    }
    if let Some(s) = &args.colormap {
        config.colormap = s.parse()?;
    }
    if let Some(v) = args.dynamic_range {
        config.dynamic_range_db = v;
    }
    if let Some(s) = &args.format {
        config.image_format = s.parse()?;
    }
    if let Some(v) = args.quality {
        config.jpeg_quality = v;
    }
    if let Some(s) = &args.zoom_levels {
        config.zoom_levels = parse_zoom_levels(s)?;
    }
    if let Some(v) = args.batch_size {
        config.frame_batch_size = v;
    }
    if let Some(v) = args.max_resident_frames {
        config.max_resident_frames = v;
    }
    Ok(config)
}

/// Grow `n_fft` so the analysis window fits at `sample_rate`.
fn fit_fft_to_window(config: &mut PyramidConfig, sample_rate: u32) {
    let win_samples = (config.win_ms * sample_rate as f64 / 1000.0).round() as usize;
    let needed = smallest_fft_for(win_samples);
    if needed > config.n_fft {
        log::info!("Raising n_fft from {} to {} to hold a {} ms window", config.n_fft, needed, config.win_ms);
        config.n_fft = needed;
    }
}

// ─── Generate ────────────────────────────────────────────────────

fn read_events(path: &Path) -> Result<Vec<DetectionEvent>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read events: {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Malformed events: {}", path.display()))
}

fn run_generate(args: GenerateArgs) -> Result<()> {
    let mut config = build_config(&args)?;
    let events = match &args.events {
        Some(path) => read_events(path)?,
        None => Vec::new(),
    };

    log::info!("Decoding {}", args.input.display());
    let (samples, sample_rate) = decode_audio(&args.input)?;
    log::info!(
        "Decoded {} samples at {} Hz ({:.1}s)",
        samples.len(),
        sample_rate,
        samples.len() as f64 / sample_rate.max(1) as f64
    );

    if args.auto_fft {
        fit_fft_to_window(&mut config, sample_rate);
    }

    let pcm = PcmBuffer::new(&samples, sample_rate)?;
    let mut generator = PyramidGenerator::new(config)?
        .with_progress(LogProgress)
        .with_namespace(args.namespace.clone())
        .with_events(events);
    if let Some(prefix) = &args.prefix {
        generator = generator.with_key_prefix(prefix.clone());
    }

    match &args.archive {
        Some(path) => {
            let mut sink = ZipTileSink::new(path);
            let index = generate(&mut generator, &pcm, &mut sink)?;
            let json = serde_json::to_vec_pretty(&index)?;
            let index_path = path.with_extension("json");
            atomic_write(&index_path, &json)?;
            log::info!("{} tiles in {}, index at {}", sink.entries(), path.display(), index_path.display());
        }
        None => {
            let mut sink = FsTileSink::new(&args.output_dir);
            let index = generate(&mut generator, &pcm, &mut sink)?;
            let json = serde_json::to_vec_pretty(&index)?;
            let index_path = args.output_dir.join(&index.key_prefix).join("index.json");
            atomic_write(&index_path, &json)?;
            log::info!(
                "{} tiles under {}, index at {}",
                index.total_tiles,
                args.output_dir.join(&index.key_prefix).display(),
                index_path.display()
            );
        }
    }
    Ok(())
}

fn generate(generator: &mut PyramidGenerator, pcm: &PcmBuffer<'_>, sink: &mut dyn TileSink) -> Result<PyramidIndex> {
    let index = generator.generate(pcm, sink)?;
    for level in &index.levels {
        log::info!(
            "  zoom {}: {}x{} px, {}x{} tiles",
            level.zoom,
            level.width,
            level.height,
            level.tiles_x,
            level.tiles_y
        );
    }
    Ok(index)
}

// ─── Bounds ──────────────────────────────────────────────────────

fn read_index(path: &Path) -> Result<PyramidIndex> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read index: {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Malformed index: {}", path.display()))
}

fn run_bounds(args: BoundsArgs) -> Result<()> {
    let index = read_index(&args.index)?;
    let Some(bounds) = tile_bounds(&index, args.zoom, args.x, args.y) else {
        bail!("No tile {}/{}/{} in {}", args.zoom, args.x, args.y, args.index.display());
    };
    println!("{}", serde_json::to_string_pretty(&bounds)?);
    Ok(())
}

fn print_default_config() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&PyramidConfig::default())?);
    Ok(())
}
