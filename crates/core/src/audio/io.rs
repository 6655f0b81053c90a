//! Audio I/O: decode recordings to mono f32 PCM, write test WAVs.
//!
//! Decoding never resamples; the native sample rate is returned alongside the
//! samples and the pyramid is analysed at that rate.

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

/// Average interleaved frames down to one channel.
fn downmix(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

/// Read a WAV file and return (mono samples in [-1, 1], sample_rate).
///
/// - Normalizes integer WAVs by their bit depth
/// - Passes through float WAVs
/// - Averages all channels
pub fn read_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("Failed to read WAV samples")?
        }
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read WAV samples")?,
    };

    let mut mono = Vec::with_capacity(interleaved.len() / channels);
    downmix(&interleaved, channels, &mut mono);
    Ok((mono, spec.sample_rate))
}

/// Write mono f32 samples to a 16-bit PCM WAV file.
///
/// Clips values to [-1, 1]. Creates parent directories if needed.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;
    for &sample in samples {
        let clipped = sample.clamp(-1.0, 1.0);
        writer.write_sample((clipped * i16::MAX as f32) as i16)?;
    }
    writer.finalize().context("Failed to finalize WAV file")?;
    Ok(())
}

/// Decode any supported recording (WAV, FLAC, MP3, MP4/AAC) to mono f32.
///
/// WAV goes through hound; everything else through symphonia's first audio
/// track. Returns `(samples, native_sample_rate)`.
pub fn decode_audio(path: &Path) -> Result<(Vec<f32>, u32)> {
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);
    if is_wav {
        match read_wav(path) {
            Ok(decoded) => return Ok(decoded),
            // Extensible WAV variants hound rejects still decode via symphonia.
            Err(e) => log::debug!("hound could not read {}: {:#}", path.display(), e),
        }
    }
    decode_with_symphonia(path)
}

fn decode_with_symphonia(path: &Path) -> Result<(Vec<f32>, u32)> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
    use symphonia::core::errors::Error as SymphError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let file = std::fs::File::open(path).with_context(|| format!("Failed to open: {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .with_context(|| format!("Unsupported format: {}", path.display()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("No audio track found")?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("Unsupported codec")?;

    let mut mono: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                if sample_rate.is_none() {
                    sample_rate = Some(spec.rate);
                }
                let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                sample_buf.copy_interleaved_ref(decoded);
                downmix(sample_buf.samples(), spec.channels.count(), &mut mono);
            }
            Err(SymphError::DecodeError(e)) => {
                log::debug!("Skipping undecodable packet in {}: {}", path.display(), e);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if mono.is_empty() {
        anyhow::bail!("No audio decoded from {}", path.display());
    }
    let sample_rate = sample_rate.with_context(|| format!("Unknown sample rate: {}", path.display()))?;
    Ok((mono, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.wav");
        let samples: Vec<f32> = (0..1000)
            .map(|i| (i as f32 / 1000.0 * std::f32::consts::TAU).sin() * 0.5)
            .collect();
        write_wav(&path, &samples, 16000).unwrap();

        let (read, sr) = read_wav(&path).unwrap();
        assert_eq!(sr, 16000);
        assert_eq!(read.len(), samples.len());
        // 16-bit quantization introduces small error
        for (a, b) in samples.iter().zip(read.iter()) {
            assert!((a - b).abs() < 0.001, "sample mismatch: {} vs {}", a, b);
        }
    }

    #[test]
    fn test_write_clips_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clipping.wav");
        write_wav(&path, &[-2.0, 0.0, 2.0], 8000).unwrap();
        let (read, _) = read_wav(&path).unwrap();
        assert!(read[0] >= -1.0 && read[0] <= -0.99);
        assert!(read[2] >= 0.99 && read[2] <= 1.0);
    }

    #[test]
    fn test_read_wav_averages_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(16384i16).unwrap(); // left 0.5
            writer.write_sample(0i16).unwrap(); // right 0
        }
        writer.finalize().unwrap();

        let (mono, sr) = read_wav(&path).unwrap();
        assert_eq!(sr, 44100);
        assert_eq!(mono.len(), 100);
        assert!(mono.iter().all(|&s| (s - 0.25).abs() < 1e-4), "got {}", mono[0]);
    }

    #[test]
    fn test_decode_audio_keeps_native_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..22050).map(|i| ((i as f32) * 0.05).sin() * 0.3).collect();
        write_wav(&path, &samples, 22050).unwrap();

        let (decoded, sr) = decode_audio(&path).unwrap();
        assert_eq!(sr, 22050);
        assert_eq!(decoded.len(), 22050);
    }

    #[test]
    fn test_decode_audio_missing_file() {
        assert!(decode_audio(Path::new("/nonexistent/recording.mp3")).is_err());
    }
}
