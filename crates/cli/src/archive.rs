//! Tile sink that packs a pyramid into a single zip archive.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use sonotile_core::TileSink;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Writes tiles into `{path}.partial` and renames it to `path` on commit.
///
/// The partial file only exists between `begin` and `commit`/`abort`, so a
/// run rejected before it starts leaves nothing on disk. Encoded tiles are
/// already compressed, so entries are stored.
pub struct ZipTileSink {
    path: PathBuf,
    partial: PathBuf,
    writer: Option<ZipWriter<File>>,
    entries: usize,
}

impl ZipTileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        Self {
            path,
            partial: PathBuf::from(partial),
            writer: None,
            entries: 0,
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    fn discard_partial(&mut self) -> Result<()> {
        self.writer.take();
        if self.partial.exists() {
            std::fs::remove_file(&self.partial)
                .with_context(|| format!("Failed to remove {}", self.partial.display()))?;
        }
        Ok(())
    }
}

impl TileSink for ZipTileSink {
    fn begin(&mut self, _prefix: &str) -> Result<()> {
        self.discard_partial()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let file = File::create(&self.partial)
            .with_context(|| format!("Failed to create archive: {}", self.partial.display()))?;
        self.writer = Some(ZipWriter::new(file));
        self.entries = 0;
        Ok(())
    }

    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().context("Archive not open")?;
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        writer
            .start_file(key, options)
            .with_context(|| format!("Failed to add {} to archive", key))?;
        writer.write_all(bytes)?;
        self.entries += 1;
        Ok(())
    }

    fn commit(&mut self, _prefix: &str) -> Result<()> {
        let writer = self.writer.take().context("Archive not open")?;
        writer.finish().context("Failed to finish archive")?;
        std::fs::rename(&self.partial, &self.path)
            .with_context(|| format!("Failed to publish {}", self.path.display()))?;
        log::info!("Created {}", self.path.display());
        Ok(())
    }

    fn abort(&mut self, _prefix: &str) -> Result<()> {
        self.discard_partial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonotile_core::{CancelToken, PcmBuffer, PyramidConfig, PyramidError, PyramidGenerator};

    #[test]
    fn test_commit_publishes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("tiles.zip");
        let mut sink = ZipTileSink::new(&path);
        sink.begin("p").unwrap();
        sink.put("p/0/0/0.jpg", b"tile").unwrap();
        sink.put("p/0/1/0.jpg", b"more").unwrap();
        assert!(!path.exists());

        sink.commit("p").unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("out/tiles.zip.partial").exists());

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut entry = archive.by_name("p/0/0/0.jpg").unwrap();
        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut data).unwrap();
        assert_eq!(data, b"tile");
    }

    #[test]
    fn test_abort_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.zip");
        let mut sink = ZipTileSink::new(&path);
        sink.begin("p").unwrap();
        sink.put("p/0/0/0.jpg", b"tile").unwrap();
        sink.abort("p").unwrap();
        assert!(!path.exists());
        assert!(!dir.path().join("tiles.zip.partial").exists());
        assert!(sink.put("p/0/0/1.jpg", b"late").is_err());
    }

    #[test]
    fn test_nothing_created_before_begin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tiles.zip");
        let mut sink = ZipTileSink::new(&path);
        assert!(!dir.path().join("nested").exists());
        assert!(sink.put("p/0/0/0.jpg", b"tile").is_err());
    }

    #[test]
    fn test_rejected_run_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.zip");
        let samples = vec![0.1f32; 32000 * 10];
        let pcm = PcmBuffer::new(&samples, 32000).unwrap();
        let config = PyramidConfig { max_resident_frames: 600, ..Default::default() };
        let mut generator = PyramidGenerator::new(config).unwrap();
        let mut sink = ZipTileSink::new(&path);

        let err = generator.generate(&pcm, &mut sink).unwrap_err();
        assert!(matches!(err, PyramidError::ResourceExhausted { .. }), "got {:?}", err);
        assert!(!path.exists());
        assert!(!dir.path().join("tiles.zip.partial").exists());
    }

    #[test]
    fn test_cancelled_run_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.zip");
        let samples = vec![0.1f32; 32000];
        let pcm = PcmBuffer::new(&samples, 32000).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let mut generator = PyramidGenerator::new(PyramidConfig::default()).unwrap().with_cancel(token);
        let mut sink = ZipTileSink::new(&path);

        let err = generator.generate(&pcm, &mut sink).unwrap_err();
        assert!(matches!(err, PyramidError::Cancelled), "got {:?}", err);
        assert!(!path.exists());
        assert!(!dir.path().join("tiles.zip.partial").exists());
    }
}
