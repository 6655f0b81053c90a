//! Destinations for rendered tiles.
//!
//! A [`TileSink`] receives every tile of a run under its storage key and is
//! then told to either publish the run (`commit`) or discard it (`abort`).
//! `begin` opens the run and clears whatever an interrupted earlier run left
//! staged under the same prefix.
//! Readers never see a partial pyramid: sinks stage writes and only expose them
//! on commit. Keys are deterministic for a given recording and configuration,
//! so regenerating replaces the previous pyramid instead of duplicating it.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

use crate::config::PyramidConfig;
use crate::error::PyramidError;
use crate::pcm::PcmBuffer;
use crate::roi::DetectionEvent;

/// Blob store for tile images.
///
/// `put` may be called from a thread other than the one that created the
/// sink, hence `Send`.
pub trait TileSink: Send {
    /// Start a run under `prefix`, discarding anything already staged there.
    fn begin(&mut self, prefix: &str) -> Result<()>;

    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Publish everything written under `prefix`, replacing any earlier
    /// pyramid with the same prefix.
    fn commit(&mut self, prefix: &str) -> Result<()>;

    /// Discard everything written under `prefix` by this run.
    fn abort(&mut self, prefix: &str) -> Result<()>;
}

/// SHA-256 over the sample rate, the samples, the serialized configuration
/// and any detection events. Returns the first 16 hex characters.
pub fn pyramid_fingerprint(
    pcm: &PcmBuffer<'_>,
    config: &PyramidConfig,
    events: &[DetectionEvent],
) -> crate::error::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(pcm.sample_rate().to_le_bytes());
    for s in pcm.samples() {
        hasher.update(s.to_le_bytes());
    }
    let json = serde_json::to_vec(config)
        .map_err(|e| PyramidError::Internal(format!("failed to serialize configuration: {}", e)))?;
    hasher.update(&json);
    if !events.is_empty() {
        let json = serde_json::to_vec(events)
            .map_err(|e| PyramidError::Internal(format!("failed to serialize events: {}", e)))?;
        hasher.update(&json);
    }
    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..16].to_string())
}

/// `{namespace}/{fingerprint}`.
pub fn default_key_prefix(
    namespace: &str,
    pcm: &PcmBuffer<'_>,
    config: &PyramidConfig,
    events: &[DetectionEvent],
) -> crate::error::Result<String> {
    let fingerprint = pyramid_fingerprint(pcm, config, events)?;
    let namespace = namespace.trim_matches('/');
    if namespace.is_empty() {
        Ok(fingerprint)
    } else {
        Ok(format!("{}/{}", namespace, fingerprint))
    }
}

/// Write via temp file + rename so readers never see a half-written file.
pub fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut tmp_name = target.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = target.with_file_name(tmp_name);
    std::fs::write(&tmp_path, data).with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, target).with_context(|| format!("Failed to move into {}", target.display()))?;
    Ok(())
}

/// Turn a `/`-separated key into a relative path, refusing anything that
/// could escape the sink root.
fn key_path(key: &str) -> Result<PathBuf> {
    let path = Path::new(key);
    if key.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("invalid storage key '{}'", key);
    }
    Ok(path.to_path_buf())
}

const STAGING_DIR: &str = ".staging";
const TRASH_DIR: &str = ".trash";

/// Tiles as files under a root directory: `{root}/{key}`.
///
/// Writes go to `{root}/.staging/{key}`; commit renames the staged prefix
/// directory into place.
#[derive(Debug)]
pub struct FsTileSink {
    root: PathBuf,
    written: usize,
}

impl FsTileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), written: 0 }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files written since the sink was created.
    pub fn written(&self) -> usize {
        self.written
    }

    fn staging(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }
}

impl TileSink for FsTileSink {
    fn begin(&mut self, prefix: &str) -> Result<()> {
        let staged = self.staging().join(key_path(prefix)?);
        if staged.exists() {
            log::warn!("Discarding leftover staged tiles in {}", staged.display());
            std::fs::remove_dir_all(&staged)
                .with_context(|| format!("Failed to clear {}", staged.display()))?;
        }
        Ok(())
    }

    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.staging().join(key_path(key)?);
        atomic_write(&path, bytes)?;
        self.written += 1;
        Ok(())
    }

    fn commit(&mut self, prefix: &str) -> Result<()> {
        let rel = key_path(prefix)?;
        let staged = self.staging().join(&rel);
        let target = self.root.join(&rel);
        if !staged.exists() {
            bail!("nothing staged under '{}'", prefix);
        }

        let mut trash = None;
        if target.exists() {
            let old = self.root.join(TRASH_DIR).join(uuid::Uuid::new_v4().to_string());
            std::fs::create_dir_all(self.root.join(TRASH_DIR))?;
            std::fs::rename(&target, &old)
                .with_context(|| format!("Failed to retire previous pyramid at {}", target.display()))?;
            trash = Some(old);
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&staged, &target)
            .with_context(|| format!("Failed to publish {}", target.display()))?;
        log::debug!("Published {}", target.display());

        if let Some(old) = trash {
            if let Err(e) = std::fs::remove_dir_all(&old) {
                log::warn!("Could not remove previous pyramid {}: {}", old.display(), e);
            }
        }
        Ok(())
    }

    fn abort(&mut self, prefix: &str) -> Result<()> {
        let staged = self.staging().join(key_path(prefix)?);
        if staged.exists() {
            std::fs::remove_dir_all(&staged)
                .with_context(|| format!("Failed to discard {}", staged.display()))?;
        }
        Ok(())
    }
}

/// Keeps tiles in memory. Staged and published tiles are kept apart so
/// callers can observe all-or-nothing publication.
#[derive(Debug, Default)]
pub struct MemoryTileSink {
    staged: BTreeMap<String, Vec<u8>>,
    published: BTreeMap<String, Vec<u8>>,
    commits: usize,
    aborts: usize,
}

fn under(prefix: &str) -> impl Fn(&String) -> bool + '_ {
    let prefix = prefix.trim_end_matches('/');
    move |key: &String| key.len() > prefix.len() && key.starts_with(prefix) && key.as_bytes()[prefix.len()] == b'/'
}

impl MemoryTileSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.published
    }

    pub fn staged(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.staged
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.published.get(key).map(Vec::as_slice)
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn aborts(&self) -> usize {
        self.aborts
    }
}

impl TileSink for MemoryTileSink {
    fn begin(&mut self, prefix: &str) -> Result<()> {
        let in_prefix = under(prefix);
        self.staged.retain(|k, _| !in_prefix(k));
        Ok(())
    }

    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<()> {
        self.staged.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn commit(&mut self, prefix: &str) -> Result<()> {
        let in_prefix = under(prefix);
        self.published.retain(|k, _| !in_prefix(k));
        let keys: Vec<String> = self.staged.keys().filter(|&k| in_prefix(k)).cloned().collect();
        for key in keys {
            if let Some(bytes) = self.staged.remove(&key) {
                self.published.insert(key, bytes);
            }
        }
        self.commits += 1;
        Ok(())
    }

    fn abort(&mut self, prefix: &str) -> Result<()> {
        let in_prefix = under(prefix);
        self.staged.retain(|k, _| !in_prefix(k));
        self.aborts += 1;
        Ok(())
    }
}
