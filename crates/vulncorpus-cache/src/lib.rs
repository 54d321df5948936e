//! Persistent per-repository memo of version resolutions and hitting-set
//! answers.
//!
//! The whole cache is one JSON blob on disk. Workers mutate per-repo copies;
//! the driver merges them back by replacement and is the only writer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A resolved version: full commit hash plus the authored timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub commit: String,
    pub date: i64,
}

/// Everything remembered about one repository. Resolution attempts are
/// recorded even when git doesn't know the version (`None`), so failed
/// lookups are never retried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheItem {
    #[serde(default)]
    pub versions_info: BTreeMap<String, Option<VersionInfo>>,
    #[serde(default)]
    pub hitting_set_results: BTreeMap<String, Vec<String>>,
}

/// On-disk cache, `repo_url -> CacheItem`. `BTreeMap` keeps the serialized
/// form stable so the file diffs cleanly between runs.
#[derive(Debug)]
pub struct ConversionCache {
    path: PathBuf,
    items: BTreeMap<String, CacheItem>,
    last_write: Option<Instant>,
    dirty: bool,
    /// A change was already skipped by the debounce window; the next one
    /// forces a write.
    pending: bool,
}

impl ConversionCache {
    /// Load the cache from `path`, starting empty if the file is absent.
    pub fn read(path: &Path) -> Result<Self> {
        let items = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read cache from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse cache at {}", path.display()))?
        } else {
            debug!("no cache file at {}, starting empty", path.display());
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            items,
            last_write: None,
            dirty: false,
            pending: false,
        })
    }

    /// Ensure an entry exists for `repo_url`.
    pub fn initialize(&mut self, repo_url: &str) {
        self.items.entry(repo_url.to_string()).or_default();
    }

    pub fn get(&self, repo_url: &str) -> Option<&CacheItem> {
        self.items.get(repo_url)
    }

    /// Replace the entry for `repo_url` and mark the cache as needing a
    /// write.
    pub fn set(&mut self, repo_url: &str, item: CacheItem) {
        self.items.insert(repo_url.to_string(), item);
        self.dirty = true;
    }

    /// Serialize the entire state atomically: write to a sibling temp file,
    /// then rename over the destination.
    pub fn write(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache directory {}", parent.display()))?;
        }
        let content =
            serde_json::to_string_pretty(&self.items).context("failed to serialize cache")?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write cache to {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move cache into place at {}", self.path.display()))?;
        self.last_write = Some(Instant::now());
        self.dirty = false;
        self.pending = false;
        Ok(())
    }

    /// Write if anything changed, debounced by `interval`. The disk copy is
    /// never more than one repo's progress behind: a change arriving while a
    /// previous one is still pending forces the write.
    pub fn write_changed(&mut self, interval: Duration) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let due = self
            .last_write
            .map(|at| at.elapsed() >= interval)
            .unwrap_or(true);
        if due || self.pending {
            self.write()?;
        } else {
            self.pending = true;
        }
        Ok(())
    }

    /// Flush any pending change unconditionally.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.write()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Drop for ConversionCache {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                warn!("failed to flush cache on drop: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_item() -> CacheItem {
        let mut item = CacheItem::default();
        item.versions_info.insert(
            "v1.0.0".to_string(),
            Some(VersionInfo {
                commit: "a".repeat(40),
                date: 100,
            }),
        );
        item.versions_info.insert("v9.9.9".to_string(), None);
        item.hitting_set_results
            .insert("deadbeef".to_string(), vec!["v1.0.0".to_string()]);
        item
    }

    #[test]
    fn absent_file_starts_empty() {
        let dir = tempdir().unwrap();
        let cache = ConversionCache::read(&dir.path().join("cache.json")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = ConversionCache::read(&path).unwrap();
        cache.set("https://github.com/example/repo", sample_item());
        cache.write().unwrap();

        let reloaded = ConversionCache::read(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(
            reloaded.get("https://github.com/example/repo"),
            Some(&sample_item())
        );
    }

    #[test]
    fn negative_resolutions_survive_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = ConversionCache::read(&path).unwrap();
        cache.set("r", sample_item());
        cache.write().unwrap();

        let reloaded = ConversionCache::read(&path).unwrap();
        let item = reloaded.get("r").unwrap();
        assert_eq!(item.versions_info.get("v9.9.9"), Some(&None));
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut cache = ConversionCache::read(&dir.path().join("cache.json")).unwrap();
        cache.initialize("r");
        cache.set("r", sample_item());
        cache.initialize("r");
        assert_eq!(cache.get("r"), Some(&sample_item()));
    }

    #[test]
    fn write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let mut cache = ConversionCache::read(&path).unwrap();
        cache.set("r", sample_item());
        cache.write().unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn write_changed_skips_clean_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let mut cache = ConversionCache::read(&path).unwrap();
        cache.write_changed(Duration::from_secs(0)).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn write_changed_is_at_most_one_repo_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let mut cache = ConversionCache::read(&path).unwrap();

        // First change: no previous write, flushes immediately.
        cache.set("a", sample_item());
        cache.write_changed(Duration::from_secs(3600)).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.contains("\"a\""));

        // Second change inside the debounce window: stays pending.
        cache.set("b", sample_item());
        cache.write_changed(Duration::from_secs(3600)).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert!(!second.contains("\"b\""));

        // Third change while one is pending: forced out, so the disk copy
        // lags by at most the newest repo.
        cache.set("c", sample_item());
        cache.write_changed(Duration::from_secs(3600)).unwrap();
        let third = std::fs::read_to_string(&path).unwrap();
        assert!(third.contains("\"b\""));
        assert!(third.contains("\"c\""));
    }
}
