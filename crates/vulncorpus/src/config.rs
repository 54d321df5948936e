//! TOML configuration.
//!
//! The config value is loaded once in `main` and passed explicitly through
//! constructors; derived paths hang off it rather than off globals.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// OSV ecosystems to download and convert (e.g. "PyPI", "npm").
    pub ecosystems: Vec<String>,
    /// Repo URL domains allowed into the corpus.
    pub supported_domains: Vec<String>,
    /// Directory holding the conversion cache blob and the downloaded OSV
    /// tree.
    pub cache_path: PathBuf,
    /// Debounce interval for cache writes, in seconds.
    pub cache_write_interval: u64,
    /// Scratch space for per-repo clones.
    pub workdir: PathBuf,
    /// Language classifier executable.
    #[serde(default = "default_linguist_command")]
    pub linguist_command: String,
    /// Root of the exported JSON file tree.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory holding the SQLite database.
    #[serde(default = "default_db_dir")]
    pub db_dir: PathBuf,
}

fn default_linguist_command() -> String {
    "github-linguist".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_db_dir() -> PathBuf {
    PathBuf::from("db")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// Create the directories the pipeline writes into. The data tree is
    /// created lazily by the export step instead.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.cache_path, &self.osv_dir(), &self.workdir, &self.db_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Downloaded OSV tree: `<cache_path>/osv/<ecosystem>/<id>.json`.
    pub fn osv_dir(&self) -> PathBuf {
        self.cache_path.join("osv")
    }

    /// The conversion cache blob.
    pub fn cache_file(&self) -> PathBuf {
        self.cache_path.join("cache.json")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir.join("vulncorpus.db")
    }

    pub fn vulns_dir(&self) -> PathBuf {
        self.data_dir.join("vulns")
    }

    pub fn revisions_dir(&self) -> PathBuf {
        self.data_dir.join("revisions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
ecosystems = ["PyPI", "npm"]
supported_domains = ["github.com", "gitlab.com"]
cache_path = "/tmp/vulncorpus-cache"
cache_write_interval = 300
workdir = "/tmp/vulncorpus-work"
"#;

    #[test]
    fn parses_config_with_defaults() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.ecosystems, vec!["PyPI", "npm"]);
        assert_eq!(config.cache_write_interval, 300);
        assert_eq!(config.linguist_command, "github-linguist");
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.db_dir, PathBuf::from("db"));
    }

    #[test]
    fn derived_paths() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(
            config.osv_dir(),
            PathBuf::from("/tmp/vulncorpus-cache/osv")
        );
        assert_eq!(
            config.cache_file(),
            PathBuf::from("/tmp/vulncorpus-cache/cache.json")
        );
        assert_eq!(config.db_path(), PathBuf::from("db/vulncorpus.db"));
        assert_eq!(config.vulns_dir(), PathBuf::from("data/vulns"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vulncorpus.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.supported_domains.len(), 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load(Path::new("/no/such/config.toml")).is_err());
    }
}
