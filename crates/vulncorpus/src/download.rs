//! Downloading OSV archives.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use ureq::Agent;

use crate::config::Config;

const OSV_ARCHIVE_BASE: &str = "https://osv-vulnerabilities.storage.googleapis.com";

/// Archives can run to hundreds of megabytes.
const MAX_ARCHIVE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

fn archive_url(ecosystem: &str) -> String {
    format!("{OSV_ARCHIVE_BASE}/{ecosystem}/all.zip")
}

/// Fetch and unzip `all.zip` for every configured ecosystem into
/// `<osv_dir>/<ecosystem>/`.
pub fn download_all(config: &Config) -> Result<()> {
    let agent: Agent = Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(30)))
        .build()
        .new_agent();

    for ecosystem in &config.ecosystems {
        let url = archive_url(ecosystem);
        info!("downloading data for {ecosystem}");
        let mut response = agent
            .get(&url)
            .call()
            .with_context(|| format!("failed to download {url}"))?;
        let bytes = response
            .body_mut()
            .with_config()
            .limit(MAX_ARCHIVE_BYTES)
            .read_to_vec()
            .with_context(|| format!("failed to read archive body from {url}"))?;

        let destination = config.osv_dir().join(ecosystem);
        std::fs::create_dir_all(&destination)
            .with_context(|| format!("failed to create {}", destination.display()))?;
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .with_context(|| format!("failed to read archive for {ecosystem}"))?;
        archive
            .extract(&destination)
            .with_context(|| format!("failed to extract archive into {}", destination.display()))?;
        info!(
            "extracted {} entries for {ecosystem} into {}",
            archive.len(),
            destination.display()
        );
    }
    Ok(())
}
