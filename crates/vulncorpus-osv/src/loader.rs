//! Loading the on-disk OSV tree and grouping entries by repository.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::{get_domain, OsvVulnerability};

/// Read `osv_root/<ecosystem>/<file>.json` for each configured ecosystem.
///
/// A missing ecosystem directory is skipped with a warning (the download step
/// may not have fetched it yet); a malformed entry is fatal.
pub fn load_osv_tree(osv_root: &Path, ecosystems: &[String]) -> Result<Vec<OsvVulnerability>> {
    let mut items = Vec::new();
    for ecosystem in ecosystems {
        let dir = osv_root.join(ecosystem);
        if !dir.is_dir() {
            warn!("no OSV data for ecosystem {ecosystem} at {}", dir.display());
            continue;
        }
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let item: OsvVulnerability = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse OSV entry at {}", path.display()))?;
            items.push(item);
        }
    }
    info!("loaded {} OSV entries", items.len());
    Ok(items)
}

/// Group entries by repository URL, dropping repos whose domain is not in the
/// allow-list. The map is ordered, which gives the driver its sorted repo
/// ordering for free.
pub fn group_by_repo(
    items: Vec<OsvVulnerability>,
    supported_domains: &[String],
) -> BTreeMap<String, Vec<OsvVulnerability>> {
    let mut by_repo: BTreeMap<String, Vec<OsvVulnerability>> = BTreeMap::new();
    let mut unsupported = std::collections::BTreeSet::new();
    let mut no_repo = 0usize;
    for item in items {
        let repo_url = match item.repo_ref() {
            Some(repo_ref) => repo_ref.url().to_string(),
            None => {
                debug!(id = %item.id, "no repository URL could be extracted; dropping");
                no_repo += 1;
                continue;
            }
        };
        let supported = get_domain(&repo_url)
            .map(|domain| supported_domains.iter().any(|d| *d == domain))
            .unwrap_or(false);
        if !supported {
            unsupported.insert(repo_url);
            continue;
        }
        by_repo.entry(repo_url).or_default().push(item);
    }
    info!(
        "kept {} repos; {} unsupported repos filtered out, {} entries without a repo URL",
        by_repo.len(),
        unsupported.len(),
        no_repo
    );
    by_repo
}

/// Occurrences of each domain across the grouped repo URLs, most frequent
/// first.
pub fn domain_occurrences(repo_urls: &[String]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for repo_url in repo_urls {
        if let Some(domain) = get_domain(repo_url) {
            *counts.entry(domain).or_insert(0) += 1;
        }
    }
    let mut sorted: Vec<(String, usize)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    sorted
}
