//! JSON flat-file export and import.
//!
//! The exported tree is meant to be tracked by git, so files are pretty-
//! printed with a trailing newline and field order is fixed by the record
//! structs.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::models::{RevisionRecord, VulnerabilityRecord};
use crate::store::{DateWindow, RecordStore};

/// Directory name for a repository: scheme stripped, host and path segments
/// joined with underscores.
pub fn repo_url_to_name(repo_url: &str) -> String {
    let without_scheme = repo_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(repo_url);
    without_scheme
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Write every record in the store to `vulns/<repo_name>/<id>.json` and
/// `revisions/<repo_name>/<commit>.json`.
pub fn export_store(store: &RecordStore, vulns_dir: &Path, revisions_dir: &Path) -> Result<()> {
    let mut vuln_count = 0usize;
    let mut revision_count = 0usize;
    for repo_url in store.repo_urls(DateWindow::default())? {
        let repo_name = repo_url_to_name(&repo_url);

        let vuln_dir = vulns_dir.join(&repo_name);
        std::fs::create_dir_all(&vuln_dir)
            .with_context(|| format!("failed to create {}", vuln_dir.display()))?;
        for record in store.vulns_for_repo(&repo_url, DateWindow::default())? {
            write_json(&vuln_dir.join(format!("{}.json", record.id)), &record)?;
            vuln_count += 1;
        }

        let revision_dir = revisions_dir.join(&repo_name);
        std::fs::create_dir_all(&revision_dir)
            .with_context(|| format!("failed to create {}", revision_dir.display()))?;
        for record in store.revisions_for_repo(&repo_url)? {
            write_json(&revision_dir.join(format!("{}.json", record.commit)), &record)?;
            revision_count += 1;
        }
    }
    info!("exported {vuln_count} vulnerabilities and {revision_count} revisions");
    Ok(())
}

/// Read an exported tree back and replace each repository's records in the
/// store. Round-trips with `export_store`.
pub fn import_tree(store: &mut RecordStore, vulns_dir: &Path, revisions_dir: &Path) -> Result<()> {
    let mut vulns_by_repo: BTreeMap<String, Vec<VulnerabilityRecord>> = BTreeMap::new();
    for record in read_tree::<VulnerabilityRecord>(vulns_dir)? {
        vulns_by_repo
            .entry(record.repo_url.clone())
            .or_default()
            .push(record);
    }
    let mut revisions_by_repo: BTreeMap<String, Vec<RevisionRecord>> = BTreeMap::new();
    for record in read_tree::<RevisionRecord>(revisions_dir)? {
        revisions_by_repo
            .entry(record.repo_url.clone())
            .or_default()
            .push(record);
    }

    let repo_urls: std::collections::BTreeSet<String> = vulns_by_repo
        .keys()
        .chain(revisions_by_repo.keys())
        .cloned()
        .collect();
    for repo_url in &repo_urls {
        let vulns = vulns_by_repo.remove(repo_url).unwrap_or_default();
        let revisions = revisions_by_repo.remove(repo_url).unwrap_or_default();
        store.replace_repo(repo_url, &vulns, &revisions)?;
    }
    info!("imported records for {} repos", repo_urls.len());
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut json = serde_json::to_string_pretty(record)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    json.push('\n');
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn read_tree<T: serde::de::DeserializeOwned>(root: &Path) -> Result<Vec<T>> {
    let mut records = Vec::new();
    if !root.is_dir() {
        return Ok(records);
    }
    for repo_entry in
        std::fs::read_dir(root).with_context(|| format!("failed to list {}", root.display()))?
    {
        let repo_dir = repo_entry?.path();
        if !repo_dir.is_dir() {
            continue;
        }
        for file_entry in std::fs::read_dir(&repo_dir)
            .with_context(|| format!("failed to list {}", repo_dir.display()))?
        {
            let path = file_entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let record: T = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(secs: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn repo_names_strip_scheme_and_join_segments() {
        assert_eq!(
            repo_url_to_name("https://github.com/example/repo"),
            "github.com_example_repo"
        );
        assert_eq!(
            repo_url_to_name("https://gitlab.com/group/sub/project/"),
            "gitlab.com_group_sub_project"
        );
        assert_eq!(repo_url_to_name("github.com/example/repo"), "github.com_example_repo");
    }

    #[test]
    fn export_then_import_round_trips() {
        let repo_url = "https://github.com/example/repo";
        let commit = "a".repeat(40);
        let vuln = VulnerabilityRecord::new(
            "CVE-1".to_string(),
            ts(1_000),
            ts(2_000),
            "Details.".to_string(),
            Some("Summary.".to_string()),
            None,
            repo_url.to_string(),
            vec!["CWE-79".to_string()],
            vec![commit.clone()],
        );
        let revision = RevisionRecord {
            commit: commit.clone(),
            repo_url: repo_url.to_string(),
            date: ts(500),
            languages: BTreeMap::from([("Python".to_string(), 42)]),
            size: 42,
        };

        let mut store = RecordStore::open_in_memory().unwrap();
        store
            .replace_repo(repo_url, &[vuln.clone()], &[revision.clone()])
            .unwrap();

        let dir = tempdir().unwrap();
        let vulns_dir = dir.path().join("vulns");
        let revisions_dir = dir.path().join("revisions");
        export_store(&store, &vulns_dir, &revisions_dir).unwrap();

        assert!(vulns_dir
            .join("github.com_example_repo")
            .join("CVE-1.json")
            .exists());
        assert!(revisions_dir
            .join("github.com_example_repo")
            .join(format!("{commit}.json"))
            .exists());

        // Wipe: import into a fresh store.
        let mut fresh = RecordStore::open_in_memory().unwrap();
        import_tree(&mut fresh, &vulns_dir, &revisions_dir).unwrap();

        assert_eq!(
            fresh.vulns_for_repo(repo_url, DateWindow::default()).unwrap(),
            vec![vuln]
        );
        assert_eq!(fresh.revisions_for_repo(repo_url).unwrap(), vec![revision]);
    }

    #[test]
    fn exported_files_end_with_a_newline() {
        let repo_url = "https://github.com/example/repo";
        let mut store = RecordStore::open_in_memory().unwrap();
        let vuln = VulnerabilityRecord::new(
            "CVE-1".to_string(),
            ts(1_000),
            ts(2_000),
            "Details.".to_string(),
            None,
            None,
            repo_url.to_string(),
            vec![],
            vec![],
        );
        store.replace_repo(repo_url, &[vuln], &[]).unwrap();

        let dir = tempdir().unwrap();
        export_store(&store, &dir.path().join("vulns"), &dir.path().join("revisions")).unwrap();
        let content = std::fs::read_to_string(
            dir.path()
                .join("vulns/github.com_example_repo/CVE-1.json"),
        )
        .unwrap();
        assert!(content.ends_with("}\n"));
    }

    #[test]
    fn import_of_missing_tree_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut store = RecordStore::open_in_memory().unwrap();
        import_tree(&mut store, &dir.path().join("vulns"), &dir.path().join("revisions")).unwrap();
        assert!(store.repo_urls(DateWindow::default()).unwrap().is_empty());
    }
}
