//! Parallel per-repository conversion.
//!
//! Worker threads pull repos from a shared queue and send results back over a
//! channel; the orchestrator alone writes the record store and the cache, so
//! every mutation has a single writer.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};
use vulncorpus_cache::{CacheItem, ConversionCache};
use vulncorpus_git::GitGateway;
use vulncorpus_osv::{domain_occurrences, group_by_repo, load_osv_tree, OsvVulnerability};

use crate::config::Config;
use crate::convert::{convert_repo, ConversionStatus, RepoConversion};
use crate::models::RevisionRecord;
use crate::store::RecordStore;

/// Everything a worker needs for one repository, snapshotted up front so
/// tasks share no mutable state.
struct TaskArgs {
    repo_url: String,
    entries: Vec<OsvVulnerability>,
    cache_item: CacheItem,
    existing_revisions: Vec<RevisionRecord>,
}

pub struct Converter {
    config: Config,
    cache: ConversionCache,
    store: RecordStore,
    by_repo: BTreeMap<String, Vec<OsvVulnerability>>,
}

impl Converter {
    pub fn new(config: Config) -> Result<Self> {
        let cache = ConversionCache::read(&config.cache_file())?;
        let items = load_osv_tree(&config.osv_dir(), &config.ecosystems)?;
        let by_repo = group_by_repo(items, &config.supported_domains);
        let repo_urls: Vec<String> = by_repo.keys().cloned().collect();
        for (domain, count) in domain_occurrences(&repo_urls) {
            debug!("{count} repos on {domain}");
        }
        let store = RecordStore::open(&config.db_path())?;
        Ok(Self {
            config,
            cache,
            store,
            by_repo,
        })
    }

    /// Convert every repository in the corpus, in sorted URL order.
    pub fn convert_all(&mut self) -> Result<()> {
        let repo_urls: Vec<String> = self.by_repo.keys().cloned().collect();
        self.convert_list(repo_urls)
    }

    /// Convert the slice `[start, end)` of the sorted repository list.
    pub fn convert_range(&mut self, start: usize, end: usize) -> Result<()> {
        let repo_urls: Vec<String> = self
            .by_repo
            .keys()
            .skip(start)
            .take(end.saturating_sub(start))
            .cloned()
            .collect();
        self.convert_list(repo_urls)
    }

    /// Convert a single repository.
    pub fn convert_one(&mut self, repo_url: &str) -> Result<()> {
        self.convert_list(vec![repo_url.to_string()])
    }

    fn convert_list(&mut self, repo_urls: Vec<String>) -> Result<()> {
        info!("preparing arguments for {} repos", repo_urls.len());
        let prepare_start = Instant::now();
        let mut tasks = Vec::new();
        for repo_url in &repo_urls {
            let entries = self
                .by_repo
                .get(repo_url)
                .cloned()
                .ok_or_else(|| anyhow!("unknown repository {repo_url}"))?;
            self.cache.initialize(repo_url);
            let cache_item = self.cache.get(repo_url).cloned().unwrap_or_default();
            let existing_revisions = self.store.revisions_for_repo(repo_url)?;
            tasks.push(TaskArgs {
                repo_url: repo_url.clone(),
                entries,
                cache_item,
                existing_revisions,
            });
        }
        info!(
            "arguments prepared for {} repos in {:.2}s",
            repo_urls.len(),
            prepare_start.elapsed().as_secs_f64()
        );

        let total = tasks.len();
        let interval = Duration::from_secs(self.config.cache_write_interval);
        let workdir = self.config.workdir.clone();
        let linguist_command = self.config.linguist_command.clone();
        let threads = num_cpus::get().min(total.max(1));
        let queue = Arc::new(Mutex::new(tasks.into_iter()));
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<(String, Result<RepoConversion>)>();

        info!("converting {total} repos across {threads} workers");
        let run_start = Instant::now();
        let mut by_status: BTreeMap<ConversionStatus, Vec<String>> = BTreeMap::new();
        let mut failure: Option<anyhow::Error> = None;

        thread::scope(|scope| {
            for _ in 0..threads {
                let queue = Arc::clone(&queue);
                let cancel = Arc::clone(&cancel);
                let tx = tx.clone();
                let workdir = workdir.clone();
                let linguist_command = linguist_command.clone();
                scope.spawn(move || loop {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let task = { queue.lock().unwrap().next() };
                    let Some(task) = task else { break };
                    let repo_url = task.repo_url.clone();
                    let result = run_task(task, &workdir, &linguist_command);
                    if tx.send((repo_url, result)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            for (index, (repo_url, result)) in rx.iter().enumerate() {
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        cancel.store(true, Ordering::Relaxed);
                        failure = Some(e.context(format!("error processing {repo_url}")));
                        break;
                    }
                };
                if let Err(e) = self.commit_outcome(&repo_url, outcome, interval, &mut by_status) {
                    cancel.store(true, Ordering::Relaxed);
                    failure = Some(e);
                    break;
                }
                let elapsed = run_start.elapsed().as_secs_f64();
                let eta = elapsed / (index + 1) as f64 * (total - index - 1) as f64;
                info!(
                    "({}/{total}) elapsed {elapsed:.2}s ETA {eta:.2}s, finished processing {repo_url}",
                    index + 1
                );
            }
        });

        self.cache.flush()?;
        if let Some(e) = failure {
            return Err(e);
        }
        display_statistics(&by_status, total);
        Ok(())
    }

    /// Driver-side completion handling: transactional record swap, then the
    /// equality-gated cache write.
    fn commit_outcome(
        &mut self,
        repo_url: &str,
        outcome: RepoConversion,
        interval: Duration,
        by_status: &mut BTreeMap<ConversionStatus, Vec<String>>,
    ) -> Result<()> {
        self.store
            .replace_repo(repo_url, &outcome.vulns, &outcome.revisions)
            .with_context(|| format!("failed to store records for {repo_url}"))?;
        if self.cache.get(repo_url) != Some(&outcome.cache) {
            debug!("cache updated for {repo_url}, writing");
            self.cache.set(repo_url, outcome.cache);
            self.cache.write_changed(interval)?;
        }
        by_status
            .entry(outcome.status)
            .or_default()
            .push(repo_url.to_string());
        Ok(())
    }
}

/// One worker task: scoped scratch directory, gateway, conversion. The
/// scratch directory is removed on every exit path when it drops.
fn run_task(task: TaskArgs, workdir: &Path, linguist_command: &str) -> Result<RepoConversion> {
    let scratch = tempfile::TempDir::new_in(workdir)
        .context("failed to create scratch directory under the workdir")?;
    let mut gateway =
        GitGateway::new(&task.repo_url, scratch.path()).with_linguist_command(linguist_command);
    convert_repo(
        &task.repo_url,
        &task.entries,
        task.cache_item,
        &task.existing_revisions,
        &mut gateway,
    )
}

fn display_statistics(by_status: &BTreeMap<ConversionStatus, Vec<String>>, total: usize) {
    info!("done processing repositories; statistics:");
    let ok = by_status
        .get(&ConversionStatus::Ok)
        .map(|repos| repos.len())
        .unwrap_or(0);
    info!("{ok}/{total}: OK");
    for status in ConversionStatus::ALL
        .iter()
        .filter(|status| **status != ConversionStatus::Ok)
    {
        if let Some(repos) = by_status.get(status) {
            info!(
                "{}/{total}: {} ({})",
                repos.len(),
                status.code(),
                status.describe()
            );
            info!("concerned repos: {repos:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;
    use vulncorpus_cache::VersionInfo;

    use crate::store::DateWindow;

    fn git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("failed to run git");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// Throwaway upstream with one commit tagged v1.0.0; returns its commit.
    fn upstream(dir: &Path) -> String {
        git(dir, &["init", "--quiet", "--initial-branch=main"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "user.name", "Test"]);
        std::fs::write(dir.join("lib.py"), "print('hello')\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "--quiet", "-m", "initial"]);
        git(dir, &["tag", "v1.0.0"]);
        let output = Command::new("git")
            .args(["rev-parse", "v1.0.0^{commit}"])
            .current_dir(dir)
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn test_config(root: &Path) -> Config {
        let config = Config {
            ecosystems: vec![],
            supported_domains: vec![],
            cache_path: root.join("cache"),
            cache_write_interval: 0,
            workdir: root.join("work"),
            linguist_command: "vulncorpus-test-no-linguist".to_string(),
            data_dir: root.join("data"),
            db_dir: root.join("db"),
        };
        config.ensure_dirs().unwrap();
        config
    }

    fn osv_entry(id: &str, versions: &[&str]) -> OsvVulnerability {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "published": "2024-01-01T00:00:00Z",
            "modified": "2024-01-02T00:00:00Z",
            "details": "A bug.",
            "affected": [{"versions": versions}]
        }))
        .unwrap()
    }

    fn converter(config: &Config, repo_url: &str, entries: Vec<OsvVulnerability>) -> Converter {
        let mut by_repo = BTreeMap::new();
        by_repo.insert(repo_url.to_string(), entries);
        Converter {
            config: config.clone(),
            cache: ConversionCache::read(&config.cache_file()).unwrap(),
            store: RecordStore::open(&config.db_path()).unwrap(),
            by_repo,
        }
    }

    #[test]
    fn classifier_failure_keeps_resolutions_in_the_cache() {
        let root = tempdir().unwrap();
        let origin = tempdir().unwrap();
        upstream(origin.path());
        let repo_url = origin.path().to_str().unwrap().to_string();

        let config = test_config(root.path());
        // No classifier on PATH under the default command name, so the repo
        // classifies as a linguist failure and emits nothing.
        let mut converter = converter(&config, &repo_url, vec![osv_entry("CVE-1", &["v1.0.0"])]);
        converter.convert_one(&repo_url).unwrap();

        assert!(converter
            .store
            .vulns_for_repo(&repo_url, DateWindow::default())
            .unwrap()
            .is_empty());

        // The version resolution made before the failure is on disk.
        let cache = ConversionCache::read(&config.cache_file()).unwrap();
        let item = cache.get(&repo_url).unwrap();
        assert!(matches!(
            item.versions_info.get("v1.0.0"),
            Some(Some(VersionInfo { .. }))
        ));
    }

    #[test]
    fn revision_reuse_completes_without_a_classifier() {
        let root = tempdir().unwrap();
        let origin = tempdir().unwrap();
        let commit = upstream(origin.path());
        let repo_url = origin.path().to_str().unwrap().to_string();

        let config = test_config(root.path());
        let existing = RevisionRecord {
            commit: commit.clone(),
            repo_url: repo_url.clone(),
            date: chrono::DateTime::from_timestamp(100, 0).unwrap(),
            languages: BTreeMap::from([("Python".to_string(), 17)]),
            size: 17,
        };
        let mut converter = converter(&config, &repo_url, vec![osv_entry("CVE-1", &["v1.0.0"])]);
        converter
            .store
            .replace_repo(&repo_url, &[], std::slice::from_ref(&existing))
            .unwrap();

        converter.convert_one(&repo_url).unwrap();

        let vulns = converter
            .store
            .vulns_for_repo(&repo_url, DateWindow::default())
            .unwrap();
        assert_eq!(vulns.len(), 1);
        assert_eq!(vulns[0].commits, vec![commit.clone()]);
        let revisions = converter.store.revisions_for_repo(&repo_url).unwrap();
        assert_eq!(revisions, vec![existing]);
    }

    #[test]
    fn unknown_repo_is_an_error() {
        let root = tempdir().unwrap();
        let config = test_config(root.path());
        let mut converter = converter(&config, "https://github.com/a/b", vec![]);
        assert!(converter.convert_one("https://github.com/no/such").is_err());
    }

    #[test]
    fn converting_nothing_succeeds() {
        let root = tempdir().unwrap();
        let config = test_config(root.path());
        let mut converter = converter(&config, "https://github.com/a/b", vec![]);
        converter.convert_list(vec![]).unwrap();
    }
}
