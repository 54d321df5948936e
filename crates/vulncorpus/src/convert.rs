//! Per-repository conversion: OSV entries in, vulnerability and revision
//! records out.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Result;
use chrono::DateTime;
use thiserror::Error;
use tracing::{info, warn};
use vulncorpus_cache::{CacheItem, VersionInfo};
use vulncorpus_git::{GitError, RepoGateway};
use vulncorpus_osv::OsvVulnerability;
use vulncorpus_solver::{cache_key, solve_hitting_set, SolverError};

use crate::models::{RevisionRecord, VulnerabilityRecord};

/// Outcome classification for one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConversionStatus {
    Ok,
    RepoNotFound,
    GitRuntimeError,
    LinguistError,
}

impl ConversionStatus {
    pub const ALL: [ConversionStatus; 4] = [
        ConversionStatus::Ok,
        ConversionStatus::RepoNotFound,
        ConversionStatus::GitRuntimeError,
        ConversionStatus::LinguistError,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            ConversionStatus::Ok => "OK",
            ConversionStatus::RepoNotFound => "REPO_NOT_FOUND",
            ConversionStatus::GitRuntimeError => "GIT_RUNTIME_ERROR",
            ConversionStatus::LinguistError => "LINGUIST_ERROR",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ConversionStatus::Ok => "converted successfully",
            ConversionStatus::RepoNotFound => "repository isn't accessible anymore",
            ConversionStatus::GitRuntimeError => "runtime error while cloning or reading the repo",
            ConversionStatus::LinguistError => "error running the language classifier",
        }
    }
}

impl std::fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of converting one repository. On a non-OK status the record lists
/// are empty, but the cache keeps whatever resolutions were made before the
/// failure.
#[derive(Debug)]
pub struct RepoConversion {
    pub vulns: Vec<VulnerabilityRecord>,
    pub revisions: Vec<RevisionRecord>,
    pub cache: CacheItem,
    pub status: ConversionStatus,
}

#[derive(Debug, Error)]
enum ConvertError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Solver(#[from] SolverError),
}

/// Convert all OSV entries of one repository.
///
/// Gateway failures classify into the status code and discard partial
/// records; a solver failure is fatal to the whole run and propagates.
pub fn convert_repo<G: RepoGateway>(
    repo_url: &str,
    entries: &[OsvVulnerability],
    cache: CacheItem,
    existing_revisions: &[RevisionRecord],
    gateway: &mut G,
) -> Result<RepoConversion> {
    let mut cache = cache;
    match convert_repo_inner(repo_url, entries, &mut cache, existing_revisions, gateway) {
        Ok((vulns, revisions)) => Ok(RepoConversion {
            vulns,
            revisions,
            cache,
            status: ConversionStatus::Ok,
        }),
        Err(ConvertError::Git(e)) => {
            let status = match &e {
                GitError::RepoNotFound { .. } => ConversionStatus::RepoNotFound,
                GitError::Runtime(_) => ConversionStatus::GitRuntimeError,
                GitError::Linguist(_) => ConversionStatus::LinguistError,
            };
            warn!("skipping {repo_url}: {e}");
            Ok(RepoConversion {
                vulns: Vec::new(),
                revisions: Vec::new(),
                cache,
                status,
            })
        }
        Err(ConvertError::Solver(e)) => Err(e.into()),
    }
}

fn convert_repo_inner<G: RepoGateway>(
    repo_url: &str,
    entries: &[OsvVulnerability],
    cache: &mut CacheItem,
    existing_revisions: &[RevisionRecord],
    gateway: &mut G,
) -> Result<(Vec<VulnerabilityRecord>, Vec<RevisionRecord>), ConvertError> {
    // Entries without affected versions or marked withdrawn contribute
    // nothing to the corpus.
    let mut survivors: Vec<(&OsvVulnerability, Vec<String>)> = Vec::new();
    for entry in entries {
        if entry.is_withdrawn() {
            info!(id = %entry.id, "filtered out withdrawn entry");
            continue;
        }
        let affected = entry.affected_versions();
        if affected.is_empty() {
            info!(id = %entry.id, "filtered out entry without affected versions");
            continue;
        }
        survivors.push((entry, affected));
    }
    if survivors.is_empty() {
        info!("no OSV entries with affected versions for {repo_url}, skipping");
        return Ok((Vec::new(), Vec::new()));
    }

    let mut all_versions: BTreeSet<String> = survivors
        .iter()
        .flat_map(|(_, affected)| affected.iter().cloned())
        .collect();

    // Resolve each version through the cache; the first miss triggers the
    // clone inside the gateway.
    for version in &all_versions {
        if cache.versions_info.contains_key(version) {
            continue;
        }
        let info = gateway.resolve_version(version)?;
        cache.versions_info.insert(
            version.clone(),
            info.map(|(commit, date)| VersionInfo { commit, date }),
        );
    }

    let unresolved: BTreeSet<String> = all_versions
        .iter()
        .filter(|v| matches!(cache.versions_info.get(*v), Some(None)))
        .cloned()
        .collect();
    if !unresolved.is_empty() {
        info!(
            "filtered out {}/{} versions not known to git: {unresolved:?}",
            unresolved.len(),
            all_versions.len()
        );
        for (_, affected) in &mut survivors {
            affected.retain(|v| !unresolved.contains(v));
        }
        survivors.retain(|(_, affected)| !affected.is_empty());
        all_versions.retain(|v| !unresolved.contains(v));
        if survivors.is_empty() {
            info!("no resolvable versions for {repo_url}, skipping");
            return Ok((Vec::new(), Vec::new()));
        }
    }

    let version_dates: BTreeMap<String, i64> = all_versions
        .iter()
        .map(|v| {
            let info = cache.versions_info[v]
                .as_ref()
                .expect("unresolved versions were filtered out");
            (v.clone(), info.date)
        })
        .collect();

    let lists: Vec<Vec<String>> = survivors
        .iter()
        .map(|(_, affected)| affected.clone())
        .collect();
    let hitting_set = solve_with_cache(&lists, &version_dates, cache)?;
    info!("minimum hitting set for {repo_url}: {hitting_set:?}");

    let revisions_by_version =
        materialize_revisions(repo_url, &hitting_set, cache, existing_revisions, gateway)?;

    let mut vulns = Vec::new();
    for (entry, affected) in &survivors {
        let commits: Vec<String> = hitting_set
            .iter()
            .filter(|v| affected.contains(v))
            .map(|v| revisions_by_version[v].commit.clone())
            .collect();
        vulns.push(VulnerabilityRecord::new(
            entry.id.clone(),
            entry.published,
            entry.modified,
            entry.details.clone(),
            entry.summary.clone(),
            entry.severity.clone(),
            repo_url.to_string(),
            entry.cwes(),
            commits,
        ));
    }

    // Two version strings can resolve to the same commit; the revision table
    // is keyed by commit.
    let mut seen = BTreeSet::new();
    let mut revisions = Vec::new();
    for revision in revisions_by_version.into_values() {
        if seen.insert(revision.commit.clone()) {
            revisions.push(revision);
        }
    }
    Ok((vulns, revisions))
}

/// Revisions for every version of the hitting set, reusing records already in
/// the store so unchanged commits are never re-measured.
fn materialize_revisions<G: RepoGateway>(
    repo_url: &str,
    hitting_set: &[String],
    cache: &CacheItem,
    existing_revisions: &[RevisionRecord],
    gateway: &mut G,
) -> Result<BTreeMap<String, RevisionRecord>, ConvertError> {
    let existing_by_commit: HashMap<&str, &RevisionRecord> = existing_revisions
        .iter()
        .map(|revision| (revision.commit.as_str(), revision))
        .collect();

    let mut revisions = BTreeMap::new();
    for version in hitting_set {
        let info = cache.versions_info[version]
            .as_ref()
            .expect("hitting set only contains resolved versions");
        if let Some(existing) = existing_by_commit.get(info.commit.as_str()) {
            revisions.insert(version.clone(), (*existing).clone());
            continue;
        }
        info!("computing code sizes for version {version:?}");
        let (languages, size) = gateway.measure_sizes(&info.commit)?;
        revisions.insert(
            version.clone(),
            RevisionRecord {
                commit: info.commit.clone(),
                repo_url: repo_url.to_string(),
                date: DateTime::from_timestamp(info.date, 0).unwrap_or_default(),
                languages,
                size,
            },
        );
    }
    Ok(revisions)
}

/// Solve the hitting set, or reuse the answer memoized under the canonical
/// argument hash.
fn solve_with_cache(
    lists: &[Vec<String>],
    version_dates: &BTreeMap<String, i64>,
    cache: &mut CacheItem,
) -> Result<Vec<String>, SolverError> {
    let key = cache_key(lists, version_dates);
    if let Some(solution) = cache.hitting_set_results.get(&key) {
        info!("hitting set solution found in cache");
        return Ok(solution.clone());
    }
    let solution = solve_hitting_set(lists, version_dates)?;
    cache.hitting_set_results.insert(key, solution.clone());
    Ok(solution)
}
