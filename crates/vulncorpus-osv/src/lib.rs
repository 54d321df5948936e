//! OSV schema model and repository extraction.
//!
//! Parses entries from the osv.dev dataset into a strict top-level model
//! (extra fields are tolerated silently) and extracts the canonical upstream
//! repository URL and the affected version strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

mod loader;

pub use loader::{domain_occurrences, group_by_repo, load_osv_tree};

/// Hosts a reference link may be resolved against when no affected range
/// carries an explicit repo URL.
const CODE_HOSTS: &[&str] = &[
    "github.com",
    "gitlab.com",
    "bitbucket.org",
    "codeberg.org",
    "gitea.com",
];

/// One vulnerability entry in the OSV schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsvVulnerability {
    pub id: String,
    pub published: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Present when the publisher retracted the entry; such entries are
    /// excluded from conversion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawn: Option<DateTime<Utc>>,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Vec<Severity>>,
    #[serde(default)]
    pub affected: Vec<Affected>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<Vec<Reference>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_specific: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Affected {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Vec<Range>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Range {
    #[serde(rename = "type")]
    pub range_type: String,
    /// Clone URL of the package's code repository, for GIT ranges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub introduced: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_affected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "type")]
    pub reference_type: String,
    pub url: String,
}

/// Severity is carried through opaquely: stored and re-emitted, never
/// interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Severity {
    #[serde(rename = "type")]
    pub severity_type: String,
    pub score: String,
}

/// Where an entry's repository URL came from. Precedence is fixed: an
/// affected GIT range always beats a reference link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoRef {
    AffectedRange(String),
    ReferenceLink(String),
}

impl RepoRef {
    pub fn url(&self) -> &str {
        match self {
            RepoRef::AffectedRange(url) | RepoRef::ReferenceLink(url) => url,
        }
    }
}

impl OsvVulnerability {
    pub fn is_withdrawn(&self) -> bool {
        self.withdrawn.is_some()
    }

    /// Union of explicit affected versions, in document order, deduplicated.
    pub fn affected_versions(&self) -> Vec<String> {
        let mut versions = Vec::new();
        for affected in &self.affected {
            for version in affected.versions.iter().flatten() {
                if !versions.contains(version) {
                    versions.push(version.clone());
                }
            }
        }
        versions
    }

    /// CWE identifiers from `database_specific.cwe_ids`, deduplicated and
    /// sorted.
    pub fn cwes(&self) -> Vec<String> {
        let mut cwes: Vec<String> = self
            .database_specific
            .as_ref()
            .and_then(|ds| ds.get("cwe_ids"))
            .and_then(|ids| ids.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        cwes.sort();
        cwes.dedup();
        cwes
    }

    /// Extract the repository this entry refers to.
    ///
    /// First GIT range carrying a repo URL wins, in document order; later
    /// disagreeing ranges are logged. With no usable range, the first
    /// reference link pointing at a known code host is truncated to its
    /// `scheme://host/org/repo` root.
    pub fn repo_ref(&self) -> Option<RepoRef> {
        let mut from_ranges: Option<String> = None;
        for affected in &self.affected {
            for range in affected.ranges.iter().flatten() {
                if range.range_type != "GIT" {
                    continue;
                }
                if let Some(repo) = &range.repo {
                    let repo = repo.trim_end_matches('/').to_string();
                    match &from_ranges {
                        None => from_ranges = Some(repo),
                        Some(first) if *first != repo => {
                            warn!(
                                id = %self.id,
                                first = %first,
                                other = %repo,
                                "entry references multiple repos; keeping the first"
                            );
                        }
                        Some(_) => {}
                    }
                }
            }
        }
        if let Some(url) = from_ranges {
            return Some(RepoRef::AffectedRange(url));
        }
        for reference in self.references.iter().flatten() {
            if let Some(root) = repo_root_from_link(&reference.url) {
                return Some(RepoRef::ReferenceLink(root));
            }
        }
        None
    }
}

/// Host portion of a repository URL, used against the domain allow-list.
pub fn get_domain(repo_url: &str) -> Option<String> {
    Url::parse(repo_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}

/// Truncate a link on a known code host down to the repository root.
fn repo_root_from_link(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    let host = url.host_str()?;
    if !CODE_HOSTS.contains(&host) {
        return None;
    }
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let org = segments.next()?;
    let repo = segments.next()?.trim_end_matches(".git");
    if repo.is_empty() {
        return None;
    }
    Some(format!("https://{host}/{org}/{repo}"))
}
