//! Output record types.
//!
//! Field order in these structs is the export format: serde emits keys in
//! declaration order, and the exported tree is tracked by git, so the order
//! is part of the contract.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vulncorpus_osv::Severity;

/// One record per OSV entry, carrying the commits of the hitting set that
/// cover it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityRecord {
    pub id: String,
    pub published: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Vec<Severity>>,
    pub repo_url: String,
    pub cwes: Vec<String>,
    pub commits: Vec<String>,
}

impl VulnerabilityRecord {
    /// `cwes` and `commits` are stored sorted and deduplicated.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        published: DateTime<Utc>,
        modified: DateTime<Utc>,
        details: String,
        summary: Option<String>,
        severity: Option<Vec<Severity>>,
        repo_url: String,
        mut cwes: Vec<String>,
        mut commits: Vec<String>,
    ) -> Self {
        cwes.sort();
        cwes.dedup();
        commits.sort();
        commits.dedup();
        Self {
            id,
            published,
            modified,
            details,
            summary,
            severity,
            repo_url,
            cwes,
            commits,
        }
    }
}

/// A specific commit of a specific repository, with its language breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub commit: String,
    pub repo_url: String,
    pub date: DateTime<Utc>,
    /// Bytes per language at this commit, according to the classifier.
    pub languages: BTreeMap<String, i64>,
    /// Sum of all language sizes in bytes.
    pub size: i64,
}
