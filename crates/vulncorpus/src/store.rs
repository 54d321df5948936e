//! SQLite persistence for vulnerability and revision records.
//!
//! Replacing a repository's records is a single transaction, so a crash
//! between repos never leaves a half-written repo behind.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use vulncorpus_osv::Severity;

use crate::models::{RevisionRecord, VulnerabilityRecord};

/// Optional half-open `[after, before)` window on `published`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateWindow {
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

pub struct RecordStore {
    conn: Connection,
}

/// Timestamps are stored as fixed-width RFC 3339 UTC strings, which makes
/// SQL range comparisons behave like date comparisons.
fn to_db_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl RecordStore {
    /// Open (or create) the database at `path` and bootstrap the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests and the import round-trip check.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS vulnerabilities (
                id TEXT PRIMARY KEY,
                published TEXT NOT NULL,
                modified TEXT NOT NULL,
                details TEXT NOT NULL,
                summary TEXT,
                severity TEXT,
                repo_url TEXT NOT NULL,
                cwes TEXT NOT NULL,
                commits TEXT NOT NULL
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_vulnerabilities_repo_url
             ON vulnerabilities(repo_url)",
            [],
        )?;
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS revisions (
                repo_url TEXT NOT NULL,
                \"commit\" TEXT NOT NULL,
                date TEXT NOT NULL,
                languages TEXT NOT NULL,
                size INTEGER NOT NULL,
                PRIMARY KEY (repo_url, \"commit\")
            )",
            [],
        )?;
        Ok(())
    }

    /// Atomically swap out all records for one repository.
    pub fn replace_repo(
        &mut self,
        repo_url: &str,
        vulns: &[VulnerabilityRecord],
        revisions: &[RevisionRecord],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM vulnerabilities WHERE repo_url = ?1",
            params![repo_url],
        )?;
        tx.execute("DELETE FROM revisions WHERE repo_url = ?1", params![repo_url])?;
        for vuln in vulns {
            tx.execute(
                "INSERT INTO vulnerabilities
                 (id, published, modified, details, summary, severity, repo_url, cwes, commits)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    vuln.id,
                    to_db_time(&vuln.published),
                    to_db_time(&vuln.modified),
                    vuln.details,
                    vuln.summary,
                    vuln.severity
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    vuln.repo_url,
                    serde_json::to_string(&vuln.cwes)?,
                    serde_json::to_string(&vuln.commits)?,
                ],
            )?;
        }
        for revision in revisions {
            tx.execute(
                "INSERT INTO revisions (repo_url, \"commit\", date, languages, size)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    revision.repo_url,
                    revision.commit,
                    to_db_time(&revision.date),
                    serde_json::to_string(&revision.languages)?,
                    revision.size,
                ],
            )?;
        }
        tx.commit().context("failed to commit repo replacement")?;
        Ok(())
    }

    pub fn vulns_for_repo(
        &self,
        repo_url: &str,
        window: DateWindow,
    ) -> Result<Vec<VulnerabilityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, published, modified, details, summary, severity, repo_url, cwes, commits
             FROM vulnerabilities
             WHERE repo_url = ?1
               AND (?2 IS NULL OR published >= ?2)
               AND (?3 IS NULL OR published < ?3)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![
                repo_url,
                window.after.as_ref().map(to_db_time),
                window.before.as_ref().map(to_db_time)
            ],
            row_to_vuln,
        )?;
        collect_rows(rows)
    }

    /// Vulnerabilities whose `commits` list contains `commit`.
    ///
    /// The SQL LIKE is only a prefilter; membership is verified on the
    /// decoded JSON array, so a commit hash embedded in another value cannot
    /// false-positive.
    pub fn vulns_by_commit(
        &self,
        commit: &str,
        window: DateWindow,
    ) -> Result<Vec<VulnerabilityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, published, modified, details, summary, severity, repo_url, cwes, commits
             FROM vulnerabilities
             WHERE commits LIKE '%' || ?1 || '%'
               AND (?2 IS NULL OR published >= ?2)
               AND (?3 IS NULL OR published < ?3)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![
                commit,
                window.after.as_ref().map(to_db_time),
                window.before.as_ref().map(to_db_time)
            ],
            row_to_vuln,
        )?;
        let candidates = collect_rows(rows)?;
        Ok(candidates
            .into_iter()
            .filter(|vuln| vuln.commits.iter().any(|c| c == commit))
            .collect())
    }

    pub fn repo_urls(&self, window: DateWindow) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT repo_url FROM vulnerabilities
             WHERE (?1 IS NULL OR published >= ?1)
               AND (?2 IS NULL OR published < ?2)
             ORDER BY repo_url",
        )?;
        let rows = stmt.query_map(
            params![
                window.after.as_ref().map(to_db_time),
                window.before.as_ref().map(to_db_time)
            ],
            |row| row.get::<_, String>(0),
        )?;
        collect_rows(rows)
    }

    pub fn revisions_for_repo(&self, repo_url: &str) -> Result<Vec<RevisionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT repo_url, \"commit\", date, languages, size
             FROM revisions WHERE repo_url = ?1
             ORDER BY \"commit\"",
        )?;
        let rows = stmt.query_map(params![repo_url], row_to_revision)?;
        collect_rows(rows)
    }
}

fn row_to_vuln(row: &rusqlite::Row<'_>) -> rusqlite::Result<VulnerabilityRecord> {
    let published: String = row.get(1)?;
    let modified: String = row.get(2)?;
    let severity: Option<String> = row.get(5)?;
    let cwes: String = row.get(7)?;
    let commits: String = row.get(8)?;
    Ok(VulnerabilityRecord {
        id: row.get(0)?,
        published: parse_db_time(&published, 1)?,
        modified: parse_db_time(&modified, 2)?,
        details: row.get(3)?,
        summary: row.get(4)?,
        severity: severity
            .map(|json| parse_json_column::<Vec<Severity>>(&json, 5))
            .transpose()?,
        repo_url: row.get(6)?,
        cwes: parse_json_column(&cwes, 7)?,
        commits: parse_json_column(&commits, 8)?,
    })
}

fn row_to_revision(row: &rusqlite::Row<'_>) -> rusqlite::Result<RevisionRecord> {
    let date: String = row.get(2)?;
    let languages: String = row.get(3)?;
    Ok(RevisionRecord {
        repo_url: row.get(0)?,
        commit: row.get(1)?,
        date: parse_db_time(&date, 2)?,
        languages: parse_json_column(&languages, 3)?,
        size: row.get(4)?,
    })
}

fn parse_db_time(text: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    json: &str,
    column: usize,
) -> rusqlite::Result<T> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn collect_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
