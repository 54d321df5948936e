//! Driving the external language classifier.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use crate::GitError;

/// Run the classifier over the checked-out tree and sum the per-language
/// byte counts.
pub(crate) fn measure(
    repo_dir: &Path,
    command: &str,
) -> Result<(BTreeMap<String, i64>, i64), GitError> {
    let output = Command::new(command)
        .args(["--breakdown", "--json"])
        .current_dir(repo_dir)
        .output()
        .map_err(|e| GitError::Linguist(format!("failed to execute {command}: {e}")))?;
    if !output.status.success() {
        return Err(GitError::Linguist(format!(
            "{command} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let value: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| GitError::Linguist(format!("unparseable {command} output: {e}")))?;
    let languages = parse_breakdown(&value)
        .ok_or_else(|| GitError::Linguist(format!("unexpected {command} output shape")))?;
    let size = languages.values().sum();
    Ok((languages, size))
}

/// The classifier reports either `{"Rust": 1234}` or
/// `{"Rust": {"size": 1234, ...}}` depending on version; accept both.
fn parse_breakdown(value: &serde_json::Value) -> Option<BTreeMap<String, i64>> {
    let object = value.as_object()?;
    let mut languages = BTreeMap::new();
    for (language, stats) in object {
        let bytes = match stats {
            serde_json::Value::Number(n) => n.as_i64()?,
            serde_json::Value::Object(fields) => fields.get("size")?.as_i64()?,
            _ => return None,
        };
        languages.insert(language.clone(), bytes);
    }
    Some(languages)
}
