//! Target node lists from the command line and hostfiles.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;

/// Parse hostfile contents: first token of each line, `#` comments and blank
/// lines skipped. Trailing fields such as `slots=4` are ignored.
pub fn parse_hostfile(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

pub fn read_hostfile(path: &Path) -> anyhow::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read hostfile {}", path.display()))?;
    Ok(parse_hostfile(&contents))
}

/// Combine `--hosts` with an optional hostfile, dropping duplicates while
/// keeping first-seen order.
pub fn collect_hosts(hosts: &[String], hostfile: Option<&Path>) -> anyhow::Result<Vec<String>> {
    let mut all: Vec<String> = hosts
        .iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect();
    if let Some(path) = hostfile {
        all.extend(read_hostfile(path)?);
    }

    let mut seen = HashSet::new();
    let before = all.len();
    all.retain(|h| seen.insert(h.clone()));
    if all.len() < before {
        tracing::debug!(dropped = before - all.len(), "Dropped duplicate hosts");
    }
    Ok(all)
}
