//! Status classifications and the collecting sink used for status reports.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use super::DiffSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    Ignored,
}

impl FileStatus {
    /// Single-letter code as printed by `status`.
    pub fn code(self) -> char {
        match self {
            FileStatus::Added => 'A',
            FileStatus::Modified => 'M',
            FileStatus::Removed => 'R',
            FileStatus::Ignored => 'I',
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Result of a status diff: one classification per differing path, plus the
/// paths that could not be compared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScmStatus {
    pub entries: BTreeMap<String, FileStatus>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}

impl ScmStatus {
    pub fn get(&self, path: &str) -> Option<FileStatus> {
        self.entries.get(path).copied()
    }

    pub fn is_clean(&self) -> bool {
        self.entries.is_empty() && self.errors.is_empty()
    }
}

impl fmt::Display for ScmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (path, status) in &self.entries {
            write!(f, "{} {path}; ", status.code())?;
        }
        f.write_str("}")
    }
}

/// Sink that accumulates results from any number of concurrent walkers.
/// The first classification recorded for a path is kept.
#[derive(Debug, Default)]
pub struct StatusCollector {
    status: Mutex<ScmStatus>,
}

impl StatusCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_status(self) -> ScmStatus {
        self.status.into_inner()
    }
}

impl DiffSink for StatusCollector {
    fn record(&self, path: &str, status: FileStatus) {
        self.status
            .lock()
            .entries
            .entry(path.to_string())
            .or_insert(status);
    }

    fn diff_error(&self, path: &str, err: &anyhow::Error) {
        warn!(path, error = %err, "error computing status");
        self.status
            .lock()
            .errors
            .insert(path.to_string(), format!("{err:#}"));
    }
}
