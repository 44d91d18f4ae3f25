//! Mount configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ignore::GlobIgnore;
use crate::{Error, Result};

pub const ENV_DIFF_WORKERS: &str = "OVFS_DIFF_WORKERS";
pub const ENV_CHECKPOINT_SECS: &str = "OVFS_CHECKPOINT_SECS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountConfig {
    pub overlay_dir: PathBuf,
    pub create_if_missing: bool,
    /// Threads used to compare subtrees during a diff.
    pub diff_workers: usize,
    /// How often the next node id is checkpointed. Zero disables it.
    pub checkpoint_interval_secs: u64,
    /// Gitignore-style patterns for untracked paths.
    pub ignore_patterns: Vec<String>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            overlay_dir: PathBuf::from("overlay"),
            create_if_missing: true,
            diff_workers: 4,
            checkpoint_interval_secs: 30,
            ignore_patterns: Vec::new(),
        }
    }
}

impl MountConfig {
    pub fn new(overlay_dir: impl Into<PathBuf>) -> Self {
        Self {
            overlay_dir: overlay_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = fs::read(path)
            .map_err(|e| Error::Cli(format!("failed to read config {}: {e}", path.display())))?;
        let config: MountConfig = serde_json::from_slice(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file and apply `OVFS_*` overrides from the process
    /// environment on top of it.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json_file(path)?.with_env_overrides()
    }

    /// Apply `OVFS_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup, for callers (and tests) that
    /// do not want to touch the process environment.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_DIFF_WORKERS) {
            self.diff_workers = parse_number(ENV_DIFF_WORKERS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CHECKPOINT_SECS) {
            self.checkpoint_interval_secs = parse_number(ENV_CHECKPOINT_SECS, &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.diff_workers == 0 {
            return Err(Error::Cli("diff_workers must be at least 1".into()).into());
        }
        if self.overlay_dir.as_os_str().is_empty() {
            return Err(Error::Cli("overlay_dir must not be empty".into()).into());
        }
        Ok(())
    }

    pub fn ignore(&self) -> GlobIgnore {
        GlobIgnore::from_patterns(&self.ignore_patterns)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        Error::Cli(format!("{key} must be a non-negative integer, got {raw:?}")).into()
    })
}
