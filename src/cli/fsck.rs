//! Implementation of `ovfs fsck`.

use std::fmt;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;

use super::{print_report, require_overlay, OutputFormat};
use crate::graph::NodeIdAllocator;
use crate::overlay::Overlay;
use crate::{Error, Result};

#[derive(Debug, Clone, Args, Default)]
pub struct FsckArgs {
    /// Overlay directory to check
    #[arg(short = 'o', long = "overlay")]
    pub overlay: Option<PathBuf>,

    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptRecord {
    pub node: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsckReport {
    pub overlay: PathBuf,
    pub records: usize,
    pub corrupt: Vec<CorruptRecord>,
}

impl fmt::Display for FsckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} records, {} corrupt",
            self.overlay.display(),
            self.records,
            self.corrupt.len()
        )?;
        for bad in &self.corrupt {
            write!(f, "\n  node {}: {}", bad.node, bad.reason)?;
        }
        Ok(())
    }
}

/// Check every record. The overlay is closed with the same next id it had on
/// open (or a rescanned one after an unclean shutdown).
pub fn check(overlay_dir: &Path) -> Result<FsckReport> {
    let overlay = Overlay::new(overlay_dir);
    let persisted = overlay.open(false)?;
    let result = (|| -> Result<(crate::NodeId, usize, Vec<CorruptRecord>)> {
        let ids = NodeIdAllocator::recover(&overlay, persisted)?;
        let records = overlay.record_ids()?.len();
        let corrupt = overlay
            .fsck()?
            .into_iter()
            .map(|(node, reason)| CorruptRecord {
                node: node.get(),
                reason,
            })
            .collect();
        Ok((ids.peek(), records, corrupt))
    })();
    match result {
        Ok((next, records, corrupt)) => {
            overlay.close(Some(next))?;
            Ok(FsckReport {
                overlay: overlay_dir.to_path_buf(),
                records,
                corrupt,
            })
        }
        Err(e) => {
            overlay.close(None)?;
            Err(e)
        }
    }
}

pub fn execute(args: FsckArgs) -> Result<()> {
    let overlay = require_overlay(args.overlay)?;
    let report = check(&overlay)?;
    print_report(&report, args.format)?;
    if !report.corrupt.is_empty() {
        return Err(Error::Cli(format!(
            "{} corrupt overlay records",
            report.corrupt.len()
        ))
        .into());
    }
    Ok(())
}
