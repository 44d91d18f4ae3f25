//! Implementation of `ovfs scan`.

use std::fmt;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;
use tracing::info;

use super::{print_report, require_overlay, OutputFormat};
use crate::graph::NodeIdAllocator;
use crate::overlay::Overlay;
use crate::Result;

#[derive(Debug, Clone, Args, Default)]
pub struct ScanArgs {
    /// Overlay directory to scan
    #[arg(short = 'o', long = "overlay")]
    pub overlay: Option<PathBuf>,

    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub overlay: PathBuf,
    pub was_clean: bool,
    pub records: usize,
    pub next_node_id: u64,
}

impl fmt::Display for ScanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "overlay: {}", self.overlay.display())?;
        writeln!(f, "previous shutdown: {}", if self.was_clean { "clean" } else { "unclean" })?;
        writeln!(f, "records: {}", self.records)?;
        write!(f, "next node id: {}", self.next_node_id)
    }
}

/// Open the overlay, recover the allocator the same way a mount would, and
/// close it clean with the recovered id.
pub fn scan(overlay_dir: &Path) -> Result<ScanReport> {
    let overlay = Overlay::new(overlay_dir);
    let persisted = overlay.open(false)?;
    let report = NodeIdAllocator::recover(&overlay, persisted).and_then(|ids| {
        Ok(ScanReport {
            overlay: overlay_dir.to_path_buf(),
            was_clean: persisted.is_some(),
            records: overlay.record_ids()?.len(),
            next_node_id: ids.peek().get(),
        })
    });
    match report {
        Ok(report) => {
            overlay.close(Some(crate::NodeId::new(report.next_node_id)))?;
            info!(next = report.next_node_id, records = report.records, "scan complete");
            Ok(report)
        }
        Err(e) => {
            overlay.close(None)?;
            Err(e)
        }
    }
}

pub fn execute(args: ScanArgs) -> Result<()> {
    let overlay = require_overlay(args.overlay)?;
    print_report(&scan(&overlay)?, args.format)
}
