//! Implementation of `ovfs info`.

use std::fmt;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;

use super::{print_report, require_overlay, OutputFormat};
use crate::overlay::Overlay;
use crate::Result;

#[derive(Debug, Clone, Args, Default)]
pub struct InfoArgs {
    /// Overlay directory to inspect
    #[arg(short = 'o', long = "overlay")]
    pub overlay: Option<PathBuf>,

    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoReport {
    pub overlay: PathBuf,
    pub clean: bool,
    pub next_node_id: Option<u64>,
}

impl fmt::Display for InfoReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "overlay: {}", self.overlay.display())?;
        writeln!(
            f,
            "state: {}",
            if self.clean { "clean" } else { "unclean" }
        )?;
        match self.next_node_id {
            Some(next) => write!(f, "next node id: {next}"),
            None => write!(f, "next node id: unknown"),
        }
    }
}

/// Read the info file. Works while another process holds the overlay.
pub fn inspect(overlay: &Path) -> Result<InfoReport> {
    let state = Overlay::inspect(overlay)?;
    Ok(InfoReport {
        overlay: overlay.to_path_buf(),
        clean: state.clean,
        next_node_id: state.next_id.map(|id| id.get()),
    })
}

pub fn execute(args: InfoArgs) -> Result<()> {
    let overlay = require_overlay(args.overlay)?;
    print_report(&inspect(&overlay)?, args.format)
}
