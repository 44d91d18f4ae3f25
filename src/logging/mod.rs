//! Logging initialization using `tracing` and `tracing-subscriber`.

use tracing::info;
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::model::NodeId;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Counters describing what a mount did to its overlay, emitted once when
/// the mount shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlaySummary {
    pub records_written: u64,
    pub records_removed: u64,
    pub corrupt_records: u64,
    pub pruned_records: u64,
    pub next_node_id: Option<NodeId>,
}

/// Initialize global tracing subscriber. Safe to call multiple times; subsequent
/// calls will no-op.
pub fn init_logging(format: LogFormat) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

pub fn log_overlay_summary(summary: OverlaySummary) {
    info!(
        target: "ovfs::overlay",
        records_written = summary.records_written,
        records_removed = summary.records_removed,
        corrupt_records = summary.corrupt_records,
        pruned_records = summary.pruned_records,
        next_node_id = ?summary.next_node_id.map(NodeId::get),
        "overlay_summary"
    );
}
