//! A mounted overlay: the overlay store, the id allocator and the node graph
//! for one working copy, plus the background checkpoint thread.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::MountConfig;
use crate::diff::{self, DiffOptions, DiffSink, ScmStatus};
use crate::graph::{NodeGraph, NodeIdAllocator};
use crate::ignore::GlobIgnore;
use crate::logging::{log_overlay_summary, OverlaySummary};
use crate::model::ObjectHash;
use crate::overlay::Overlay;
use crate::store::ObjectStore;
use crate::Result;

struct Checkpointer {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Checkpointer {
    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("checkpoint thread panicked");
        }
    }
}

pub struct Mount {
    mount_id: uuid::Uuid,
    config: MountConfig,
    snapshot: ObjectHash,
    overlay: Arc<Overlay>,
    graph: Arc<NodeGraph>,
    ignore: GlobIgnore,
    checkpointer: Mutex<Option<Checkpointer>>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("mount_id", &self.mount_id)
            .field("overlay", &self.config.overlay_dir)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

impl Mount {
    /// Take the overlay and build the node graph, resuming whatever earlier
    /// sessions materialized. `snapshot` is the tree the working copy is
    /// based on.
    #[instrument(skip(config, store, snapshot), fields(overlay = %config.overlay_dir.display(), snapshot = %snapshot))]
    pub fn open(
        config: MountConfig,
        store: Arc<dyn ObjectStore>,
        snapshot: ObjectHash,
    ) -> Result<Self> {
        config.validate()?;
        let overlay = Arc::new(Overlay::new(&config.overlay_dir));
        let persisted = overlay.open(config.create_if_missing)?;

        let graph = NodeIdAllocator::recover(&overlay, persisted).and_then(|ids| {
            NodeGraph::load_or_create(overlay.clone(), store, Arc::new(ids), snapshot)
        });
        let graph = match graph {
            Ok(g) => Arc::new(g),
            Err(e) => {
                // Leave the overlay unclean so the next open rescans.
                let _ = overlay.close(None);
                return Err(e);
            }
        };

        let mount = Self {
            mount_id: uuid::Uuid::new_v4(),
            ignore: config.ignore(),
            config,
            snapshot,
            overlay,
            graph,
            checkpointer: Mutex::new(None),
        };
        info!(
            mount_id = %mount.mount_id,
            next_node_id = %mount.graph.allocator().peek(),
            "mount ready"
        );
        Ok(mount)
    }

    pub fn id(&self) -> uuid::Uuid {
        self.mount_id
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn snapshot(&self) -> ObjectHash {
        self.snapshot
    }

    pub fn graph(&self) -> &Arc<NodeGraph> {
        &self.graph
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    pub fn diff_options(&self, include_ignored: bool) -> DiffOptions {
        DiffOptions {
            include_ignored,
            workers: self.config.diff_workers,
            ..DiffOptions::default()
        }
    }

    /// Diff the working copy against `snapshot` using the mount's ignore
    /// rules.
    pub fn diff(
        &self,
        snapshot: ObjectHash,
        options: &DiffOptions,
        sink: &dyn DiffSink,
    ) -> Result<()> {
        diff::diff(&self.graph, snapshot, options, &self.ignore, sink)
    }

    /// Status of the working copy relative to the snapshot it was mounted at.
    pub fn status(&self, include_ignored: bool) -> Result<ScmStatus> {
        diff::diff_for_status(
            &self.graph,
            self.snapshot,
            &self.diff_options(include_ignored),
            &self.ignore,
        )
    }

    /// Persist the allocator position so an unclean shutdown resumes at
    /// least this far.
    pub fn checkpoint(&self) -> Result<()> {
        let next = self.graph.allocator().peek();
        self.overlay.checkpoint(next)?;
        debug!(next = %next, "checkpointed node id allocator");
        Ok(())
    }

    /// Start checkpointing every `checkpoint_interval_secs`. No-op when the
    /// interval is zero or a checkpointer is already running.
    pub fn start_checkpointer(&self) {
        let interval = self.config.checkpoint_interval_secs;
        let mut slot = self.checkpointer.lock();
        if interval == 0 || slot.is_some() {
            return;
        }

        let (stop, rx) = mpsc::channel::<()>();
        let overlay = self.overlay.clone();
        let ids = self.graph.allocator().clone();
        let period = Duration::from_secs(interval);
        let handle = thread::spawn(move || loop {
            match rx.recv_timeout(period) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = overlay.checkpoint(ids.peek()) {
                        warn!(error = %e, "periodic checkpoint failed");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        *slot = Some(Checkpointer { stop, handle });
        debug!(interval_secs = interval, "checkpoint thread started");
    }

    fn stop_checkpointer(&self) {
        if let Some(checkpointer) = self.checkpointer.lock().take() {
            checkpointer.stop();
        }
    }

    /// Prune unreachable records, then release the overlay marked clean with
    /// the allocator's next id.
    #[instrument(skip(self), fields(mount_id = %self.mount_id))]
    pub fn shutdown(self) -> Result<OverlaySummary> {
        self.stop_checkpointer();
        let pruned = self.graph.prune_unreachable_records()?;
        let next = self.graph.allocator().peek();
        self.overlay.close(Some(next))?;

        let summary = OverlaySummary {
            pruned_records: pruned,
            next_node_id: Some(next),
            ..self.overlay.summary()
        };
        log_overlay_summary(summary);
        Ok(summary)
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.stop_checkpointer();
    }
}
