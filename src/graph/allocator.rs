//! Node id allocation and recovery.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info, warn};

use crate::model::{NodeId, ROOT_NODE_ID};
use crate::overlay::Overlay;
use crate::Result;

/// Hands out strictly increasing node ids.
#[derive(Debug)]
pub struct NodeIdAllocator {
    next: AtomicU64,
}

impl NodeIdAllocator {
    /// Start allocating at `start`, clamped above the root id.
    pub fn new(start: NodeId) -> Self {
        let start = start.max(ROOT_NODE_ID.next());
        Self {
            next: AtomicU64::new(start.get()),
        }
    }

    /// Build an allocator from what [`Overlay::open`] returned.
    ///
    /// A persisted value from a clean shutdown is trusted. Otherwise every
    /// record on disk is scanned and allocation resumes past the largest id
    /// found (or past the last checkpoint, whichever is higher).
    pub fn recover(overlay: &Overlay, persisted: Option<NodeId>) -> Result<Self> {
        if let Some(next) = persisted {
            return Ok(Self::new(next));
        }

        let scanned = overlay.scan_for_next_node_id()?;
        let next = match overlay.checkpoint_hint() {
            Some(hint) if hint > scanned => {
                warn!(scanned = %scanned, checkpoint = %hint, "checkpoint ahead of scanned records");
                hint
            }
            _ => scanned,
        };
        info!(next = %next, "recovered node id allocator after unclean shutdown");
        Ok(Self::new(next))
    }

    pub fn next(&self) -> NodeId {
        NodeId::new(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// The id the next call to [`NodeIdAllocator::next`] will return.
    pub fn peek(&self) -> NodeId {
        NodeId::new(self.next.load(Ordering::SeqCst))
    }
}
