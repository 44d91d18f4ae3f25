//! In-memory node graph over the overlay and the object store.
//!
//! Directories live in an arena keyed by [`NodeId`]. Parent/child links are
//! edges in that arena rather than owning pointers, so finding a node's
//! current parent is a lookup that renames keep correct.
//!
//! Locking: each directory's contents sit behind their own `RwLock`. A
//! thread never holds a directory lock while calling into the object store,
//! and never holds a parent's lock while taking a child's. The one place two
//! directory locks are held together is a cross-directory rename, which
//! takes them in ascending id order.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLockUpgradableReadGuard};
use tracing::{debug, info, warn};

use crate::model::{validate_name, NodeId, ObjectHash, ROOT_NODE_ID};
use crate::overlay::{NodeMetadata, Overlay};
use crate::store::ObjectStore;
use crate::{Error, Result};

pub mod allocator;
mod mutate;
pub mod node;

pub use allocator::NodeIdAllocator;
pub use node::{Backing, DirContents, DirEntryInfo, DirNode, Entry, NodeRef, ParentEdge};

/// What loading does with a materialized record that is missing or damaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnCorruption {
    /// Fall back to the origin object and point the parent entry back at it.
    Revert,
    /// Return the `Corruption` error and leave everything as it is.
    Fail,
}

pub struct NodeGraph {
    overlay: Arc<Overlay>,
    store: Arc<dyn ObjectStore>,
    ids: Arc<NodeIdAllocator>,
    dirs: DashMap<NodeId, Arc<DirNode>>,
    parents: DashMap<NodeId, ParentEdge>,
    /// Serializes directory moves between different parents so two of them
    /// cannot race each other into a cycle.
    dir_move: Mutex<()>,
    root_mode: u32,
}

impl std::fmt::Debug for NodeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGraph")
            .field("overlay", &self.overlay.root())
            .field("loaded_dirs", &self.dirs.len())
            .field("next_id", &self.ids.peek())
            .finish()
    }
}

impl NodeGraph {
    fn with_root(
        overlay: Arc<Overlay>,
        store: Arc<dyn ObjectStore>,
        ids: Arc<NodeIdAllocator>,
        root: DirContents,
    ) -> Self {
        let graph = Self {
            overlay,
            store,
            ids,
            dirs: DashMap::new(),
            parents: DashMap::new(),
            dir_move: Mutex::new(()),
            root_mode: crate::model::DEFAULT_DIR_MODE,
        };
        graph.register_children(ROOT_NODE_ID, &root);
        graph
            .dirs
            .insert(ROOT_NODE_ID, Arc::new(DirNode::new(ROOT_NODE_ID, root)));
        graph
    }

    /// Build an unmaterialized root from a snapshot tree.
    pub fn from_snapshot(
        overlay: Arc<Overlay>,
        store: Arc<dyn ObjectStore>,
        ids: Arc<NodeIdAllocator>,
        snapshot: ObjectHash,
    ) -> Result<Self> {
        let tree = store.get_tree(&snapshot)?;
        let root = DirContents::from_tree(&tree);
        Ok(Self::with_root(overlay, store, ids, root))
    }

    /// Rebuild the root from its overlay record.
    pub fn from_overlay(
        overlay: Arc<Overlay>,
        store: Arc<dyn ObjectStore>,
        ids: Arc<NodeIdAllocator>,
    ) -> Result<Self> {
        let dir = overlay
            .load_dir(ROOT_NODE_ID)?
            .ok_or_else(|| Error::Corruption {
                node: ROOT_NODE_ID,
                reason: "root directory record missing".into(),
            })?;
        let (root, dropped) = DirContents::from_overlay(dir, None);
        for name in dropped {
            warn!(node = %ROOT_NODE_ID, name = %name, "dropping malformed entry from root record");
        }
        Ok(Self::with_root(overlay, store, ids, root))
    }

    /// Resume from the overlay when it holds a root record, otherwise start
    /// from `snapshot`. A damaged root record falls back to the snapshot.
    pub fn load_or_create(
        overlay: Arc<Overlay>,
        store: Arc<dyn ObjectStore>,
        ids: Arc<NodeIdAllocator>,
        snapshot: ObjectHash,
    ) -> Result<Self> {
        if !overlay.has_record(ROOT_NODE_ID) {
            return Self::from_snapshot(overlay, store, ids, snapshot);
        }
        match Self::from_overlay(overlay.clone(), store.clone(), ids.clone()) {
            Ok(graph) => Ok(graph),
            Err(e) if is_corruption(&e) => {
                warn!(error = %e, snapshot = %snapshot, "root record unusable, rebuilding from snapshot");
                Self::from_snapshot(overlay, store, ids, snapshot)
            }
            Err(e) => Err(e),
        }
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn allocator(&self) -> &Arc<NodeIdAllocator> {
        &self.ids
    }

    pub fn root(&self) -> NodeRef {
        NodeRef {
            id: ROOT_NODE_ID,
            mode: self.root_mode,
        }
    }

    fn register_children(&self, dir: NodeId, contents: &DirContents) {
        for (name, entry) in &contents.entries {
            if let Some(id) = entry.id {
                self.parents.insert(
                    id,
                    ParentEdge {
                        parent: dir,
                        name: name.clone(),
                    },
                );
            }
        }
    }

    pub fn parent_of(&self, node: NodeId) -> Option<ParentEdge> {
        self.parents.get(&node).map(|e| e.value().clone())
    }

    fn edge(&self, node: NodeId) -> Result<ParentEdge> {
        self.parent_of(node)
            .ok_or_else(|| Error::NotFound(format!("node {node}")).into())
    }

    /// Current path of `node` relative to the root, if it is still linked.
    pub fn path_of(&self, node: NodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut cur = node;
        while cur != ROOT_NODE_ID {
            let edge = self.parent_of(cur)?;
            names.push(edge.name);
            cur = edge.parent;
            if names.len() > 4096 {
                return None;
            }
        }
        names.reverse();
        Some(names.join("/"))
    }

    fn describe(&self, dir: NodeId, name: &str) -> String {
        match self.path_of(dir) {
            Some(p) => crate::model::join_path(&p, name),
            None => name.to_string(),
        }
    }

    /// Whether `ancestor` is `node` or one of its parents.
    fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = node;
        loop {
            if cur == ancestor {
                return true;
            }
            match self.parent_of(cur) {
                Some(edge) => cur = edge.parent,
                None => return false,
            }
        }
    }

    /// The entry `node` occupies in its parent, if the link is still intact.
    fn linked_entry(&self, node: NodeId) -> Result<(ParentEdge, Entry)> {
        self.linked_entry_with(node, OnCorruption::Revert)
    }

    fn linked_entry_with(
        &self,
        node: NodeId,
        on_corruption: OnCorruption,
    ) -> Result<(ParentEdge, Entry)> {
        let mut edge = self.edge(node)?;
        loop {
            let parent = self.load_dir_node(edge.parent, on_corruption)?;
            let entry = parent
                .contents
                .read()
                .entries
                .get(&edge.name)
                .filter(|e| e.id == Some(node))
                .cloned();
            if let Some(entry) = entry {
                return Ok((edge, entry));
            }
            // A rename may have moved the node after we read its edge.
            match self.parent_of(node) {
                Some(current) if current != edge => edge = current,
                _ => return Err(Error::NotFound(self.describe(edge.parent, &edge.name)).into()),
            }
        }
    }

    /// Fetch or load the directory node for `id`.
    pub(crate) fn dir_node(&self, id: NodeId) -> Result<Arc<DirNode>> {
        self.load_dir_node(id, OnCorruption::Revert)
    }

    fn load_dir_node(&self, id: NodeId, on_corruption: OnCorruption) -> Result<Arc<DirNode>> {
        if let Some(node) = self.dirs.get(&id).map(|r| Arc::clone(r.value())) {
            return Ok(node);
        }

        let (edge, entry) = self.linked_entry_with(id, on_corruption)?;
        if !entry.is_dir() {
            return Err(Error::NotADirectory(self.describe(edge.parent, &edge.name)).into());
        }
        let contents = self.load_contents(id, &edge, &entry, on_corruption)?;

        match self.dirs.entry(id) {
            // Someone else finished loading first; ours is discarded.
            MapEntry::Occupied(o) => Ok(Arc::clone(o.get())),
            MapEntry::Vacant(v) => {
                self.register_children(id, &contents);
                let node = Arc::new(DirNode::new(id, contents));
                v.insert(Arc::clone(&node));
                Ok(node)
            }
        }
    }

    fn load_contents(
        &self,
        id: NodeId,
        edge: &ParentEdge,
        entry: &Entry,
        on_corruption: OnCorruption,
    ) -> Result<DirContents> {
        match entry.backing {
            Backing::Object(hash) => {
                let tree = self.store.get_tree(&hash)?;
                Ok(DirContents::from_tree(&tree))
            }
            Backing::Materialized { origin } => {
                let failure = match self.overlay.load_dir(id) {
                    Ok(Some(dir)) => {
                        let (contents, dropped) = DirContents::from_overlay(dir, origin);
                        for name in dropped {
                            warn!(node = %id, name = %name, "dropping malformed entry from directory record");
                        }
                        return Ok(contents);
                    }
                    Ok(None) => anyhow::Error::from(Error::Corruption {
                        node: id,
                        reason: "directory record missing".into(),
                    }),
                    Err(e) if is_corruption(&e) => e,
                    Err(e) => return Err(e),
                };
                let Some(origin) = origin.filter(|_| on_corruption == OnCorruption::Revert) else {
                    return Err(failure);
                };
                warn!(node = %id, origin = %origin, error = %failure, "falling back to origin tree for damaged directory");
                let tree = self.store.get_tree(&origin)?;
                self.revert_to_origin(id, edge, origin)?;
                Ok(DirContents::from_tree(&tree))
            }
        }
    }

    /// Point a damaged materialized entry back at the object it came from.
    fn revert_to_origin(&self, id: NodeId, edge: &ParentEdge, origin: ObjectHash) -> Result<()> {
        let parent = self.dir_node(edge.parent)?;
        let mut contents = parent.contents.write();
        let Some(entry) = contents.entries.get_mut(&edge.name) else {
            return Ok(());
        };
        if entry.id != Some(id) || !entry.is_materialized() {
            return Ok(());
        }
        entry.backing = Backing::Object(origin);
        let _ = self.overlay.remove_record(id);
        if contents.materialized {
            self.overlay.save_dir(edge.parent, &contents.to_overlay())?;
        }
        Ok(())
    }

    /// Resolve `name` in `dir` without materializing anything.
    pub fn get_child(&self, dir: NodeId, name: &str) -> Result<Option<NodeRef>> {
        validate_name(name)?;
        let node = self.dir_node(dir)?;

        let contents = node.contents.upgradable_read();
        if contents.unlinked {
            return Ok(None);
        }
        let (mode, id) = match contents.entries.get(name) {
            None => return Ok(None),
            Some(entry) => (entry.mode, entry.id),
        };
        if let Some(id) = id {
            return Ok(Some(NodeRef { id, mode }));
        }

        let mut contents = RwLockUpgradableReadGuard::upgrade(contents);
        let id = self.ids.next();
        if let Some(entry) = contents.entries.get_mut(name) {
            entry.id = Some(id);
        }
        self.parents.insert(
            id,
            ParentEdge {
                parent: dir,
                name: name.to_string(),
            },
        );
        Ok(Some(NodeRef { id, mode }))
    }

    /// Resolve a `/`-separated path from the root.
    pub fn lookup_path(&self, path: &str) -> Result<Option<NodeRef>> {
        let mut cur = self.root();
        for name in path.split('/').filter(|c| !c.is_empty()) {
            if !cur.is_dir() {
                return Err(Error::NotADirectory(path.to_string()).into());
            }
            match self.get_child(cur.id, name)? {
                Some(child) => cur = child,
                None => return Ok(None),
            }
        }
        Ok(Some(cur))
    }

    /// Snapshot of a directory's entries, in name order.
    pub fn entries(&self, dir: NodeId) -> Result<Vec<(String, Entry)>> {
        self.entries_with(dir, OnCorruption::Revert)
    }

    /// Like [`NodeGraph::entries`], but a damaged directory record fails with
    /// `Corruption` and is left untouched instead of being replaced by its
    /// origin tree.
    pub fn entries_strict(&self, dir: NodeId) -> Result<Vec<(String, Entry)>> {
        self.entries_with(dir, OnCorruption::Fail)
    }

    fn entries_with(
        &self,
        dir: NodeId,
        on_corruption: OnCorruption,
    ) -> Result<Vec<(String, Entry)>> {
        let node = self.load_dir_node(dir, on_corruption)?;
        let contents = node.contents.read();
        Ok(contents
            .entries
            .iter()
            .map(|(name, e)| (name.clone(), e.clone()))
            .collect())
    }

    pub fn readdir(&self, dir: NodeId) -> Result<Vec<DirEntryInfo>> {
        Ok(self
            .entries(dir)?
            .into_iter()
            .map(|(name, e)| DirEntryInfo {
                name,
                mode: e.mode,
                materialized: e.is_materialized(),
            })
            .collect())
    }

    pub fn is_materialized(&self, dir: NodeId) -> Result<bool> {
        Ok(self.dir_node(dir)?.contents.read().materialized)
    }

    /// Copy `dir`'s listing into the overlay so it can be changed. Also marks
    /// the directory materialized in each ancestor. A no-op when already done.
    pub fn materialize_directory(&self, dir: NodeId) -> Result<()> {
        let node = self.dir_node(dir)?;
        let already = {
            let contents = node.contents.read();
            if contents.unlinked {
                return Err(Error::NotFound(format!("node {dir}")).into());
            }
            contents.materialized
        };

        if !already {
            let mut contents = node.contents.write();
            if contents.unlinked {
                return Err(Error::NotFound(format!("node {dir}")).into());
            }
            if !contents.materialized {
                self.overlay.save_dir(dir, &contents.to_overlay())?;
                contents.materialized = true;
                debug!(node = %dir, "materialized directory");
            }
        }

        if dir != ROOT_NODE_ID {
            self.mark_materialized_in_parent(dir)?;
        }
        Ok(())
    }

    /// Flip `child`'s entry in its parent to materialized, materializing the
    /// parent chain first.
    fn mark_materialized_in_parent(&self, child: NodeId) -> Result<()> {
        const MAX_ATTEMPTS: usize = 16;
        for _ in 0..MAX_ATTEMPTS {
            let (edge, entry) = self.linked_entry(child)?;
            if entry.is_materialized() {
                return Ok(());
            }
            self.materialize_directory(edge.parent)?;

            let parent = self.dir_node(edge.parent)?;
            let mut contents = parent.contents.write();
            match contents.entries.get_mut(&edge.name) {
                Some(e) if e.id == Some(child) => {
                    if e.is_materialized() {
                        return Ok(());
                    }
                    e.backing = Backing::Materialized { origin: e.origin() };
                    self.overlay.save_dir(edge.parent, &contents.to_overlay())?;
                    return Ok(());
                }
                // Moved by a concurrent rename; follow the new edge.
                _ => continue,
            }
        }
        Err(Error::Storage(format!("node {child} kept moving while being materialized")).into())
    }

    /// Contents of a file, from the overlay when materialized and the object
    /// store otherwise. A damaged file record with a known origin is replaced
    /// by the origin blob.
    pub fn read_file(&self, file: NodeId) -> Result<Vec<u8>> {
        self.read_file_with(file, OnCorruption::Revert)
    }

    /// Contents of a file without repairing anything: a damaged record fails
    /// with `Corruption` and stays on disk.
    pub fn read_file_strict(&self, file: NodeId) -> Result<Vec<u8>> {
        self.read_file_with(file, OnCorruption::Fail)
    }

    fn read_file_with(&self, file: NodeId, on_corruption: OnCorruption) -> Result<Vec<u8>> {
        let (edge, entry) = self.linked_entry_with(file, on_corruption)?;
        if entry.is_dir() {
            return Err(Error::IsADirectory(self.describe(edge.parent, &edge.name)).into());
        }
        match entry.backing {
            Backing::Object(hash) => Ok(self.store.get_blob(&hash)?.contents.clone()),
            Backing::Materialized { origin } => {
                let failure = match self.overlay.read_file(file) {
                    Ok(Some(data)) => return Ok(data),
                    Ok(None) => anyhow::Error::from(Error::Corruption {
                        node: file,
                        reason: "file record missing".into(),
                    }),
                    Err(e) if is_corruption(&e) => e,
                    Err(e) => return Err(e),
                };
                let Some(origin) = origin.filter(|_| on_corruption == OnCorruption::Revert) else {
                    return Err(failure);
                };
                warn!(node = %file, origin = %origin, error = %failure, "falling back to origin blob for damaged file");
                let blob = self.store.get_blob(&origin)?;
                self.revert_to_origin(file, &edge, origin)?;
                Ok(blob.contents.clone())
            }
        }
    }

    /// Replace a file's contents, materializing it first if needed.
    pub fn write_file(&self, file: NodeId, data: &[u8]) -> Result<()> {
        let (edge, entry) = self.linked_entry(file)?;
        if entry.is_dir() {
            return Err(Error::IsADirectory(self.describe(edge.parent, &edge.name)).into());
        }
        self.materialize_directory(edge.parent)?;
        self.overlay.create_file(file, data)?;
        self.overlay.set_metadata(file, &NodeMetadata::now(entry.mode))?;
        self.mark_materialized_in_parent(file)?;
        debug!(node = %file, len = data.len(), "wrote file");
        Ok(())
    }

    pub fn metadata(&self, node: NodeId) -> Result<Option<NodeMetadata>> {
        self.overlay.metadata(node)
    }

    /// Ids of every record reachable from the root through materialized
    /// entries.
    pub fn reachable_records(&self) -> Result<HashSet<NodeId>> {
        Ok(self.walk_records()?.reachable)
    }

    /// Ids listed by more than one materialized entry. Only an interrupted
    /// cross-directory rename leaves records like this behind.
    pub fn aliased_records(&self) -> Result<Vec<NodeId>> {
        Ok(self.walk_records()?.aliased)
    }

    fn walk_records(&self) -> Result<RecordWalk> {
        let mut walk = RecordWalk::default();
        if !self.is_materialized(ROOT_NODE_ID)? {
            return Ok(walk);
        }
        walk.reachable.insert(ROOT_NODE_ID);
        let mut queue = VecDeque::from([ROOT_NODE_ID]);
        while let Some(dir) = queue.pop_front() {
            for (_, entry) in self.entries(dir)? {
                let (Some(id), true) = (entry.id, entry.is_materialized()) else {
                    continue;
                };
                if !walk.reachable.insert(id) {
                    // Already visited; do not descend twice.
                    walk.aliased.push(id);
                    continue;
                }
                if entry.is_dir() {
                    queue.push_back(id);
                }
            }
        }
        Ok(walk)
    }

    /// Delete records no longer reachable from the root. Nothing is deleted
    /// if any part of the tree cannot be read.
    pub fn prune_unreachable_records(&self) -> Result<u64> {
        let RecordWalk { reachable, aliased } = match self.walk_records() {
            Ok(walk) => walk,
            Err(e) => {
                warn!(error = %e, "skipping overlay pruning: tree not fully readable");
                return Ok(0);
            }
        };
        for id in &aliased {
            warn!(node = %id, path = ?self.path_of(*id), "overlay record listed in more than one directory");
        }
        let mut pruned = 0;
        for id in self.overlay.record_ids()? {
            if reachable.contains(&id) {
                continue;
            }
            self.overlay.remove_record(id)?;
            pruned += 1;
        }
        if pruned > 0 {
            info!(pruned, "removed unreachable overlay records");
        }
        Ok(pruned)
    }
}

#[derive(Default)]
struct RecordWalk {
    reachable: HashSet<NodeId>,
    aliased: Vec<NodeId>,
}

pub(crate) fn is_corruption(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::Corruption { .. }))
}
