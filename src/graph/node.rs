//! Directory nodes and the entries they hold.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::model::{is_dir_mode, NodeId, NodeKind, ObjectHash, Tree};
use crate::overlay::{OverlayDir, OverlayEntry};

/// Where an entry's content currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Unchanged since the snapshot it came from.
    Object(ObjectHash),
    /// Stored in the overlay under the entry's node id. `origin` is the object
    /// it was materialized from, if any.
    Materialized { origin: Option<ObjectHash> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub mode: u32,
    pub backing: Backing,
    /// Assigned the first time the entry needs a stable identity.
    pub id: Option<NodeId>,
}

impl Entry {
    pub fn from_object(mode: u32, hash: ObjectHash) -> Self {
        Self {
            mode,
            backing: Backing::Object(hash),
            id: None,
        }
    }

    pub fn materialized(mode: u32, id: NodeId) -> Self {
        Self {
            mode,
            backing: Backing::Materialized { origin: None },
            id: Some(id),
        }
    }

    pub fn is_dir(&self) -> bool {
        is_dir_mode(self.mode)
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::from_mode(self.mode)
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.backing, Backing::Materialized { .. })
    }

    /// The object hash when the entry is still backed by the store.
    pub fn object_hash(&self) -> Option<ObjectHash> {
        match self.backing {
            Backing::Object(hash) => Some(hash),
            Backing::Materialized { .. } => None,
        }
    }

    pub fn origin(&self) -> Option<ObjectHash> {
        match self.backing {
            Backing::Object(hash) => Some(hash),
            Backing::Materialized { origin } => origin,
        }
    }

    fn to_overlay(&self) -> OverlayEntry {
        // Ids are only persisted for materialized entries; the rest are
        // reassigned on demand after a restart.
        match self.backing {
            Backing::Object(hash) => OverlayEntry {
                mode: self.mode,
                hash: Some(hash),
                id: None,
                materialized: false,
            },
            Backing::Materialized { origin } => OverlayEntry {
                mode: self.mode,
                hash: origin,
                id: self.id,
                materialized: true,
            },
        }
    }

    fn from_overlay(entry: OverlayEntry) -> Option<Self> {
        let backing = if entry.materialized {
            entry.id?;
            Backing::Materialized { origin: entry.hash }
        } else {
            Backing::Object(entry.hash?)
        };
        Some(Self {
            mode: entry.mode,
            backing,
            id: if entry.materialized { entry.id } else { None },
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirContents {
    pub entries: BTreeMap<String, Entry>,
    /// The tree this directory was built from.
    pub origin: Option<ObjectHash>,
    /// When false the entries are exactly `origin`'s listing.
    pub materialized: bool,
    /// Set once the directory has been removed from its parent.
    pub unlinked: bool,
}

impl DirContents {
    pub fn from_tree(tree: &Tree) -> Self {
        let entries = tree
            .entries()
            .iter()
            .map(|e| (e.name.clone(), Entry::from_object(e.mode, e.hash)))
            .collect();
        Self {
            entries,
            origin: Some(tree.hash()),
            materialized: false,
            unlinked: false,
        }
    }

    /// Rebuild a materialized directory from its record. Entries that cannot
    /// be interpreted are dropped and returned by name.
    pub fn from_overlay(dir: OverlayDir, origin: Option<ObjectHash>) -> (Self, Vec<String>) {
        let mut entries = BTreeMap::new();
        let mut dropped = Vec::new();
        for (name, entry) in dir.entries {
            match Entry::from_overlay(entry) {
                Some(e) => {
                    entries.insert(name, e);
                }
                None => dropped.push(name),
            }
        }
        (
            Self {
                entries,
                origin,
                materialized: true,
                unlinked: false,
            },
            dropped,
        )
    }

    pub fn empty_materialized() -> Self {
        Self {
            materialized: true,
            ..Self::default()
        }
    }

    pub fn to_overlay(&self) -> OverlayDir {
        OverlayDir {
            entries: self
                .entries
                .iter()
                .map(|(name, e)| (name.clone(), e.to_overlay()))
                .collect(),
        }
    }
}

/// A loaded directory. Each directory's contents are locked independently.
#[derive(Debug)]
pub struct DirNode {
    id: NodeId,
    pub(crate) contents: RwLock<DirContents>,
}

impl DirNode {
    pub fn new(id: NodeId, contents: DirContents) -> Self {
        Self {
            id,
            contents: RwLock::new(contents),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
}

/// Handle to a node returned by lookups and creations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub id: NodeId,
    pub mode: u32,
}

impl NodeRef {
    pub fn kind(&self) -> NodeKind {
        NodeKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        is_dir_mode(self.mode)
    }
}

/// Non-owning link from a node to the directory that currently holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentEdge {
    pub parent: NodeId,
    pub name: String,
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub mode: u32,
    pub materialized: bool,
}
