use serde::{Deserialize, Serialize};

use super::{is_dir_mode, ObjectHash};

/// One named child of a tree object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub mode: u32,
    pub hash: ObjectHash,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, mode: u32, hash: ObjectHash) -> Self {
        Self {
            name: name.into(),
            mode,
            hash,
        }
    }

    pub fn is_dir(&self) -> bool {
        is_dir_mode(self.mode)
    }
}

/// Immutable directory listing. Entries are kept sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    hash: ObjectHash,
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new(hash: ObjectHash, mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self { hash, entries }
    }

    pub fn hash(&self) -> ObjectHash {
        self.hash
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.entries[idx])
    }
}

/// Immutable file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub hash: ObjectHash,
    pub contents: Vec<u8>,
}
