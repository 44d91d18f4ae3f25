//! In-process object store.
//!
//! Used by tests and by embedders that stage snapshots in memory. Counts
//! every fetch so callers can assert which subtrees a walk actually touched,
//! and can simulate an unavailable backend per object.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::ObjectStore;
use crate::model::{Blob, ObjectHash, Tree, TreeEntry, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum StoredObject {
    Tree(Arc<Tree>),
    Blob(Arc<Blob>),
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectHash, StoredObject>>,
    unavailable: RwLock<HashSet<ObjectHash>>,
    tree_fetches: AtomicU64,
    blob_fetches: AtomicU64,
    fetch_log: Mutex<Vec<ObjectHash>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_blob(&self, contents: &[u8]) -> ObjectHash {
        let mut keyed = b"blob\0".to_vec();
        keyed.extend_from_slice(contents);
        let hash = ObjectHash::digest(&keyed);
        self.objects.write().insert(
            hash,
            StoredObject::Blob(Arc::new(Blob {
                hash,
                contents: contents.to_vec(),
            })),
        );
        hash
    }

    pub fn put_tree(&self, entries: Vec<TreeEntry>) -> ObjectHash {
        let mut sorted = entries;
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        let mut keyed = b"tree\0".to_vec();
        for e in &sorted {
            keyed.extend_from_slice(format!("{:o} {}\0", e.mode, e.name).as_bytes());
            keyed.extend_from_slice(e.hash.as_bytes());
        }
        let hash = ObjectHash::digest(&keyed);
        self.objects
            .write()
            .insert(hash, StoredObject::Tree(Arc::new(Tree::new(hash, sorted))));
        hash
    }

    /// Stage a nested snapshot from `path -> contents` pairs and return the
    /// root tree hash. Intermediate directories are created as needed.
    pub fn put_snapshot(&self, files: &[(&str, &[u8])]) -> ObjectHash {
        #[derive(Default)]
        struct Dir<'a> {
            files: BTreeMap<&'a str, &'a [u8]>,
            dirs: BTreeMap<&'a str, Dir<'a>>,
        }

        fn insert<'a>(dir: &mut Dir<'a>, path: &'a str, contents: &'a [u8]) {
            match path.split_once('/') {
                Some((head, rest)) => insert(dir.dirs.entry(head).or_default(), rest, contents),
                None => {
                    dir.files.insert(path, contents);
                }
            }
        }

        fn store(s: &MemoryObjectStore, dir: &Dir<'_>) -> ObjectHash {
            let mut entries = Vec::new();
            for (name, contents) in &dir.files {
                entries.push(TreeEntry::new(*name, DEFAULT_FILE_MODE, s.put_blob(contents)));
            }
            for (name, child) in &dir.dirs {
                entries.push(TreeEntry::new(*name, DEFAULT_DIR_MODE, store(s, child)));
            }
            s.put_tree(entries)
        }

        let mut root = Dir::default();
        for (path, contents) in files {
            insert(&mut root, path, contents);
        }
        store(self, &root)
    }

    /// Make subsequent fetches of `hash` fail with [`Error::Fetch`].
    pub fn mark_unavailable(&self, hash: ObjectHash) {
        self.unavailable.write().insert(hash);
    }

    pub fn mark_available(&self, hash: &ObjectHash) {
        self.unavailable.write().remove(hash);
    }

    pub fn tree_fetches(&self) -> u64 {
        self.tree_fetches.load(Ordering::SeqCst)
    }

    pub fn blob_fetches(&self) -> u64 {
        self.blob_fetches.load(Ordering::SeqCst)
    }

    /// Whether `hash` has been requested since the last reset.
    pub fn was_fetched(&self, hash: &ObjectHash) -> bool {
        self.fetch_log.lock().contains(hash)
    }

    pub fn reset_counters(&self) {
        self.tree_fetches.store(0, Ordering::SeqCst);
        self.blob_fetches.store(0, Ordering::SeqCst);
        self.fetch_log.lock().clear();
    }

    fn lookup(&self, hash: &ObjectHash) -> Result<StoredObject> {
        self.fetch_log.lock().push(*hash);
        if self.unavailable.read().contains(hash) {
            return Err(Error::Fetch {
                hash: *hash,
                reason: "object store unavailable".into(),
            }
            .into());
        }
        self.objects
            .read()
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(*hash).into())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get_tree(&self, hash: &ObjectHash) -> Result<Arc<Tree>> {
        self.tree_fetches.fetch_add(1, Ordering::SeqCst);
        match self.lookup(hash)? {
            StoredObject::Tree(tree) => Ok(tree),
            StoredObject::Blob(_) => Err(Error::Fetch {
                hash: *hash,
                reason: "object is a blob, expected a tree".into(),
            }
            .into()),
        }
    }

    fn get_blob(&self, hash: &ObjectHash) -> Result<Arc<Blob>> {
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        match self.lookup(hash)? {
            StoredObject::Blob(blob) => Ok(blob),
            StoredObject::Tree(_) => Err(Error::Fetch {
                hash: *hash,
                reason: "object is a tree, expected a blob".into(),
            }
            .into()),
        }
    }
}
