//! Backing object store interface consumed by the node graph and the diff
//! engine.
//!
//! Fetches may block while an object is retrieved; callers never hold a
//! node-graph lock across a call into the store.

use std::sync::Arc;

use crate::model::{Blob, ObjectHash, Tree};
use crate::Result;

pub mod memory;

pub use memory::MemoryObjectStore;

/// Content-addressed source of trees and blobs.
///
/// Implementations report a missing object with [`crate::Error::ObjectNotFound`]
/// and an unavailable backend with [`crate::Error::Fetch`].
pub trait ObjectStore: Send + Sync {
    fn get_tree(&self, hash: &ObjectHash) -> Result<Arc<Tree>>;

    fn get_blob(&self, hash: &ObjectHash) -> Result<Arc<Blob>>;
}
