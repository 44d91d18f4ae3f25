//! Durable storage for materialized nodes.
//!
//! The overlay directory looks like:
//!
//! ```text
//! <root>/info            lock + next node id + clean-shutdown marker
//! <root>/metadata.table  per-node attributes
//! <root>/tmp/            staging area for atomic record writes
//! <root>/00 .. <root>/ff one shard per low byte of the node id
//! <root>/<xx>/<id>       header-framed record for node <id>
//! ```
//!
//! A process holds the overlay exclusively from `open` until `close`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::logging::OverlaySummary;
use crate::model::{NodeId, ObjectHash, ROOT_NODE_ID};
use crate::{Error, Result};

pub mod info;
pub mod metadata;
pub mod record;

pub use info::{InfoFile, InfoState, INFO_FILE};
pub use metadata::{MetadataTable, NodeMetadata, METADATA_FILE};
pub use record::{RecordKind, RecordPath};

pub const TMP_DIR: &str = "tmp";
pub const SHARD_COUNT: usize = 256;

/// Persisted form of one entry in a materialized directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayEntry {
    pub mode: u32,
    /// The object this entry was built from. Kept after materialization so a
    /// damaged record can fall back to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ObjectHash>,
    /// Present for materialized entries; their record lives under this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
    #[serde(default)]
    pub materialized: bool,
}

/// Persisted form of a materialized directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OverlayDir {
    pub entries: BTreeMap<String, OverlayEntry>,
}

#[derive(Debug)]
struct OpenState {
    info: InfoFile,
    metadata: MetadataTable,
}

#[derive(Debug, Default)]
struct Counters {
    records_written: AtomicU64,
    records_removed: AtomicU64,
    corrupt_records: AtomicU64,
}

#[derive(Debug)]
pub struct Overlay {
    root: PathBuf,
    state: RwLock<Option<OpenState>>,
    /// Lower bound recovered from a checkpoint after an unclean shutdown.
    checkpoint_hint: Mutex<Option<NodeId>>,
    counters: Counters,
}

impl Overlay {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: RwLock::new(None),
            checkpoint_hint: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_open(&self) -> bool {
        self.state.read().is_some()
    }

    /// Acquire the overlay and return the next node id to hand out.
    ///
    /// Returns `None` when the previous session did not close cleanly; the
    /// caller must then rescan with [`Overlay::scan_for_next_node_id`].
    pub fn open(&self, create_if_missing: bool) -> Result<Option<NodeId>> {
        let mut guard = self.state.write();
        if guard.is_some() {
            return Err(Error::Storage(format!("{} is already open", self.root.display())).into());
        }

        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(
                    Error::Storage(format!("{} is not a directory", self.root.display())).into(),
                )
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && create_if_missing => {
                fs::create_dir_all(&self.root)
                    .map_err(|e| Error::Storage(format!("create {}: {e}", self.root.display())))?;
            }
            Err(e) => {
                return Err(Error::Storage(format!("{}: {e}", self.root.display())).into());
            }
        }

        let (info, next) = if info::exists(&self.root) {
            let (info, state) = InfoFile::open(&self.root)?;
            let next = if state.clean {
                Some(state.next_id.unwrap_or(ROOT_NODE_ID.next()))
            } else {
                warn!(overlay = %self.root.display(), "overlay was not shut down cleanly");
                *self.checkpoint_hint.lock() = state.next_id;
                None
            };
            // Clear the clean marker right away so a crash from here on is
            // detected on the next open.
            info.write_state(InfoState {
                clean: false,
                next_id: state.next_id,
            })?;
            self.clear_tmp()?;
            (info, next)
        } else if create_if_missing {
            let info = InfoFile::create(&self.root)?;
            self.init_layout()?;
            (info, Some(ROOT_NODE_ID.next()))
        } else {
            return Err(Error::Storage(format!(
                "{} is not an overlay directory",
                self.root.display()
            ))
            .into());
        };

        let metadata = MetadataTable::open(&self.root)?;
        *guard = Some(OpenState { info, metadata });
        info!(overlay = %self.root.display(), next = ?next, "overlay opened");
        Ok(next)
    }

    /// Release the overlay. With `Some(next)` the overlay is marked clean and
    /// `next` is trusted on the following open.
    ///
    /// # Panics
    /// If the overlay is not open.
    pub fn close(&self, next: Option<NodeId>) -> Result<()> {
        let state = self
            .state
            .write()
            .take()
            .unwrap_or_else(|| {
                panic!(
                    "close called on overlay {} that is not open",
                    self.root.display()
                )
            });
        state.metadata.sync()?;
        if let Some(next) = next {
            state.info.write_state(InfoState {
                clean: true,
                next_id: Some(next),
            })?;
        }
        info!(overlay = %self.root.display(), next = ?next, "overlay closed");
        Ok(())
    }

    /// Persist a lower bound for the next id without marking the overlay
    /// clean.
    pub fn checkpoint(&self, next: NodeId) -> Result<()> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| self.not_open())?;
        state.info.write_state(InfoState {
            clean: false,
            next_id: Some(next),
        })
    }

    pub fn checkpoint_hint(&self) -> Option<NodeId> {
        *self.checkpoint_hint.lock()
    }

    /// Read the info file of an overlay that may be in use by someone else.
    pub fn inspect(root: &Path) -> Result<InfoState> {
        InfoFile::inspect(root)
    }

    fn init_layout(&self) -> Result<()> {
        for shard in 0..SHARD_COUNT {
            fs::create_dir_all(self.root.join(format!("{shard:02x}")))?;
        }
        fs::create_dir_all(self.root.join(TMP_DIR))?;
        Ok(())
    }

    fn clear_tmp(&self) -> Result<()> {
        let tmp = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp)?;
        for entry in fs::read_dir(&tmp)? {
            let entry = entry?;
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!(path = %entry.path().display(), error = %e, "failed to remove stale tmp file");
            }
        }
        Ok(())
    }

    fn not_open(&self) -> anyhow::Error {
        Error::Storage(format!("overlay {} is not open", self.root.display())).into()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.read().is_none() {
            return Err(self.not_open());
        }
        Ok(())
    }

    pub fn record_path(&self, node: NodeId) -> PathBuf {
        self.root.join(RecordPath::new(node))
    }

    pub fn has_record(&self, node: NodeId) -> bool {
        fs::symlink_metadata(self.record_path(node)).is_ok()
    }

    fn write_record(&self, node: NodeId, kind: RecordKind, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let final_path = self.record_path(node);
        let tmp_path = self
            .root
            .join(TMP_DIR)
            .join(format!("{node}.{}", uuid::Uuid::new_v4().simple()));

        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&record::encode_header(kind, payload.len() as u64))?;
            file.write_all(payload)?;
            file.sync_data()?;
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&tmp_path, &final_path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        self.counters.records_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_record(&self, node: NodeId, kind: RecordKind) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let contents = match fs::read(self.record_path(node)) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match record::decode_record(node, kind, &contents) {
            Ok(payload) => Ok(Some(payload.to_vec())),
            Err(e) => {
                self.counters.corrupt_records.fetch_add(1, Ordering::Relaxed);
                warn!(node = %node, error = %e, "corrupt overlay record");
                Err(e)
            }
        }
    }

    pub fn save_dir(&self, node: NodeId, dir: &OverlayDir) -> Result<()> {
        let payload = serde_json::to_vec(dir)?;
        self.write_record(node, RecordKind::Directory, &payload)
    }

    pub fn load_dir(&self, node: NodeId) -> Result<Option<OverlayDir>> {
        let Some(payload) = self.read_record(node, RecordKind::Directory)? else {
            return Ok(None);
        };
        let dir = serde_json::from_slice(&payload).map_err(|e| {
            self.counters.corrupt_records.fetch_add(1, Ordering::Relaxed);
            Error::Corruption {
                node,
                reason: format!("undecodable directory payload: {e}"),
            }
        })?;
        Ok(Some(dir))
    }

    /// Write (or overwrite) the content record of a file node.
    pub fn create_file(&self, node: NodeId, contents: &[u8]) -> Result<()> {
        self.write_record(node, RecordKind::File, contents)
    }

    pub fn read_file(&self, node: NodeId) -> Result<Option<Vec<u8>>> {
        self.read_record(node, RecordKind::File)
    }

    /// Delete a node's record and metadata. Missing records are not an error.
    pub fn remove_record(&self, node: NodeId) -> Result<()> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| self.not_open())?;
        match fs::remove_file(self.record_path(node)) {
            Ok(()) => {
                self.counters.records_removed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        state.metadata.clear(node)
    }

    pub fn metadata(&self, node: NodeId) -> Result<Option<NodeMetadata>> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| self.not_open())?;
        state.metadata.get(node)
    }

    pub fn set_metadata(&self, node: NodeId, metadata: &NodeMetadata) -> Result<()> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| self.not_open())?;
        state.metadata.set(node, metadata)
    }

    /// Ids of every record present on disk, in ascending order.
    pub fn record_ids(&self) -> Result<Vec<NodeId>> {
        let mut ids = Vec::new();
        for shard in 0..SHARD_COUNT {
            let shard_dir = self.root.join(format!("{shard:02x}"));
            if !shard_dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&shard_dir).min_depth(1).max_depth(1) {
                let entry = entry.map_err(|e| Error::Storage(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                match name.parse::<u64>() {
                    Ok(raw) if raw > 0 && (raw & 0xff) as usize == shard => {
                        ids.push(NodeId::new(raw))
                    }
                    _ => warn!(path = %entry.path().display(), "ignoring stray file in overlay shard"),
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Compute the next free id from the records on disk: one past the
    /// largest id seen, and never less than `ROOT + 1`.
    pub fn scan_for_next_node_id(&self) -> Result<NodeId> {
        let max = self
            .record_ids()?
            .into_iter()
            .max()
            .unwrap_or(ROOT_NODE_ID);
        let next = max.max(ROOT_NODE_ID).next();
        info!(overlay = %self.root.display(), next = %next, "scanned overlay for next node id");
        Ok(next)
    }

    /// Validate the header of every record, returning the ids that fail
    /// along with the reason.
    pub fn fsck(&self) -> Result<Vec<(NodeId, String)>> {
        self.ensure_open()?;
        let mut bad = Vec::new();
        for node in self.record_ids()? {
            let contents = fs::read(self.record_path(node))?;
            if let Err(e) = record::inspect_record(node, &contents) {
                bad.push((node, e.to_string()));
                continue;
            }
            if contents[..4] == record::DIR_TAG[..] {
                let payload = &contents[record::HEADER_LEN..];
                if let Err(e) = serde_json::from_slice::<OverlayDir>(payload) {
                    bad.push((node, format!("undecodable directory payload: {e}")));
                }
            }
        }
        Ok(bad)
    }

    pub fn summary(&self) -> OverlaySummary {
        OverlaySummary {
            records_written: self.counters.records_written.load(Ordering::Relaxed),
            records_removed: self.counters.records_removed.load(Ordering::Relaxed),
            corrupt_records: self.counters.corrupt_records.load(Ordering::Relaxed),
            next_node_id: None,
            pruned_records: 0,
        }
    }
}
