//! The overlay info file: exclusive-access lock plus the persisted
//! next-node-id and clean-shutdown marker.
//!
//! Layout: a 64-byte header (`OVIF`, version, payload length) followed by a
//! 16-byte payload: byte 0 is the clean flag, bytes 8..16 the next id
//! (u64 LE, zero when unknown).

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use super::record::{HEADER_LEN, HEADER_VERSION};
use crate::model::NodeId;
use crate::{Error, Result};

pub const INFO_FILE: &str = "info";
const INFO_TAG: &[u8; 4] = b"OVIF";
const INFO_PAYLOAD_LEN: usize = 16;
const INFO_LEN: usize = HEADER_LEN + INFO_PAYLOAD_LEN;

/// Decoded contents of the info file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfoState {
    /// Set only by a clean close; cleared as soon as the overlay is opened.
    pub clean: bool,
    /// On a clean close, the next id to hand out. Otherwise the last
    /// checkpointed lower bound, if any.
    pub next_id: Option<NodeId>,
}

/// Open handle on the info file holding the exclusive lock. Dropping it
/// releases the lock.
#[derive(Debug)]
pub struct InfoFile {
    file: File,
    path: PathBuf,
}

impl InfoFile {
    /// Create a fresh info file and lock it.
    pub fn create(dir: &Path) -> Result<Self> {
        let path = dir.join(INFO_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("create {}: {e}", path.display())))?;
        lock_exclusive(&file, dir)?;
        let info = Self { file, path };
        info.write_state(InfoState::default())?;
        Ok(info)
    }

    /// Open and lock an existing info file, returning its current state.
    pub fn open(dir: &Path) -> Result<(Self, InfoState)> {
        let path = dir.join(INFO_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))?;
        lock_exclusive(&file, dir)?;
        let state = read_state(&file, &path)?;
        Ok((Self { file, path }, state))
    }

    /// Read the state of an overlay without taking its lock.
    pub fn inspect(dir: &Path) -> Result<InfoState> {
        let path = dir.join(INFO_FILE);
        let file = File::open(&path)
            .map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))?;
        read_state(&file, &path)
    }

    pub fn write_state(&self, state: InfoState) -> Result<()> {
        let mut buf = [0u8; INFO_LEN];
        buf[..4].copy_from_slice(INFO_TAG);
        buf[4..8].copy_from_slice(&HEADER_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&(INFO_PAYLOAD_LEN as u64).to_le_bytes());
        buf[HEADER_LEN] = u8::from(state.clean);
        let next = state.next_id.map(NodeId::get).unwrap_or(0);
        buf[HEADER_LEN + 8..].copy_from_slice(&next.to_le_bytes());
        self.file.write_all_at(&buf, 0)?;
        self.file.sync_data()?;
        debug!(path = %self.path.display(), clean = state.clean, next = next, "info file updated");
        Ok(())
    }
}

fn read_state(file: &File, path: &Path) -> Result<InfoState> {
    let mut buf = [0u8; INFO_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_at(&mut buf[filled..], filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled < INFO_LEN {
        return Err(Error::Storage(format!("{} is truncated", path.display())).into());
    }
    if &buf[..4] != INFO_TAG {
        let msg = format!("{} is not an overlay info file", path.display());
        return Err(Error::Storage(msg).into());
    }
    let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version != HEADER_VERSION {
        return Err(Error::Storage(format!(
            "{}: unsupported overlay version {version}",
            path.display()
        ))
        .into());
    }
    let mut next = [0u8; 8];
    next.copy_from_slice(&buf[HEADER_LEN + 8..]);
    let next = u64::from_le_bytes(next);
    Ok(InfoState {
        clean: buf[HEADER_LEN] == 1,
        next_id: (next != 0).then(|| NodeId::new(next)),
    })
}

fn lock_exclusive(file: &File, dir: &Path) -> Result<()> {
    file.try_lock_exclusive().map_err(|e| {
        if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
            Error::OverlayLocked(dir.display().to_string())
        } else {
            Error::Storage(format!("lock {}: {e}", dir.display()))
        }
    })?;
    Ok(())
}

/// Whether `dir` already holds an info file.
pub fn exists(dir: &Path) -> bool {
    fs::symlink_metadata(dir.join(INFO_FILE)).is_ok()
}
