//! Fixed-slot table of small per-node attributes (`metadata.table`).
//!
//! A 64-byte header (`OVMT`, version, slot size) is followed by one 32-byte
//! slot per node id, addressed directly by id. Unwritten slots are holes and
//! read back as absent.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use super::record::{HEADER_LEN, HEADER_VERSION};
use crate::model::NodeId;
use crate::{Error, Result};

pub const METADATA_FILE: &str = "metadata.table";
const METADATA_TAG: &[u8; 4] = b"OVMT";
pub const SLOT_SIZE: usize = 32;
const SLOT_PRESENT: u32 = 0x1;

/// Attributes kept alongside a materialized node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeMetadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
}

impl NodeMetadata {
    pub fn now(mode: u32) -> Self {
        let since = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            mode,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            mtime_secs: since.as_secs() as i64,
            mtime_nanos: since.subsec_nanos(),
        }
    }

    fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut slot = [0u8; SLOT_SIZE];
        slot[0..4].copy_from_slice(&SLOT_PRESENT.to_le_bytes());
        slot[4..8].copy_from_slice(&self.mode.to_le_bytes());
        slot[8..12].copy_from_slice(&self.uid.to_le_bytes());
        slot[12..16].copy_from_slice(&self.gid.to_le_bytes());
        slot[16..24].copy_from_slice(&self.mtime_secs.to_le_bytes());
        slot[24..28].copy_from_slice(&self.mtime_nanos.to_le_bytes());
        slot
    }

    fn decode(slot: &[u8; SLOT_SIZE]) -> Option<Self> {
        let u32_at =
            |i: usize| u32::from_le_bytes([slot[i], slot[i + 1], slot[i + 2], slot[i + 3]]);
        if u32_at(0) & SLOT_PRESENT == 0 {
            return None;
        }
        let mut secs = [0u8; 8];
        secs.copy_from_slice(&slot[16..24]);
        Some(Self {
            mode: u32_at(4),
            uid: u32_at(8),
            gid: u32_at(12),
            mtime_secs: i64::from_le_bytes(secs),
            mtime_nanos: u32_at(24),
        })
    }
}

#[derive(Debug)]
pub struct MetadataTable {
    file: File,
}

impl MetadataTable {
    /// Open the table under `dir`, creating it with a fresh header if absent.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            let mut header = [0u8; HEADER_LEN];
            header[..4].copy_from_slice(METADATA_TAG);
            header[4..8].copy_from_slice(&HEADER_VERSION.to_le_bytes());
            header[16..20].copy_from_slice(&(SLOT_SIZE as u32).to_le_bytes());
            file.write_all_at(&header, 0)?;
            file.sync_data()?;
            return Ok(Self { file });
        }

        let mut header = [0u8; HEADER_LEN];
        file.read_exact_at(&mut header, 0).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::Storage(format!("{}: short header", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        if &header[..4] != METADATA_TAG {
            return Err(Error::Storage(format!("{}: bad identifier", path.display())).into());
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != HEADER_VERSION {
            return Err(Error::Storage(format!(
                "{}: unsupported version {version}",
                path.display()
            ))
            .into());
        }
        let slot_size = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
        if slot_size as usize != SLOT_SIZE {
            return Err(Error::Storage(format!(
                "{}: slot size {slot_size} != {SLOT_SIZE}",
                path.display()
            ))
            .into());
        }
        Ok(Self { file })
    }

    fn offset(node: NodeId) -> u64 {
        HEADER_LEN as u64 + node.get() * SLOT_SIZE as u64
    }

    pub fn get(&self, node: NodeId) -> Result<Option<NodeMetadata>> {
        let mut slot = [0u8; SLOT_SIZE];
        let read = self.file.read_at(&mut slot, Self::offset(node))?;
        if read == 0 {
            return Ok(None);
        }
        if read < SLOT_SIZE {
            return Err(Error::Corruption {
                node,
                reason: "short metadata slot".into(),
            }
            .into());
        }
        Ok(NodeMetadata::decode(&slot))
    }

    pub fn set(&self, node: NodeId, metadata: &NodeMetadata) -> Result<()> {
        self.file.write_all_at(&metadata.encode(), Self::offset(node))?;
        Ok(())
    }

    pub fn clear(&self, node: NodeId) -> Result<()> {
        let len = self.file.metadata()?.len();
        if Self::offset(node) >= len {
            return Ok(());
        }
        self.file.write_all_at(&[0u8; SLOT_SIZE], Self::offset(node))?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
