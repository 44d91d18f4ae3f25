//! On-disk framing for overlay records.
//!
//! Every record starts with a fixed 64-byte header:
//!
//! | bytes  | field                                   |
//! |--------|-----------------------------------------|
//! | 0..4   | identifier (`OVDR` or `OVFL`)           |
//! | 4..8   | format version, u32 LE                  |
//! | 8..16  | payload length in bytes, u64 LE         |
//! | 16..64 | reserved, zero                          |
//!
//! The payload length lets a reader tell a complete record from one that was
//! cut short by a crash mid-write.

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::model::NodeId;
use crate::{Error, Result};

pub const HEADER_LEN: usize = 64;
pub const HEADER_VERSION: u32 = 1;
pub const DIR_TAG: &[u8; 4] = b"OVDR";
pub const FILE_TAG: &[u8; 4] = b"OVFL";

/// Digits needed for the decimal form of any u64.
pub const MAX_DECIMAL_NODE_ID_LEN: usize = 20;
/// Two hex shard digits, a separator, and the decimal id.
pub const MAX_RECORD_PATH_LEN: usize = 2 + 1 + MAX_DECIMAL_NODE_ID_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Directory,
    File,
}

impl RecordKind {
    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            RecordKind::Directory => DIR_TAG,
            RecordKind::File => FILE_TAG,
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        if tag == DIR_TAG {
            Some(RecordKind::Directory)
        } else if tag == FILE_TAG {
            Some(RecordKind::File)
        } else {
            None
        }
    }
}

pub fn encode_header(kind: RecordKind, payload_len: u64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(kind.tag());
    header[4..8].copy_from_slice(&HEADER_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Frame `payload` as a complete record.
pub fn encode_record(kind: RecordKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&encode_header(kind, payload.len() as u64));
    out.extend_from_slice(payload);
    out
}

/// Parse a record header without checking its kind against an expectation.
pub fn inspect_record(node: NodeId, contents: &[u8]) -> Result<RecordKind> {
    if contents.len() < HEADER_LEN {
        return Err(corruption(node, format!("short header ({} bytes)", contents.len())));
    }
    let kind = RecordKind::from_tag(&contents[..4]).ok_or_else(|| {
        corruption(
            node,
            format!("unknown identifier {:?}", String::from_utf8_lossy(&contents[..4])),
        )
    })?;
    let version = u32::from_le_bytes([contents[4], contents[5], contents[6], contents[7]]);
    if version != HEADER_VERSION {
        return Err(corruption(node, format!("unsupported version {version}")));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&contents[8..16]);
    let expected = u64::from_le_bytes(len_bytes);
    let actual = (contents.len() - HEADER_LEN) as u64;
    if expected != actual {
        return Err(corruption(
            node,
            format!("payload length {actual} does not match header length {expected}"),
        ));
    }
    Ok(kind)
}

/// Validate a record of the expected kind and return its payload.
pub fn decode_record(node: NodeId, kind: RecordKind, contents: &[u8]) -> Result<&[u8]> {
    let found = inspect_record(node, contents)?;
    if found != kind {
        return Err(corruption(
            node,
            format!("expected {kind:?} record, found {found:?}"),
        ));
    }
    Ok(&contents[HEADER_LEN..])
}

fn corruption(node: NodeId, reason: String) -> anyhow::Error {
    Error::Corruption { node, reason }.into()
}

/// Path of a record relative to the overlay root, `<shard>/<id>`, built in a
/// fixed-size buffer.
#[derive(Clone, Copy)]
pub struct RecordPath {
    buf: [u8; MAX_RECORD_PATH_LEN],
    len: usize,
}

impl RecordPath {
    pub fn new(node: NodeId) -> Self {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut buf = [0u8; MAX_RECORD_PATH_LEN];
        let shard = node.shard();
        buf[0] = HEX[(shard >> 4) as usize];
        buf[1] = HEX[(shard & 0x0f) as usize];
        buf[2] = b'/';

        let mut digits = [0u8; MAX_DECIMAL_NODE_ID_LEN];
        let mut n = node.get();
        let mut start = MAX_DECIMAL_NODE_ID_LEN;
        loop {
            start -= 1;
            digits[start] = b'0' + (n % 10) as u8;
            n /= 10;
            if n == 0 {
                break;
            }
        }
        let digits = &digits[start..];
        buf[3..3 + digits.len()].copy_from_slice(digits);
        Self {
            buf,
            len: 3 + digits.len(),
        }
    }

    pub fn as_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(&self.buf[..self.len]))
    }

    pub fn shard_dir(&self) -> &Path {
        Path::new(OsStr::from_bytes(&self.buf[..2]))
    }
}

impl AsRef<Path> for RecordPath {
    fn as_ref(&self) -> &Path {
        self.as_path()
    }
}

impl fmt::Debug for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordPath({})", self.as_path().display())
    }
}
