use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Width of a device identifier in store keys and on the wire.
pub const DEVICE_ID_LEN: usize = 32;

/// The holder advertises this path as removed (tombstone).
pub const FLAG_DELETED: u32 = 1 << 0;
/// The holder knows of the path but cannot serve its content.
pub const FLAG_INVALID: u32 = 1 << 1;
/// The path is a directory.
pub const FLAG_DIRECTORY: u32 = 1 << 2;

/// Opaque, fixed-size identity of a peer device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub [u8; DEVICE_ID_LEN]);

impl DeviceId {
    /// Reserved identity for the device this index runs on.
    pub const LOCAL: DeviceId = DeviceId([0xff; DEVICE_ID_LEN]);

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<DeviceId> {
        if bytes.len() != DEVICE_ID_LEN {
            return None;
        }
        let mut id = [0u8; DEVICE_ID_LEN];
        id.copy_from_slice(bytes);
        Some(DeviceId(id))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({self})")
    }
}

/// Interned 4-byte folder identifier; the persistent name mapping lives in
/// the FOLDER_IDX key family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FolderId(pub u32);

/// Content block metadata, passed through the index untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub offset: u64,
    pub length: u32,
    pub hash: Vec<u8>,
}

/// One advertised version of one path on one device.
///
/// `version` comes from the advertising peer's logical clock; `flags`,
/// `size`, `modified`, and `blocks` are payload carried through unchanged
/// apart from the bits this engine interprets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub version: u64,
    pub flags: u32,
    pub size: u64,
    #[serde(with = "chrono::serde::ts_nanoseconds")]
    pub modified: DateTime<Utc>,
    pub blocks: Vec<BlockRef>,
    /// Assigned by the engine when the record is written; caller values are
    /// discarded. Not part of the encoded record bytes.
    #[serde(skip)]
    pub local_version: u64,
}

impl FileRecord {
    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn is_invalid(&self) -> bool {
        self.flags & FLAG_INVALID != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    /// Whether the two records describe the same advertised state. The
    /// engine-assigned local version is disregarded: two devices holding
    /// the same file agree here even though their write counters differ.
    pub fn is_equivalent(&self, other: &FileRecord) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.flags == other.flags
            && self.size == other.size
            && self.modified == other.modified
            && self.blocks == other.blocks
    }

    /// Tombstone for a path that disappeared from a device's set, stamped
    /// with `version`. Keeps the Directory flag and modification time of
    /// the prior record when one is known.
    pub(crate) fn tombstone(name: &str, prev: Option<&FileRecord>, version: u64) -> FileRecord {
        FileRecord {
            name: name.to_string(),
            version,
            flags: FLAG_DELETED | prev.map_or(0, |p| p.flags & FLAG_DIRECTORY),
            size: 0,
            modified: prev.map_or(DateTime::UNIX_EPOCH, |p| p.modified),
            blocks: Vec::new(),
            local_version: 0,
        }
    }
}

/// Winning record for a path plus the devices able to serve exactly that
/// version. Derived state: recomputed whenever any device entry for the
/// path changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalEntry {
    pub record: FileRecord,
    pub availability: Vec<DeviceId>,
}
