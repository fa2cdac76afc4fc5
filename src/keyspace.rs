//! Key layout and value encoding for the backing store.
//!
//! One ordered keyspace holds every folder. Each key starts with a family
//! tag, and the component order within a family is chosen so that a forward
//! range scan yields exactly the iteration order the index needs:
//!
//! | family       | layout                                   | value |
//! |--------------|------------------------------------------|-------|
//! | `DEVICE`     | `0x00 · folder(4, BE) · device(32) · name` | local-version prefix (8, LE) + record bytes |
//! | `GLOBAL`     | `0x01 · folder(4, BE) · name`              | global entry bytes |
//! | `FOLDER_IDX` | `0x02 · folder(4, BE)`                     | UTF-8 folder name |
//! | `DEVICE_IDX` | `0x03 · device(32)`                        | sequence number (8, LE) |
//!
//! Record and global-entry bytes are bincode over the serde model, which is
//! deterministic: equal records encode to equal bytes. The engine-assigned
//! local version rides in front of the record bytes instead of inside them,
//! so equivalence checks and counter reseeding read it without a full
//! decode.

use thiserror::Error;

use crate::model::{DeviceId, FileRecord, FolderId, GlobalEntry, DEVICE_ID_LEN};

pub const KEY_TYPE_DEVICE: u8 = 0x00;
pub const KEY_TYPE_GLOBAL: u8 = 0x01;
pub const KEY_TYPE_FOLDER_IDX: u8 = 0x02;
pub const KEY_TYPE_DEVICE_IDX: u8 = 0x03;

const DEVICE_KEY_HDR: usize = 1 + 4 + DEVICE_ID_LEN;
const GLOBAL_KEY_HDR: usize = 1 + 4;
const LOCAL_VERSION_PREFIX: usize = 8;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("undecodable record bytes: {0}")]
    Record(#[from] bincode::Error),
    #[error("key too short for its family")]
    ShortKey,
    #[error("value too short for its family")]
    ShortValue,
    #[error("name is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
}

pub fn device_key(folder: FolderId, device: &DeviceId, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(DEVICE_KEY_HDR + name.len());
    key.push(KEY_TYPE_DEVICE);
    key.extend_from_slice(&folder.0.to_be_bytes());
    key.extend_from_slice(device.as_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

/// Prefix covering every entry a device holds in a folder.
pub fn device_prefix(folder: FolderId, device: &DeviceId) -> Vec<u8> {
    device_key(folder, device, "")
}

/// Prefix covering every device entry in a folder.
pub fn device_family_prefix(folder: FolderId) -> Vec<u8> {
    let mut key = Vec::with_capacity(GLOBAL_KEY_HDR);
    key.push(KEY_TYPE_DEVICE);
    key.extend_from_slice(&folder.0.to_be_bytes());
    key
}

pub fn global_key(folder: FolderId, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(GLOBAL_KEY_HDR + name.len());
    key.push(KEY_TYPE_GLOBAL);
    key.extend_from_slice(&folder.0.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn global_prefix(folder: FolderId) -> Vec<u8> {
    global_key(folder, "")
}

pub fn folder_idx_key(folder: FolderId) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(KEY_TYPE_FOLDER_IDX);
    key.extend_from_slice(&folder.0.to_be_bytes());
    key
}

pub fn device_idx_key(device: &DeviceId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + DEVICE_ID_LEN);
    key.push(KEY_TYPE_DEVICE_IDX);
    key.extend_from_slice(device.as_bytes());
    key
}

/// Smallest key strictly above every key starting with `prefix`, for use as
/// an exclusive range end. Empty result means no finite bound exists; the
/// store treats that as "to the end of the keyspace".
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    for i in (0..end.len()).rev() {
        if end[i] != 0xff {
            end[i] += 1;
            end.truncate(i + 1);
            return end;
        }
    }
    Vec::new()
}

pub fn split_device_key(key: &[u8]) -> Result<(FolderId, DeviceId, &str), CodecError> {
    if key.len() < DEVICE_KEY_HDR {
        return Err(CodecError::ShortKey);
    }
    let folder = FolderId(u32::from_be_bytes([key[1], key[2], key[3], key[4]]));
    let device = DeviceId::from_slice(&key[5..DEVICE_KEY_HDR]).ok_or(CodecError::ShortKey)?;
    let name = std::str::from_utf8(&key[DEVICE_KEY_HDR..])?;
    Ok((folder, device, name))
}

pub fn name_from_global_key(key: &[u8]) -> Result<&str, CodecError> {
    if key.len() < GLOBAL_KEY_HDR {
        return Err(CodecError::ShortKey);
    }
    Ok(std::str::from_utf8(&key[GLOBAL_KEY_HDR..])?)
}

pub fn folder_from_idx_key(key: &[u8]) -> Result<FolderId, CodecError> {
    if key.len() != 5 {
        return Err(CodecError::ShortKey);
    }
    Ok(FolderId(u32::from_be_bytes([key[1], key[2], key[3], key[4]])))
}

pub fn encode_device_value(record: &FileRecord) -> Result<Vec<u8>, CodecError> {
    let mut value = record.local_version.to_le_bytes().to_vec();
    value.extend(bincode::serialize(record)?);
    Ok(value)
}

pub fn decode_device_value(value: &[u8]) -> Result<FileRecord, CodecError> {
    let mut record: FileRecord = bincode::deserialize(record_bytes(value)?)?;
    record.local_version = local_version_from_value(value)?;
    Ok(record)
}

/// The engine-assigned local version, without decoding the record.
pub fn local_version_from_value(value: &[u8]) -> Result<u64, CodecError> {
    if value.len() < LOCAL_VERSION_PREFIX {
        return Err(CodecError::ShortValue);
    }
    let mut prefix = [0u8; LOCAL_VERSION_PREFIX];
    prefix.copy_from_slice(&value[..LOCAL_VERSION_PREFIX]);
    Ok(u64::from_le_bytes(prefix))
}

fn record_bytes(value: &[u8]) -> Result<&[u8], CodecError> {
    if value.len() < LOCAL_VERSION_PREFIX {
        return Err(CodecError::ShortValue);
    }
    Ok(&value[LOCAL_VERSION_PREFIX..])
}

pub fn encode_global_value(entry: &GlobalEntry) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(entry)?)
}

pub fn decode_global_value(value: &[u8]) -> Result<GlobalEntry, CodecError> {
    Ok(bincode::deserialize(value)?)
}

pub fn encode_seq(seq: u64) -> Vec<u8> {
    seq.to_le_bytes().to_vec()
}

pub fn decode_seq(value: &[u8]) -> Result<u64, CodecError> {
    if value.len() != 8 {
        return Err(CodecError::ShortValue);
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(value);
    Ok(u64::from_le_bytes(bytes))
}
