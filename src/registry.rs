//! Folder bookkeeping: id interning, enumeration, teardown, and the
//! process-wide write locks every file set on a folder shares.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::fileset::IndexError;
use crate::keyspace::{self, CodecError};
use crate::model::{DeviceId, FolderId};
use crate::store::{Batch, Store};

static FOLDER_LOCKS: Lazy<Mutex<HashMap<String, Arc<RwLock<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

// Guards first-sight folder-id allocation. The per-folder locks cannot:
// two unseen folder names hold different locks, and both would compute the
// same free id.
static FOLDER_ASSIGN: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Write lock for `folder`, shared by every file set bound to it in this
/// process. Mutations serialize on it; readers hold it shared for the
/// duration of a call.
pub(crate) fn folder_lock(folder: &str) -> Arc<RwLock<()>> {
    let mut locks = FOLDER_LOCKS.lock();
    locks
        .entry(folder.to_string())
        .or_insert_with(|| Arc::new(RwLock::new(())))
        .clone()
}

/// Folder names present in the store, in the order they were first seen.
pub fn list_folders(store: &dyn Store) -> Result<Vec<String>, IndexError> {
    let start = [keyspace::KEY_TYPE_FOLDER_IDX];
    let end = keyspace::prefix_end(&start);
    let mut folders = Vec::new();
    for pair in store.range(&start, &end) {
        let (_, value) = pair?;
        let name =
            String::from_utf8(value).map_err(|err| CodecError::from(err.utf8_error()))?;
        folders.push(name);
    }
    Ok(folders)
}

/// Id of `folder` if the store already knows it.
pub(crate) fn folder_id(store: &dyn Store, folder: &str) -> Result<Option<FolderId>, IndexError> {
    Ok(scan_folders(store, folder)?.0)
}

/// Id of `folder`, assigning and persisting the next free one on first
/// sight. Allocation is serialized process-wide so concurrent first opens
/// never share an id.
pub(crate) fn folder_id_or_assign(store: &dyn Store, folder: &str) -> Result<FolderId, IndexError> {
    let _assign = FOLDER_ASSIGN.lock();
    let (found, next) = scan_folders(store, folder)?;
    if let Some(id) = found {
        return Ok(id);
    }
    let id = FolderId(next);
    let mut batch = Batch::new();
    batch.put(keyspace::folder_idx_key(id), folder.as_bytes().to_vec());
    store.apply(batch)?;
    info!("assigned folder id {} to {folder:?}", id.0);
    Ok(id)
}

fn scan_folders(store: &dyn Store, folder: &str) -> Result<(Option<FolderId>, u32), IndexError> {
    let start = [keyspace::KEY_TYPE_FOLDER_IDX];
    let end = keyspace::prefix_end(&start);
    let mut next = 0u32;
    let mut found = None;
    for pair in store.range(&start, &end) {
        let (key, value) = pair?;
        let id = keyspace::folder_from_idx_key(&key)?;
        next = next.max(id.0 + 1);
        if found.is_none() && value == folder.as_bytes() {
            found = Some(id);
        }
    }
    Ok((found, next))
}

/// Remove every key belonging to `folder`, leaving other folders
/// untouched. Live file sets bound to the folder subsequently observe an
/// empty index; their in-memory counters are not reset.
pub fn drop_folder(store: &dyn Store, folder: &str) -> Result<(), IndexError> {
    let lock = folder_lock(folder);
    let _guard = lock.write();

    let id = folder_id(store, folder)?
        .ok_or_else(|| IndexError::UnknownFolder(folder.to_string()))?;

    let mut batch = Batch::new();
    for prefix in [
        keyspace::device_family_prefix(id),
        keyspace::global_prefix(id),
    ] {
        let end = keyspace::prefix_end(&prefix);
        for pair in store.range(&prefix, &end) {
            let (key, _) = pair?;
            batch.delete(key);
        }
    }
    batch.delete(keyspace::folder_idx_key(id));
    let keys = batch.len();
    store.apply(batch)?;
    info!("dropped folder {folder:?} ({keys} keys)");
    Ok(())
}

/// Ensure `device` has a DEVICE_IDX entry, staging the write into the
/// mutator's batch on first sight.
pub(crate) fn intern_device(
    store: &dyn Store,
    batch: &mut Batch,
    device: &DeviceId,
) -> Result<(), IndexError> {
    let key = keyspace::device_idx_key(device);
    if store.get(&key)?.is_some() {
        return Ok(());
    }
    let start = [keyspace::KEY_TYPE_DEVICE_IDX];
    let end = keyspace::prefix_end(&start);
    let mut next = 0u64;
    for pair in store.range(&start, &end) {
        let (_, value) = pair?;
        next = next.max(keyspace::decode_seq(&value)? + 1);
    }
    batch.put(key, keyspace::encode_seq(next));
    debug!("interned device {device} as sequence {next}");
    Ok(())
}
