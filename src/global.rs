//! Derivation of the per-path global entry from the device entries.
//!
//! The global entry is a pure function of the candidate records for a
//! path, so recomputing it is idempotent: [`evaluate`] picks the winner and
//! the devices able to serve it, [`refresh`] stages the result into the
//! mutator's batch.

use std::collections::BTreeSet;

use crate::fileset::IndexError;
use crate::keyspace;
use crate::model::{DeviceId, FileRecord, FolderId, GlobalEntry};
use crate::store::{Batch, Store};
use crate::version;

/// Pick the winner among `candidates` and collect the availability list:
/// the devices whose record is equivalent to the winner and servable.
/// `None` when no candidates remain.
pub fn evaluate(candidates: &[(DeviceId, FileRecord)]) -> Option<GlobalEntry> {
    let winner = version::select_winner(candidates)?;
    let record = &candidates[winner].1;
    let mut availability: Vec<DeviceId> = candidates
        .iter()
        .filter(|(_, c)| !c.is_invalid() && c.is_equivalent(record))
        .map(|(device, _)| *device)
        .collect();
    availability.sort();
    Some(GlobalEntry {
        record: record.clone(),
        availability,
    })
}

/// Re-collect the candidates for `name` across `devices` and stage the
/// refreshed global entry into `batch`.
///
/// The running mutator has not committed yet, so its own record is passed
/// as an overlay: `changed` is what the store will hold for
/// `changed_device` after the batch applies (`None` marks removal), and
/// the store is never consulted for that device.
pub(crate) fn refresh(
    store: &dyn Store,
    batch: &mut Batch,
    folder: FolderId,
    devices: &BTreeSet<DeviceId>,
    name: &str,
    changed_device: &DeviceId,
    changed: Option<&FileRecord>,
) -> Result<(), IndexError> {
    let mut candidates = Vec::new();
    if let Some(record) = changed {
        candidates.push((*changed_device, record.clone()));
    }
    for device in devices {
        if device == changed_device {
            continue;
        }
        let key = keyspace::device_key(folder, device, name);
        if let Some(value) = store.get(&key)? {
            candidates.push((*device, keyspace::decode_device_value(&value)?));
        }
    }

    let key = keyspace::global_key(folder, name);
    match evaluate(&candidates) {
        Some(entry) => batch.put(key, keyspace::encode_global_value(&entry)?),
        None => batch.delete(key),
    }
    Ok(())
}
