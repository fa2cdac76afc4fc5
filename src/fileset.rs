//! Per-folder index of what every device advertises, with the derived
//! global and need views.
//!
//! A [`FileSet`] is bound to one folder. Mutators install or merge a
//! device's advertised records, diff them against what the store already
//! holds, and refresh the affected global entries; every write of one call
//! lands in a single atomic batch. Readers hold the folder lock shared for
//! the duration of a call, so each call observes a consistent point in
//! time. Visitors must not call a mutator on the same folder: the lock is
//! held and the call would deadlock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::clock::{self, LogicalClock};
use crate::global;
use crate::keyspace::{self, CodecError};
use crate::model::{DeviceId, FileRecord, FolderId, GlobalEntry};
use crate::registry;
use crate::store::{Batch, KvPair, Store, StoreError};
use crate::version;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("corrupt index entry: {0}")]
    Codec(#[from] CodecError),
    #[error("unknown folder {0:?}")]
    UnknownFolder(String),
}

/// How iterators treat stored entries that fail to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorruptionPolicy {
    /// Surface the error to the caller.
    #[default]
    Abort,
    /// Log a warning and skip the entry.
    Skip,
}

/// Construction-time knobs for a [`FileSet`].
#[derive(Clone)]
pub struct FileSetOptions {
    pub corruption: CorruptionPolicy,
    /// Clock used to stamp synthesized tombstones. The process-global
    /// clock is the default, so tombstones dominate every version any
    /// file set in the process has ingested.
    pub clock: Arc<LogicalClock>,
}

impl Default for FileSetOptions {
    fn default() -> Self {
        FileSetOptions {
            corruption: CorruptionPolicy::Abort,
            clock: clock::global(),
        }
    }
}

/// The per-folder index. Cheap to construct; multiple instances bound to
/// the same folder share one write lock through the process-wide registry.
pub struct FileSet {
    folder: String,
    folder_id: FolderId,
    store: Arc<dyn Store>,
    lock: Arc<RwLock<()>>,
    clock: Arc<LogicalClock>,
    corruption: CorruptionPolicy,
    devices: Mutex<BTreeSet<DeviceId>>,
    counters: Mutex<HashMap<DeviceId, u64>>,
}

impl FileSet {
    pub fn open(store: Arc<dyn Store>, folder: &str) -> Result<FileSet, IndexError> {
        Self::open_with(store, folder, FileSetOptions::default())
    }

    pub fn open_with(
        store: Arc<dyn Store>,
        folder: &str,
        options: FileSetOptions,
    ) -> Result<FileSet, IndexError> {
        // First-sight id assignment happens under the folder's write lock,
        // the same way drop_folder touches the FOLDER_IDX entry.
        let lock = registry::folder_lock(folder);
        let folder_id = {
            let _guard = lock.write();
            registry::folder_id_or_assign(store.as_ref(), folder)?
        };
        let set = FileSet {
            folder: folder.to_string(),
            folder_id,
            store,
            lock,
            clock: options.clock,
            corruption: options.corruption,
            devices: Mutex::new(BTreeSet::new()),
            counters: Mutex::new(HashMap::new()),
        };
        set.load()?;
        Ok(set)
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Seed the device list, the per-device counters, and the clock from
    /// what the store already holds for this folder.
    fn load(&self) -> Result<(), IndexError> {
        let _guard = self.lock.read();
        let start = keyspace::device_family_prefix(self.folder_id);
        let end = keyspace::prefix_end(&start);
        let mut devices = self.devices.lock();
        let mut counters = self.counters.lock();
        for pair in self.store.range(&start, &end) {
            let (key, value) = pair?;
            let (_, device, _) = keyspace::split_device_key(&key)?;
            devices.insert(device);
            if let Some(record) = self.admit(keyspace::decode_device_value(&value))? {
                self.clock.observe(record.version);
                let counter = counters.entry(device).or_insert(0);
                *counter = (*counter).max(record.local_version);
            }
        }
        Ok(())
    }

    // ---- mutators ----------------------------------------------------

    /// Install `records` as the complete have set for `device`. Paths
    /// absent from `records` are removed without leaving a tombstone;
    /// this is "the device just told us its whole set".
    pub fn replace(&self, device: &DeviceId, records: &[FileRecord]) -> Result<(), IndexError> {
        self.replace_inner(device, records, false)
    }

    /// Like [`FileSet::replace`], but every path that was present before
    /// and is absent now becomes a tombstone stamped from the logical
    /// clock. For callers whose absence is authoritative, normally the
    /// local device after a scan.
    pub fn replace_with_delete(
        &self,
        device: &DeviceId,
        records: &[FileRecord],
    ) -> Result<(), IndexError> {
        self.replace_inner(device, records, true)
    }

    /// Merge `records` into the have set for `device`: named paths are
    /// upserted, everything else is untouched.
    pub fn update(&self, device: &DeviceId, records: &[FileRecord]) -> Result<(), IndexError> {
        let _guard = self.lock.write();

        let (input, _) = normalize(records);
        for record in input.values() {
            self.clock.observe(record.version);
        }

        let mut batch = Batch::new();
        let mut touched = Vec::new();
        let base = self.local_version(device);
        let mut next = base;

        for (name, mut incoming) in input {
            let key = keyspace::device_key(self.folder_id, device, &name);
            let old = match self.store.get(&key)? {
                Some(value) => self.admit(keyspace::decode_device_value(&value))?,
                None => None,
            };
            if old.as_ref().map_or(false, |old| old.is_equivalent(&incoming)) {
                continue;
            }
            next += 1;
            incoming.local_version = next;
            batch.put(key, keyspace::encode_device_value(&incoming)?);
            touched.push((name, Some(incoming)));
        }

        if batch.is_empty() {
            trace!("{}: update for {device} changed nothing", self.folder);
            return Ok(());
        }
        self.commit(device, batch, &touched, next)?;
        debug!(
            "{}: update for {device} wrote {} changes",
            self.folder,
            next - base
        );
        Ok(())
    }

    fn replace_inner(
        &self,
        device: &DeviceId,
        records: &[FileRecord],
        tombstones: bool,
    ) -> Result<(), IndexError> {
        let _guard = self.lock.write();

        let (mut input, reserved) = normalize(records);
        for record in input.values() {
            self.clock.observe(record.version);
        }

        let existing = self.existing_entries(device)?;

        let mut batch = Batch::new();
        let mut touched: Vec<(String, Option<FileRecord>)> = Vec::new();
        let base = self.local_version(device);
        let mut next = base;

        for (name, old) in existing {
            match input.remove(&name) {
                Some(mut incoming) => {
                    if old.as_ref().map_or(false, |old| old.is_equivalent(&incoming)) {
                        continue;
                    }
                    next += 1;
                    incoming.local_version = next;
                    batch.put(
                        keyspace::device_key(self.folder_id, device, &name),
                        keyspace::encode_device_value(&incoming)?,
                    );
                    touched.push((name, Some(incoming)));
                }
                None => {
                    // Reserved (version 0) names are treated as unmentioned.
                    if reserved.contains(&name) {
                        continue;
                    }
                    if tombstones {
                        if old.as_ref().map_or(false, |old| old.is_deleted()) {
                            continue;
                        }
                        let mut stone =
                            FileRecord::tombstone(&name, old.as_ref(), self.clock.tick());
                        next += 1;
                        stone.local_version = next;
                        batch.put(
                            keyspace::device_key(self.folder_id, device, &name),
                            keyspace::encode_device_value(&stone)?,
                        );
                        touched.push((name, Some(stone)));
                    } else {
                        next += 1;
                        batch.delete(keyspace::device_key(self.folder_id, device, &name));
                        touched.push((name, None));
                    }
                }
            }
        }

        // Anything left in the input is a path the device did not have.
        for (name, mut incoming) in input {
            next += 1;
            incoming.local_version = next;
            batch.put(
                keyspace::device_key(self.folder_id, device, &name),
                keyspace::encode_device_value(&incoming)?,
            );
            touched.push((name, Some(incoming)));
        }

        if batch.is_empty() {
            trace!("{}: replace for {device} changed nothing", self.folder);
            return Ok(());
        }
        self.commit(device, batch, &touched, next)?;
        debug!(
            "{}: replace for {device} wrote {} changes",
            self.folder,
            next - base
        );
        Ok(())
    }

    /// Stage the global refresh for every touched path, commit the batch,
    /// then publish the advanced counter.
    fn commit(
        &self,
        device: &DeviceId,
        mut batch: Batch,
        touched: &[(String, Option<FileRecord>)],
        counter: u64,
    ) -> Result<(), IndexError> {
        let devices = {
            let mut devices = self.devices.lock();
            if devices.insert(*device) {
                registry::intern_device(self.store.as_ref(), &mut batch, device)?;
            }
            devices.clone()
        };
        for (name, record) in touched {
            global::refresh(
                self.store.as_ref(),
                &mut batch,
                self.folder_id,
                &devices,
                name,
                device,
                record.as_ref(),
            )?;
        }
        self.store.apply(batch)?;
        self.counters.lock().insert(*device, counter);
        Ok(())
    }

    // ---- readers -----------------------------------------------------

    /// Record `device` advertises for `name`, if any.
    pub fn get(&self, device: &DeviceId, name: &str) -> Result<Option<FileRecord>, IndexError> {
        let _guard = self.lock.read();
        match self
            .store
            .get(&keyspace::device_key(self.folder_id, device, name))?
        {
            Some(value) => Ok(Some(keyspace::decode_device_value(&value)?)),
            None => Ok(None),
        }
    }

    /// The winning record for `name` across all devices, if any.
    pub fn get_global(&self, name: &str) -> Result<Option<FileRecord>, IndexError> {
        Ok(self.global_entry(name)?.map(|entry| entry.record))
    }

    /// Devices holding a servable copy of the winning record for `name`.
    /// Deterministically ordered; callers should treat it as a set.
    pub fn availability(&self, name: &str) -> Result<Vec<DeviceId>, IndexError> {
        Ok(self
            .global_entry(name)?
            .map(|entry| entry.availability)
            .unwrap_or_default())
    }

    fn global_entry(&self, name: &str) -> Result<Option<GlobalEntry>, IndexError> {
        let _guard = self.lock.read();
        match self
            .store
            .get(&keyspace::global_key(self.folder_id, name))?
        {
            Some(value) => Ok(Some(keyspace::decode_global_value(&value)?)),
            None => Ok(None),
        }
    }

    /// Current change counter for `device`. Strictly larger after any
    /// mutation that created, changed, or removed one of its entries.
    pub fn local_version(&self, device: &DeviceId) -> u64 {
        self.counters.lock().get(device).copied().unwrap_or(0)
    }

    /// Devices known to hold entries in this folder.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.lock().iter().copied().collect()
    }

    /// Visit every record `device` advertises, in path order. Returning
    /// `false` stops the walk.
    pub fn with_have<F>(&self, device: &DeviceId, mut visitor: F) -> Result<(), IndexError>
    where
        F: FnMut(&FileRecord) -> bool,
    {
        let _guard = self.lock.read();
        let start = keyspace::device_prefix(self.folder_id, device);
        let end = keyspace::prefix_end(&start);
        for pair in self.store.range(&start, &end) {
            let (_, value) = pair?;
            let record = match self.admit(keyspace::decode_device_value(&value))? {
                Some(record) => record,
                None => continue,
            };
            if !visitor(&record) {
                break;
            }
        }
        Ok(())
    }

    /// Visit every global entry, in path order.
    pub fn with_global<F>(&self, mut visitor: F) -> Result<(), IndexError>
    where
        F: FnMut(&GlobalEntry) -> bool,
    {
        let _guard = self.lock.read();
        let start = keyspace::global_prefix(self.folder_id);
        let end = keyspace::prefix_end(&start);
        for pair in self.store.range(&start, &end) {
            let (_, value) = pair?;
            let entry = match self.admit(keyspace::decode_global_value(&value))? {
                Some(entry) => entry,
                None => continue,
            };
            if !visitor(&entry) {
                break;
            }
        }
        Ok(())
    }

    /// Visit, in path order, the global entries `device` lacks or holds an
    /// older copy of. Tombstones for paths the device never had are not
    /// offered, and neither are entries whose winner has no servable
    /// source. One merged pass over the global range and the device's own
    /// range; nothing is materialized.
    pub fn with_need<F>(&self, device: &DeviceId, mut visitor: F) -> Result<(), IndexError>
    where
        F: FnMut(&GlobalEntry) -> bool,
    {
        let _guard = self.lock.read();
        let global_start = keyspace::global_prefix(self.folder_id);
        let global_end = keyspace::prefix_end(&global_start);
        let have_start = keyspace::device_prefix(self.folder_id, device);
        let have_end = keyspace::prefix_end(&have_start);

        let mut have_iter = self.store.range(&have_start, &have_end);
        let mut pending = next_have_pair(have_iter.as_mut())?;

        for pair in self.store.range(&global_start, &global_end) {
            let (key, value) = pair?;
            let name = keyspace::name_from_global_key(&key)?;
            let entry = match self.admit(keyspace::decode_global_value(&value))? {
                Some(entry) => entry,
                None => continue,
            };

            while pending
                .as_ref()
                .map_or(false, |(have_name, _)| have_name.as_str() < name)
            {
                pending = next_have_pair(have_iter.as_mut())?;
            }
            let have = match &pending {
                Some((have_name, have_value)) if have_name.as_str() == name => {
                    self.admit(keyspace::decode_device_value(have_value))?
                }
                _ => None,
            };

            if version::needs(&entry.record, have.as_ref()) && !visitor(&entry) {
                break;
            }
        }
        Ok(())
    }

    // ---- internals ---------------------------------------------------

    /// Apply the corruption policy to a decode result: `Skip` turns the
    /// error into a logged `None`, `Abort` surfaces it.
    fn admit<T>(&self, decoded: Result<T, CodecError>) -> Result<Option<T>, IndexError> {
        match decoded {
            Ok(value) => Ok(Some(value)),
            Err(err) => match self.corruption {
                CorruptionPolicy::Skip => {
                    warn!("{}: skipping corrupt entry: {err}", self.folder);
                    Ok(None)
                }
                CorruptionPolicy::Abort => Err(err.into()),
            },
        }
    }

    /// Everything `device` holds, in path order. An undecodable value
    /// under the `Skip` policy keeps its name (from the key) with no
    /// record, so the caller can still overwrite or drop it.
    fn existing_entries(
        &self,
        device: &DeviceId,
    ) -> Result<Vec<(String, Option<FileRecord>)>, IndexError> {
        let start = keyspace::device_prefix(self.folder_id, device);
        let end = keyspace::prefix_end(&start);
        let mut entries = Vec::new();
        for pair in self.store.range(&start, &end) {
            let (key, value) = pair?;
            let (_, _, name) = keyspace::split_device_key(&key)?;
            let record = self.admit(keyspace::decode_device_value(&value))?;
            entries.push((name.to_string(), record));
        }
        Ok(entries)
    }
}

/// Order the input by path and set aside the reserved version-0 names;
/// those neither write nor remove anything. For duplicates the last
/// occurrence in array order decides the path's disposition, so each
/// branch evicts the name from the opposite set.
fn normalize(records: &[FileRecord]) -> (BTreeMap<String, FileRecord>, BTreeSet<String>) {
    let mut input = BTreeMap::new();
    let mut reserved = BTreeSet::new();
    for record in records {
        if record.version == 0 {
            input.remove(&record.name);
            reserved.insert(record.name.clone());
            continue;
        }
        reserved.remove(&record.name);
        input.insert(record.name.clone(), record.clone());
    }
    (input, reserved)
}

fn next_have_pair(
    iter: &mut dyn Iterator<Item = Result<KvPair, StoreError>>,
) -> Result<Option<(String, Vec<u8>)>, IndexError> {
    match iter.next() {
        None => Ok(None),
        Some(pair) => {
            let (key, value) = pair?;
            let (_, _, name) = keyspace::split_device_key(&key)?;
            Ok(Some((name.to_string(), value)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockRef, FLAG_DIRECTORY, FLAG_INVALID};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    const LOCAL: DeviceId = DeviceId::LOCAL;

    fn device(tag: u8) -> DeviceId {
        DeviceId([tag; 32])
    }

    fn record(name: &str, version: u64) -> FileRecord {
        FileRecord {
            name: name.to_string(),
            version,
            flags: 0,
            size: 128,
            modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            blocks: vec![BlockRef {
                offset: 0,
                length: 128,
                hash: vec![0xab; 32],
            }],
            local_version: 0,
        }
    }

    fn flagged(name: &str, version: u64, flags: u32) -> FileRecord {
        let mut r = record(name, version);
        r.flags = flags;
        r
    }

    fn open(store: &Arc<MemoryStore>, folder: &str) -> FileSet {
        open_with_clock(store, folder, Arc::new(LogicalClock::new()))
    }

    fn open_with_clock(
        store: &Arc<MemoryStore>,
        folder: &str,
        clock: Arc<LogicalClock>,
    ) -> FileSet {
        let options = FileSetOptions {
            corruption: CorruptionPolicy::Abort,
            clock,
        };
        FileSet::open_with(store.clone(), folder, options).unwrap()
    }

    fn have_records(set: &FileSet, device: &DeviceId) -> Vec<FileRecord> {
        let mut records = Vec::new();
        set.with_have(device, |record| {
            records.push(record.clone());
            true
        })
        .unwrap();
        records
    }

    fn global_entries(set: &FileSet) -> Vec<GlobalEntry> {
        let mut entries = Vec::new();
        set.with_global(|entry| {
            entries.push(entry.clone());
            true
        })
        .unwrap();
        entries
    }

    fn need_records(set: &FileSet, device: &DeviceId) -> Vec<FileRecord> {
        let mut records = Vec::new();
        set.with_need(device, |entry| {
            records.push(entry.record.clone());
            true
        })
        .unwrap();
        records
    }

    fn summarize(records: &[FileRecord]) -> Vec<(String, u64)> {
        records
            .iter()
            .map(|r| (r.name.clone(), r.version))
            .collect()
    }

    #[test]
    fn global_merges_across_devices() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "merge");
        let r0 = device(0x10);

        set.replace_with_delete(
            &LOCAL,
            &[
                record("a", 1000),
                record("b", 1000),
                record("c", 1000),
                record("d", 1000),
                record("z", 1000),
            ],
        )
        .unwrap();
        set.replace_with_delete(
            &LOCAL,
            &[
                record("a", 1000),
                record("b", 1000),
                record("c", 1000),
                record("d", 1000),
            ],
        )
        .unwrap();
        set.replace(
            &r0,
            &[record("a", 1000), record("b", 1000), record("c", 1002)],
        )
        .unwrap();
        set.update(&r0, &[record("b", 1001), record("e", 1000)])
            .unwrap();

        let global = global_entries(&set);
        assert_eq!(
            summarize(&global.iter().map(|e| e.record.clone()).collect::<Vec<_>>()),
            vec![
                ("a".to_string(), 1000),
                ("b".to_string(), 1001),
                ("c".to_string(), 1002),
                ("d".to_string(), 1000),
                ("e".to_string(), 1000),
                ("z".to_string(), 1001),
            ]
        );

        // a is held identically by both devices; the rest have one source.
        assert_eq!(global[0].availability.len(), 2);
        assert_eq!(global[1].availability, vec![r0]);
        assert_eq!(global[2].availability, vec![r0]);
        assert_eq!(global[3].availability, vec![LOCAL]);
        assert_eq!(global[4].availability, vec![r0]);
        assert!(global[5].record.is_deleted());
        assert_eq!(global[5].availability, vec![LOCAL]);

        assert_eq!(
            summarize(&need_records(&set, &LOCAL)),
            vec![
                ("b".to_string(), 1001),
                ("c".to_string(), 1002),
                ("e".to_string(), 1000),
            ]
        );
        assert_eq!(
            summarize(&need_records(&set, &r0)),
            vec![("d".to_string(), 1000)]
        );
    }

    #[test]
    fn invalid_copies_shape_availability() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "avail");
        let r0 = device(0x20);
        let r1 = device(0x21);

        set.replace(
            &r0,
            &[
                record("both", 1001),
                flagged("r1only", 1002, FLAG_INVALID),
                record("r0only", 1003),
                flagged("none", 1004, FLAG_INVALID),
            ],
        )
        .unwrap();
        set.replace(
            &r1,
            &[
                record("both", 1001),
                record("r1only", 1002),
                flagged("r0only", 1003, FLAG_INVALID),
                flagged("none", 1004, FLAG_INVALID),
            ],
        )
        .unwrap();

        assert_eq!(set.availability("both").unwrap().len(), 2);
        assert_eq!(set.availability("r0only").unwrap(), vec![r0]);
        assert_eq!(set.availability("r1only").unwrap(), vec![r1]);
        assert!(set.availability("none").unwrap().is_empty());
        assert!(set.availability("absent").unwrap().is_empty());

        // Availability is exactly the devices whose copy matches the
        // winner and is servable.
        for name in ["both", "r0only", "r1only", "none"] {
            let winner = set.get_global(name).unwrap().unwrap();
            let mut expected = Vec::new();
            for d in [r0, r1] {
                if let Some(have) = set.get(&d, name).unwrap() {
                    if !have.is_invalid() && have.is_equivalent(&winner) {
                        expected.push(d);
                    }
                }
            }
            assert_eq!(set.availability(name).unwrap(), expected, "{name}");
        }
    }

    #[test]
    fn successive_removals_generate_ordered_tombstones() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "tombs");

        let full = vec![
            record("a", 1000),
            record("b", 1000),
            record("c", 1000),
            record("d", 1000),
            flagged("z", 1000, FLAG_DIRECTORY),
        ];
        set.replace_with_delete(&LOCAL, &full).unwrap();

        let without = |names: &[&str]| -> Vec<FileRecord> {
            full.iter()
                .filter(|r| !names.contains(&r.name.as_str()))
                .cloned()
                .collect()
        };
        set.replace_with_delete(&LOCAL, &without(&["b"])).unwrap();
        set.replace_with_delete(&LOCAL, &without(&["b", "d"])).unwrap();
        set.replace_with_delete(&LOCAL, &without(&["b", "d", "z"]))
            .unwrap();
        set.replace_with_delete(&LOCAL, &without(&["b", "d", "z", "c"]))
            .unwrap();

        let global = global_entries(&set);
        let summary: Vec<(String, u64, bool)> = global
            .iter()
            .map(|e| (e.record.name.clone(), e.record.version, e.record.is_deleted()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a".to_string(), 1000, false),
                ("b".to_string(), 1001, true),
                ("c".to_string(), 1004, true),
                ("d".to_string(), 1002, true),
                ("z".to_string(), 1003, true),
            ]
        );
        // The directory bit survives into the tombstone.
        assert!(global[4].record.is_directory());
    }

    #[test]
    fn local_version_advances_only_on_change() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "counter");
        let l1 = vec![record("a", 1000), record("b", 1000)];

        set.replace_with_delete(&LOCAL, &l1).unwrap();
        let after_first = set.local_version(&LOCAL);
        assert!(after_first > 0);

        set.replace_with_delete(&LOCAL, &l1).unwrap();
        assert_eq!(set.local_version(&LOCAL), after_first);

        let mut l2 = l1.clone();
        l2.push(record("c", 1000));
        set.replace_with_delete(&LOCAL, &l2).unwrap();
        assert!(set.local_version(&LOCAL) > after_first);
    }

    #[test]
    fn replace_with_nothing_clears_the_device() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "clear");
        let r0 = device(0x30);

        set.replace(&r0, &[record("a", 1), record("b", 2)]).unwrap();
        let populated = set.local_version(&r0);
        set.replace(&r0, &[]).unwrap();

        assert!(have_records(&set, &r0).is_empty());
        assert!(global_entries(&set).is_empty());
        assert!(set.get_global("a").unwrap().is_none());
        // Removals still advance the counter.
        assert!(set.local_version(&r0) > populated);
    }

    #[test]
    fn need_prefers_servable_copies_per_file() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "needinv");
        let r0 = device(0x40);
        let r1 = device(0x41);

        set.replace(
            &r0,
            &[
                record("a", 1002),
                flagged("b", 1002, FLAG_INVALID),
                record("c", 1002),
            ],
        )
        .unwrap();
        set.replace(
            &r1,
            &[
                record("a", 1002),
                record("b", 1002),
                flagged("c", 1002, FLAG_INVALID),
            ],
        )
        .unwrap();

        let needed = need_records(&set, &LOCAL);
        assert_eq!(
            summarize(&needed),
            vec![
                ("a".to_string(), 1002),
                ("b".to_string(), 1002),
                ("c".to_string(), 1002),
            ]
        );
        assert!(needed.iter().all(|r| !r.is_invalid()));
        assert_eq!(set.availability("b").unwrap(), vec![r1]);
        assert_eq!(set.availability("c").unwrap(), vec![r0]);

        // The devices holding the invalid copies need the servable winner;
        // their valid entries are not needed.
        assert_eq!(summarize(&need_records(&set, &r0)), vec![("b".to_string(), 1002)]);
        assert_eq!(summarize(&need_records(&set, &r1)), vec![("c".to_string(), 1002)]);
    }

    #[test]
    fn tombstones_are_not_needed_by_devices_without_the_file() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "stones");
        let r0 = device(0x50);

        set.replace_with_delete(&LOCAL, &[record("gone", 1000)])
            .unwrap();
        set.replace_with_delete(&LOCAL, &[]).unwrap();
        assert!(set.get_global("gone").unwrap().unwrap().is_deleted());

        // r0 never had the file, so it does not need the tombstone.
        assert!(need_records(&set, &r0).is_empty());

        // A device still holding the file needs it.
        set.replace(&r0, &[record("gone", 900)]).unwrap();
        assert_eq!(need_records(&set, &r0).len(), 1);
    }

    #[test]
    fn update_with_equivalent_record_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "touch");
        set.update(&LOCAL, &[record("a", 5)]).unwrap();
        let counter = set.local_version(&LOCAL);

        set.update(&LOCAL, &[record("a", 5)]).unwrap();
        assert_eq!(set.local_version(&LOCAL), counter);

        set.update(&LOCAL, &[record("a", 6)]).unwrap();
        assert!(set.local_version(&LOCAL) > counter);
        assert_eq!(set.get(&LOCAL, "a").unwrap().unwrap().version, 6);
    }

    #[test]
    fn later_duplicate_in_input_wins() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "dups");
        set.replace(&LOCAL, &[record("a", 1), record("a", 2)]).unwrap();
        assert_eq!(set.get(&LOCAL, "a").unwrap().unwrap().version, 2);
        // One path, one write.
        assert_eq!(set.local_version(&LOCAL), 1);
    }

    #[test]
    fn version_zero_records_are_reserved() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "zero");
        set.replace_with_delete(&LOCAL, &[record("a", 1000)]).unwrap();
        let counter = set.local_version(&LOCAL);

        // A reserved record neither upserts nor counts as absence.
        set.replace_with_delete(&LOCAL, &[record("a", 0)]).unwrap();
        let kept = set.get(&LOCAL, "a").unwrap().unwrap();
        assert_eq!(kept.version, 1000);
        assert!(!kept.is_deleted());
        assert_eq!(set.local_version(&LOCAL), counter);

        set.update(&LOCAL, &[record("b", 0)]).unwrap();
        assert!(set.get(&LOCAL, "b").unwrap().is_none());
    }

    #[test]
    fn later_version_zero_duplicate_reserves_the_path() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "dupzero");

        // A fresh path whose last copy is reserved is never written.
        set.replace(&LOCAL, &[record("x", 5), record("x", 0)]).unwrap();
        assert!(set.get(&LOCAL, "x").unwrap().is_none());
        assert_eq!(set.local_version(&LOCAL), 0);

        // An existing entry is left untouched, not overwritten.
        set.replace(&LOCAL, &[record("a", 1000)]).unwrap();
        let counter = set.local_version(&LOCAL);
        set.replace(&LOCAL, &[record("a", 2000), record("a", 0)])
            .unwrap();
        assert_eq!(set.get(&LOCAL, "a").unwrap().unwrap().version, 1000);
        assert_eq!(set.local_version(&LOCAL), counter);

        // The reverse order resolves the other way: the nonzero copy wins.
        set.replace(&LOCAL, &[record("a", 0), record("a", 2000)])
            .unwrap();
        assert_eq!(set.get(&LOCAL, "a").unwrap().unwrap().version, 2000);
    }

    #[test]
    fn unchanged_records_keep_their_local_version() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "stablelv");
        set.replace(&LOCAL, &[record("a", 1), record("b", 1)]).unwrap();
        let before: Vec<u64> = have_records(&set, &LOCAL)
            .iter()
            .map(|r| r.local_version)
            .collect();

        set.replace(&LOCAL, &[record("a", 1), record("b", 2)]).unwrap();
        let after = have_records(&set, &LOCAL);
        assert_eq!(after[0].local_version, before[0]);
        assert!(after[1].local_version > before[1]);
    }

    #[test]
    fn long_paths_round_trip_through_the_index() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "longpath");
        let name = "p/".repeat(4096);
        assert!(name.len() >= 8192);

        set.replace(&LOCAL, &[record(&name, 42)]).unwrap();
        assert_eq!(set.get(&LOCAL, &name).unwrap().unwrap().version, 42);
        assert_eq!(set.get_global(&name).unwrap().unwrap().name, name);
        let needed = need_records(&set, &device(0x60));
        assert_eq!(needed.len(), 1);
        assert_eq!(needed[0].name, name);
    }

    #[test]
    fn have_iteration_is_ordered_and_cancellable() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "iter");
        set.replace(
            &LOCAL,
            &[record("c", 1), record("a", 1), record("b", 1)],
        )
        .unwrap();

        let names: Vec<String> = have_records(&set, &LOCAL)
            .iter()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let mut seen = 0;
        set.with_have(&LOCAL, |_| {
            seen += 1;
            false
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn reopen_reseeds_counters_and_clock() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(LogicalClock::new());
        {
            let set = open_with_clock(&store, "reopen", clock.clone());
            set.replace_with_delete(
                &LOCAL,
                &[record("a", 1000), record("b", 1000), record("c", 1000)],
            )
            .unwrap();
            assert_eq!(set.local_version(&LOCAL), 3);
        }

        // A fresh process: new clock, counters rebuilt from the store.
        let set = open_with_clock(&store, "reopen", Arc::new(LogicalClock::new()));
        assert_eq!(set.local_version(&LOCAL), 3);
        assert_eq!(set.devices(), vec![LOCAL]);

        set.replace_with_delete(&LOCAL, &[record("a", 1000), record("b", 1000)])
            .unwrap();
        let stone = set.get(&LOCAL, "c").unwrap().unwrap();
        assert!(stone.is_deleted());
        assert!(stone.version > 1000);
        assert_eq!(set.local_version(&LOCAL), 4);
    }

    #[test]
    fn corrupt_entries_follow_the_policy() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "corrupt");
        set.replace(&LOCAL, &[record("ok", 1)]).unwrap();

        let mut batch = Batch::new();
        batch.put(
            keyspace::device_key(set.folder_id, &LOCAL, "bad"),
            vec![0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0, 1],
        );
        store.apply(batch).unwrap();

        assert!(set.with_have(&LOCAL, |_| true).is_err());

        let lenient = FileSet::open_with(
            store.clone(),
            "corrupt",
            FileSetOptions {
                corruption: CorruptionPolicy::Skip,
                clock: Arc::new(LogicalClock::new()),
            },
        )
        .unwrap();
        let names: Vec<String> = have_records(&lenient, &LOCAL)
            .iter()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(names, vec!["ok"]);
    }

    #[test]
    fn need_matches_global_minus_matching_haves() {
        let store = Arc::new(MemoryStore::new());
        let set = open(&store, "needcover");
        let r0 = device(0x70);
        let r1 = device(0x71);
        set.replace_with_delete(
            &LOCAL,
            &[record("a", 10), record("b", 20), record("c", 30)],
        )
        .unwrap();
        set.replace(&r0, &[record("a", 11), record("d", 5)]).unwrap();
        set.replace(&r1, &[flagged("e", 9, FLAG_INVALID)]).unwrap();

        for d in [LOCAL, r0, r1] {
            let needed: BTreeSet<String> = need_records(&set, &d)
                .iter()
                .map(|r| r.name.clone())
                .collect();
            let mut matching = BTreeSet::new();
            let mut servable = BTreeSet::new();
            for entry in global_entries(&set) {
                let name = entry.record.name.clone();
                if entry.record.is_invalid() {
                    continue;
                }
                servable.insert(name.clone());
                match set.get(&d, &name).unwrap() {
                    Some(have)
                        if !have.is_invalid() && have.version >= entry.record.version =>
                    {
                        matching.insert(name);
                    }
                    Some(_) => {}
                    None if entry.record.is_deleted() => {
                        matching.insert(name);
                    }
                    None => {}
                }
            }
            let union: BTreeSet<String> = needed.union(&matching).cloned().collect();
            assert_eq!(union, servable, "device {d}");
            assert!(needed.is_disjoint(&matching), "device {d}");
        }
    }
}
