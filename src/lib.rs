//! Persistent multi-device file index for peer-to-peer folder sync.
//!
//! For every synchronized folder the index stores the set of files each
//! known device advertises (its *have* set) and derives, per path, the
//! winning version across all devices (the *global* set) together with the
//! devices able to serve it. Relative to any device, the global entries it
//! is missing or holds an older copy of form its *need* set.
//!
//! State lives in an ordered byte-keyed store behind the [`store::Store`]
//! trait (`sled` on disk, or the in-memory backend for tests and tooling);
//! [`keyspace`] documents the layout. Writes to a folder serialize on a
//! process-wide per-folder lock and commit as atomic batches, so readers
//! always observe a consistent index.

pub mod clock;
pub mod fileset;
pub mod global;
pub mod keyspace;
pub mod model;
pub mod registry;
pub mod store;
pub mod version;

pub use clock::LogicalClock;
pub use fileset::{CorruptionPolicy, FileSet, FileSetOptions, IndexError};
pub use model::{
    BlockRef, DeviceId, FileRecord, FolderId, GlobalEntry, FLAG_DELETED, FLAG_DIRECTORY,
    FLAG_INVALID,
};
pub use registry::{drop_folder, list_folders};
pub use store::{Batch, MemoryStore, SledStore, Store, StoreError};
