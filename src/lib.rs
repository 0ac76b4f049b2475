//! Clone kernel: a physical clone snapshot engine (InnoDB-style
//! FILE_COPY/PAGE_COPY/REDO_COPY/DONE state machine) driven by a small,
//! NDB-style cooperative block-scheduling runtime.
//!
//! This crate wires together the workspace's lower layers into the public
//! façade a host application drives:
//!
//! - [`ck_arena`] -- intrusive pool/list/hash arena primitives.
//! - [`ck_tools`] -- the `WorkerTaskContext` logging/abort seam and the
//!   shared cooperative-wait primitive.
//! - [`ck_api_types`] -- wire/domain vocabulary shared by every layer.
//! - [`ck_datastore`] -- the snapshot state machine, descriptor codec, task
//!   manager, and per-file DDL coordination (components C1-C5).
//! - [`ck_gtid`] -- the destination-side GTID persister.
//! - [`ck_undo`] -- the undo tablespace truncator.
//! - [`ck_config`] -- typed configuration.
//!
//! [`handle`] and [`clone_system`] (components C6-C7) are this crate's own:
//! the per-direction handle façade and the process-wide clone registry.

pub mod clone_system;
pub mod handle;

pub use clone_system::CloneSystem;
pub use handle::{Handle, TransferCallback};

pub use ck_arena::{
    FifoList, HashKey, HashTable, ListHead, LocalFifoList, Poolable, SegBuffer, SlotPool, RNIL,
};
pub use ck_api_types::{
    CloneError, CloneType, CompressType, EncryptionMetadata, FileMetadata, GtidDescriptor,
    GtidInterval, GtidVersion, HandleState, HandleType, Locator, NameExtension, SnapshotState,
    TaskMetadata, UndoSpaceState,
};
pub use ck_config::CloneConfig;
pub use ck_datastore::{
    ChunkBitmap, ChunkInfo, DdlGuard, FileContext, FileContextState, Snapshot, TaskManager,
};
pub use ck_gtid::GtidPersister;
pub use ck_undo::{SpaceIdBank, TruncateLog};
