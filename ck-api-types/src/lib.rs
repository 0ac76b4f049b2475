//! Domain types shared by every crate in the clone kernel workspace.
//!
//! This crate holds no behavior, only the wire/domain vocabulary (locators,
//! task and file metadata, the error taxonomy, GTID and undo-tablespace
//! records) that the rest of the workspace builds on.

pub mod error;
pub mod file_meta;
pub mod gtid;
pub mod locator;
pub mod task_meta;
pub mod undo;

pub use error::CloneError;
pub use file_meta::{CompressType, EncryptionMetadata, FileMetadata, NameExtension};
pub use gtid::{GtidDescriptor, GtidInterval, GtidVersion};
pub use locator::{CloneType, HandleState, HandleType, Locator, SnapshotState};
pub use task_meta::TaskMetadata;
pub use undo::{
    UndoSpaceState, CONCURRENT_UNDO_TRUNCATE_LIMIT, FSP_MAX_UNDO_TABLESPACES,
    UNDO_SPACE_ID_RANGE, UNDO_TRUNCATE_LOG_MAGIC,
};
