//! Undo tablespace truncator: the space-id
//! bank and the crash-safe truncate log that back `mark_undo_for_truncate`
//! / `check_if_marked_undo_is_empty` / `truncate_marked_undo`.

pub mod space_id_bank;
pub mod truncate;
pub mod truncate_log;

pub use space_id_bank::{SpaceIdBank, SCAN_INTERVAL};
pub use truncate::{
    check_if_marked_undo_is_empty, recover_interrupted_truncate, truncate_marked_undo,
    LockOrderProof, RsegInspector,
};
pub use truncate_log::{
    inspect_truncate_log, is_active_truncate_log_present, TruncateLog, TRUNCATE_LOG_SIZE,
};
