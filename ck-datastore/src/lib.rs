//! Clone snapshot engine: the chunk bitmap and chunk-info
//! codec (C1), the descriptor wire format (C2), per-file DDL coordination
//! (C3), the snapshot state machine (C4), and the task manager that
//! drives it (C5).

pub mod chunk_bitmap;
pub mod chunk_info;
pub mod constants;
pub mod crypto;
pub mod descriptor;
pub mod file_context;
pub mod snapshot;
pub mod task_manager;

pub use chunk_bitmap::ChunkBitmap;
pub use chunk_info::ChunkInfo;
pub use crypto::{
    key_fingerprint, reencrypt_for_destination, unwrap_tablespace_key, wrap_tablespace_key,
};
pub use descriptor::{
    decode_data, decode_file_metadata, decode_locator, decode_state, decode_task_metadata,
    encode_data, encode_file_metadata, encode_locator, encode_state, encode_task_metadata,
    negotiate_version, DataDescriptorBody, DescriptorHeader, DescriptorType, StateDescriptorBody,
    HEADER_LEN, LOCAL_MAX_VERSION, MAX_FILE_NAME_LEN,
};
pub use file_context::{FileContext, FileContextState};
pub use snapshot::{DdlGuard, FileEntry, Snapshot};
pub use task_manager::TaskManager;
