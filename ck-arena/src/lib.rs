//! Fixed-size slot-pool arena primitives lifted from NDB's cooperative
//! block engine: an `i`-handle slot pool, intrusive FIFO
//! lists, a chained hash table, and a segmented data buffer. Everything
//! in this crate is single-threaded; callers that share an arena across
//! threads (the snapshot and task-manager layers in `ck-datastore`) must
//! provide their own external locking.

pub mod hash_table;
pub mod list;
pub mod seg_buffer;
pub mod slot_pool;

pub use hash_table::{HashChainLinks, HashKey, HashTable};
pub use list::{FifoList, ListHead, ListLinks, LocalFifoList};
pub use seg_buffer::{BufferHead, BufferIter, SegBuffer, Segment};
pub use slot_pool::{Poolable, SlotPool, RNIL};
