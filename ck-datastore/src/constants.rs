//! Tunables referenced by more than one module. Kept together so the
//! sizing relationships between them (e.g. a task's serial buffer being
//! sized off `CLONE_DESC_MAX_BASE_LEN`) are easy to audit in one place.

use std::time::Duration;

/// Upper bound on concurrent clone tasks sharing one snapshot;
/// also the bound the chunk-info codec rejects an oversized
/// `incomplete_count` against.
pub const CLONE_MAX_TASKS: usize = 16;

/// Fixed-width portion of the largest non-FILE_METADATA descriptor; a
/// task's serial buffer is sized to twice this plus the longest file name
/// in the current state.
pub const CLONE_DESC_MAX_BASE_LEN: usize = 64;

/// Default chunk-size exponent: `2^12` pages per chunk.
pub const DEFAULT_CHUNK_SIZE_POW2: u8 = 12;

/// Default block-size exponent: `2^6` pages per block.
pub const DEFAULT_BLOCK_SIZE_POW2: u8 = 6;

/// `update_block_size` may never push the block-size exponent above this.
pub const MAX_BLOCK_SIZE_POW2: u8 = 12;

/// Spin interval while a task waits for the last task in its cohort to
/// flip the snapshot state.
pub const SNAPSHOT_STATE_CHANGE_SLEEP: Duration = Duration::from_millis(100);

/// A task gives up waiting for a state change after this long.
pub const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// `mark_abort(force = true)` waits this long for active clones to notice
/// before giving up on them.
pub const ABORT_FORCE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Heartbeat cadence while `mark_abort(force = true)` is waiting.
pub const ABORT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Exactly one copy handle and one apply handle may attach to a snapshot
/// at a time.
pub const MAX_CLONES_PER_SNAPSHOT: usize = 1;

/// NDB-style fixed small arrays sized to coexist with one zombie handle
/// from a previous failed attempt.
pub const MAX_CLONES: usize = 1;
pub const CLONE_ARR_SIZE: usize = 2 * MAX_CLONES;
pub const MAX_SNAPSHOTS: usize = 1;
pub const SNAPSHOT_ARR_SIZE: usize = 2 * MAX_SNAPSHOTS;
