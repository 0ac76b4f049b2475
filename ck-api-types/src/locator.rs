use std::fmt;

/// One of the five states a snapshot moves through, strictly left to right
/// except for the two early exits out of `FileCopy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SnapshotState {
    Init = 0,
    FileCopy = 1,
    PageCopy = 2,
    RedoCopy = 3,
    Done = 4,
}

impl SnapshotState {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => SnapshotState::Init,
            1 => SnapshotState::FileCopy,
            2 => SnapshotState::PageCopy,
            3 => SnapshotState::RedoCopy,
            4 => SnapshotState::Done,
            _ => return None,
        })
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotState::Init => "INIT",
            SnapshotState::FileCopy => "FILE_COPY",
            SnapshotState::PageCopy => "PAGE_COPY",
            SnapshotState::RedoCopy => "REDO_COPY",
            SnapshotState::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// The clone type negotiated at `begin()`, fixing which states the snapshot
/// will pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneType {
    /// FILE_COPY -> DONE, no page or redo tracking.
    Blocking,
    /// FILE_COPY -> PAGE_COPY -> REDO_COPY -> DONE.
    Page,
    /// Same state path as `Page`, but the decision of "page vs file block"
    /// is made per-file rather than globally.
    Hybrid,
    /// FILE_COPY -> REDO_COPY -> DONE.
    Redo,
}

/// Opaque wire token identifying a clone session across network restarts.
///
/// `clone_id == 0` is reserved for "invalid" (no ongoing clone for this
/// handle yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    pub clone_id: u64,
    pub snapshot_id: u64,
    pub clone_index: u32,
    pub state: SnapshotState,
    pub metadata_transferred: bool,
}

impl Locator {
    pub const INVALID_CLONE_ID: u64 = 0;

    pub fn invalid() -> Self {
        Locator {
            clone_id: Self::INVALID_CLONE_ID,
            snapshot_id: 0,
            clone_index: 0,
            state: SnapshotState::Init,
            metadata_transferred: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.clone_id != Self::INVALID_CLONE_ID
    }
}

/// Which side of the copy a [`Handle`](crate::HandleType) drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    Copy,
    Apply,
}

/// Lifecycle of a [`Handle`](crate::HandleType): `Init` at construction,
/// `Active` once a locator has been exchanged, `Idle` while waiting for a
/// network restart, `Abort` once a fatal error has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Init,
    Active,
    Idle,
    Abort,
}
