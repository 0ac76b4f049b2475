/// State machine implicit on an undo tablespace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoSpaceState {
    Active,
    InactiveImplicit,
    InactiveExplicit,
    Empty,
}

impl UndoSpaceState {
    pub fn is_inactive(&self) -> bool {
        matches!(
            self,
            UndoSpaceState::InactiveImplicit | UndoSpaceState::InactiveExplicit
        )
    }
}

/// Maximum number of undo tablespaces the space-id bank can track (spec
/// §6). Also bounds `undo::spaces->size()` used by the per-batch scan.
pub const FSP_MAX_UNDO_TABLESPACES: u32 = 127;

/// Number of reassignable ids reserved per undo number at the top of the
/// 32-bit space-id range.
pub const UNDO_SPACE_ID_RANGE: u32 = 512;

/// Cap on how many just-truncated (deleted) spaces may still have resident
/// buffer-pool pages before the scan starts skipping candidates.
pub const CONCURRENT_UNDO_TRUNCATE_LIMIT: usize = 4;

/// Magic sentinel written to the truncate log on successful completion.
pub const UNDO_TRUNCATE_LOG_MAGIC: u32 = 0xabcde123;
