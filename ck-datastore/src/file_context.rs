//! Per-file lifecycle tracking shared between the copy thread and any
//! concurrent DDL on the same tablespace.
//!
//! A `FileContext` is pinned by whichever task is actively transferring
//! its pages, and watched by DDL so a rename or drop can wait for the
//! current block to finish rather than racing it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use ck_api_types::NameExtension;

/// Lifecycle of one data file across a snapshot's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileContextState {
    Created = 0,
    Renaming = 1,
    Renamed = 2,
    Dropping = 3,
    Dropped = 4,
    DroppedHandled = 5,
}

/// Per-file concurrency state. All mutable fields are atomics so a DDL
/// thread can observe and wait on them without taking the snapshot's own
/// lock.
pub struct FileContext {
    state: AtomicU32,
    next_state: AtomicU32,
    pinned: AtomicU32,
    waiting: AtomicBool,
    modified_by_ddl: AtomicBool,
    name_extension: AtomicU32,
}

fn state_to_u32(s: FileContextState) -> u32 {
    s as u32
}

fn state_from_u32(v: u32) -> FileContextState {
    match v {
        0 => FileContextState::Created,
        1 => FileContextState::Renaming,
        2 => FileContextState::Renamed,
        3 => FileContextState::Dropping,
        4 => FileContextState::Dropped,
        5 => FileContextState::DroppedHandled,
        _ => unreachable!("FileContext state corrupted"),
    }
}

fn ext_to_u32(e: NameExtension) -> u32 {
    match e {
        NameExtension::None => 0,
        NameExtension::Replace => 1,
        NameExtension::Ddl => 2,
    }
}

fn ext_from_u32(v: u32) -> NameExtension {
    match v {
        0 => NameExtension::None,
        1 => NameExtension::Replace,
        2 => NameExtension::Ddl,
        _ => unreachable!("FileContext name extension corrupted"),
    }
}

impl FileContext {
    pub fn new() -> Self {
        FileContext {
            state: AtomicU32::new(state_to_u32(FileContextState::Created)),
            next_state: AtomicU32::new(state_to_u32(FileContextState::Created)),
            pinned: AtomicU32::new(0),
            waiting: AtomicBool::new(false),
            modified_by_ddl: AtomicBool::new(false),
            name_extension: AtomicU32::new(ext_to_u32(NameExtension::None)),
        }
    }

    pub fn state(&self) -> FileContextState {
        state_from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn name_extension(&self) -> NameExtension {
        ext_from_u32(self.name_extension.load(Ordering::Acquire))
    }

    pub fn set_name_extension(&self, ext: NameExtension) {
        self.name_extension.store(ext_to_u32(ext), Ordering::Release);
    }

    /// Pins the file for active transfer; DDL on this file must wait until
    /// the last pin is released.
    pub fn pin(&self) {
        self.pinned.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let prev = self.pinned.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin without matching pin");
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire) > 0
    }

    /// Called by DDL before it begins waiting for pins to drain; lets the
    /// copy thread notice and yield at its next block boundary.
    pub fn begin_wait(&self) {
        self.waiting.store(true, Ordering::Release);
    }

    pub fn end_wait(&self) {
        self.waiting.store(false, Ordering::Release);
    }

    pub fn has_waiter(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    /// Marks that a DDL statement has modified this file's metadata since
    /// it was last transferred, forcing a refreshed FILE_METADATA
    /// descriptor before further DATA descriptors for it are sent.
    pub fn mark_modified_by_ddl(&self) {
        self.modified_by_ddl.store(true, Ordering::Release);
    }

    pub fn take_modified_by_ddl(&self) -> bool {
        self.modified_by_ddl.swap(false, Ordering::AcqRel)
    }

    /// Requests a transition to `next`, to be picked up by the copy thread
    /// at its next safe point via [`FileContext::apply_pending_state`].
    pub fn request_state(&self, next: FileContextState) {
        self.next_state.store(state_to_u32(next), Ordering::Release);
    }

    /// Applies a previously requested state transition, returning the new
    /// state. A no-op if no transition is pending.
    pub fn apply_pending_state(&self) -> FileContextState {
        let next = self.next_state.load(Ordering::Acquire);
        self.state.store(next, Ordering::Release);
        state_from_u32(next)
    }

    pub fn renaming(&self) {
        self.request_state(FileContextState::Renaming);
    }

    pub fn dropping(&self) {
        self.request_state(FileContextState::Dropping);
    }

    pub fn is_deleted(&self) -> bool {
        matches!(
            self.state(),
            FileContextState::Dropped | FileContextState::DroppedHandled
        )
    }
}

impl Default for FileContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_starts_created_and_unpinned() {
        let ctx = FileContext::new();
        assert_eq!(ctx.state(), FileContextState::Created);
        assert!(!ctx.is_pinned());
        assert!(!ctx.is_deleted());
    }

    #[test]
    fn pin_unpin_round_trip() {
        let ctx = FileContext::new();
        ctx.pin();
        assert!(ctx.is_pinned());
        ctx.unpin();
        assert!(!ctx.is_pinned());
    }

    #[test]
    fn requested_state_takes_effect_on_apply() {
        let ctx = FileContext::new();
        ctx.dropping();
        assert_eq!(ctx.state(), FileContextState::Created);
        assert_eq!(ctx.apply_pending_state(), FileContextState::Dropping);
        assert_eq!(ctx.state(), FileContextState::Dropping);
    }

    #[test]
    fn modified_by_ddl_flag_clears_on_take() {
        let ctx = FileContext::new();
        ctx.mark_modified_by_ddl();
        assert!(ctx.take_modified_by_ddl());
        assert!(!ctx.take_modified_by_ddl());
    }

    #[test]
    fn name_extension_round_trips() {
        let ctx = FileContext::new();
        assert_eq!(ctx.name_extension(), NameExtension::None);
        ctx.set_name_extension(NameExtension::Ddl);
        assert_eq!(ctx.name_extension(), NameExtension::Ddl);
    }
}
