//! The snapshot state machine: the five
//! states a clone passes through, the chunk/block geometry each state is
//! sliced into, and the five-step protocol tasks use to agree on when to
//! advance from one state to the next.
//!
//! Invariants maintained throughout:
//!
//! - `state` only ever moves forward, except the two early exits out
//!   of `FileCopy` (straight to `Done` for a blocking clone, or to
//!   `RedoCopy` for a pure-redo clone).
//! - A chunk is reserved to at most one task at a time.
//! - The last task to finish a state drives the transition; every
//!   other task waits for it rather than racing to flip the state twice.
//! - DDL on a file is fenced from clone's read of that file's
//!   metadata by `begin_ddl_state`/`end_ddl_state`.
//! - Once a state transition begins, no task may reserve a new chunk
//!   of the state being left.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use anyhow::{bail, Error, Result};
use ck_api_types::{CloneError, CloneType, FileMetadata, SnapshotState, TaskMetadata};
use ck_tools::task::WorkerTaskContext;
use ck_tools::wait::{wait_default, WaitOutcome};

use crate::chunk_info::ChunkInfo;
use crate::constants::{DEFAULT_BLOCK_SIZE_POW2, DEFAULT_CHUNK_SIZE_POW2, MAX_BLOCK_SIZE_POW2};
use crate::file_context::{FileContext, FileContextState};

/// One tracked data file plus its clone-visible concurrency state.
pub struct FileEntry {
    pub metadata: FileMetadata,
    pub context: FileContext,
}

struct Inner {
    state: SnapshotState,
    chunk_info: ChunkInfo,
    files: Vec<FileEntry>,
    /// Number of tasks that have called [`Snapshot::task_done_with_state`]
    /// for the current state.
    tasks_done: u32,
    /// Number of tasks participating in the current state; set when the
    /// state is entered.
    tasks_total: u32,
    /// Bumped every time `state` changes; lets waiters distinguish "still
    /// the same state" from "already moved on" without racing the enum
    /// value itself.
    generation: u64,
    ddl_in_progress: bool,
    /// Archived redo files backing REDO_COPY: streamed as
    /// `redo_header`, then each file sliced into `chunk_size` pieces, then
    /// `redo_trailer` -- `num_redo_chunks` is the body chunk count plus two.
    redo_files: Vec<String>,
    redo_file_size: u64,
    redo_start_offset: u64,
    num_redo_chunks: u32,
    redo_header: Vec<u8>,
    redo_trailer: Vec<u8>,
    /// Pages already queued for transfer this state, keyed by
    /// `(space_id, page_no)`, so a page revisited by two tasks (or by both
    /// the dirty-page list and an overlapping chunk) is counted but not
    /// re-sent (`page set/vector, num_pages, num_duplicate_pages`).
    page_set: BTreeSet<(u32, u64)>,
    num_pages: u64,
    num_duplicate_pages: u64,
}

pub struct Snapshot {
    pub snapshot_id: u64,
    pub clone_type: CloneType,
    chunk_size_pow2: AtomicU32,
    block_size_pow2: AtomicU32,
    inner: Mutex<Inner>,
    condvar: Condvar,
    error: Mutex<Option<CloneError>>,
    /// Epoch seconds of the last state transition, for the progress report
    /// surfaced to whatever's driving the clone.
    last_transition_at: AtomicI64,
}

/// RAII guard returned by [`Snapshot::begin_ddl_state`]; releases the DDL
/// fence on drop so a panicking DDL statement can't wedge the snapshot.
pub struct DdlGuard<'a> {
    snapshot: &'a Snapshot,
}

impl<'a> Drop for DdlGuard<'a> {
    fn drop(&mut self) {
        self.snapshot.end_ddl_state();
    }
}

impl Snapshot {
    pub fn new(snapshot_id: u64, clone_type: CloneType, total_chunks: u32, tasks_total: u32) -> Self {
        Snapshot {
            snapshot_id,
            clone_type,
            chunk_size_pow2: AtomicU32::new(DEFAULT_CHUNK_SIZE_POW2 as u32),
            block_size_pow2: AtomicU32::new(DEFAULT_BLOCK_SIZE_POW2 as u32),
            inner: Mutex::new(Inner {
                state: SnapshotState::Init,
                chunk_info: ChunkInfo::new(total_chunks),
                files: Vec::new(),
                tasks_done: 0,
                tasks_total,
                generation: 0,
                ddl_in_progress: false,
                redo_files: Vec::new(),
                redo_file_size: 0,
                redo_start_offset: 0,
                num_redo_chunks: 0,
                redo_header: Vec::new(),
                redo_trailer: Vec::new(),
                page_set: BTreeSet::new(),
                num_pages: 0,
                num_duplicate_pages: 0,
            }),
            condvar: Condvar::new(),
            error: Mutex::new(None),
            last_transition_at: AtomicI64::new(proxmox_time::epoch_i64()),
        }
    }

    /// Epoch seconds of the last call to [`Snapshot::advance_state`].
    pub fn last_transition_epoch(&self) -> i64 {
        self.last_transition_at.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SnapshotState {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    pub fn chunk_size_pow2(&self) -> u8 {
        self.chunk_size_pow2.load(Ordering::Acquire) as u8
    }

    pub fn block_size_pow2(&self) -> u8 {
        self.block_size_pow2.load(Ordering::Acquire) as u8
    }

    /// Grows the block size exponent, never past [`MAX_BLOCK_SIZE_POW2`]
    /// and never past the chunk size itself (a block can't be bigger than
    /// the chunk it resumes within).
    pub fn update_block_size(&self, new_pow2: u8) {
        let chunk_pow2 = self.chunk_size_pow2();
        let clamped = new_pow2.min(MAX_BLOCK_SIZE_POW2).min(chunk_pow2);
        self.block_size_pow2.store(clamped as u32, Ordering::Release);
    }

    pub fn add_file(&self, metadata: FileMetadata) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.files.push(FileEntry {
            metadata,
            context: FileContext::new(),
        });
    }

    pub fn with_files<R>(&self, f: impl FnOnce(&[FileEntry]) -> R) -> R {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&inner.files)
    }

    fn file_for_chunk(inner: &Inner, chunk_num: u32) -> Option<usize> {
        inner
            .files
            .iter()
            .position(|entry| entry.metadata.contains_chunk(chunk_num))
    }

    fn position_of_file_index(inner: &Inner, file_index: u32) -> Option<usize> {
        inner
            .files
            .iter()
            .position(|entry| entry.metadata.file_index == file_index)
    }

    /// Reserves the next chunk for `task_index`, skipping chunks belonging
    /// to already-deleted files (the deleted-file fast path): those
    /// chunks are marked complete without ever being handed to a task.
    /// Incomplete chunks left over from a restart are drained ahead of
    /// fresh ones, each resuming at its saved block. A chunk whose file is
    /// currently fenced by a DDL statement (`ddl_in_progress`) is put back
    /// as incomplete and this call waits for the fence to clear before
    /// retrying, the same fence `begin_ddl_state` promises against a new
    /// pin or chunk reservation.
    /// REDO_COPY chunks aren't owned by any file, so they skip the
    /// file-lookup/deleted-file/DDL-fence handling entirely.
    pub fn get_next_block<C: WorkerTaskContext>(
        &self,
        task_index: u32,
        task: &C,
    ) -> Result<Option<TaskMetadata>, Error> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        if inner.state == SnapshotState::RedoCopy {
            return Ok(inner
                .chunk_info
                .reserve_next_chunk()
                .map(|(chunk, block)| TaskMetadata {
                    task_index,
                    chunk_num: chunk,
                    block_num: block,
                }));
        }

        loop {
            let (chunk, resume_block) = match inner.chunk_info.reserve_next_chunk() {
                Some(c) => c,
                None => return Ok(None),
            };

            let file_idx = match Self::file_for_chunk(&inner, chunk) {
                Some(idx) => idx,
                None => bail!(CloneError::Internal(format!(
                    "chunk {} not covered by any file in snapshot {}",
                    chunk, self.snapshot_id
                ))),
            };

            if inner.files[file_idx].context.is_deleted() {
                inner.chunk_info.mark_complete(chunk);
                continue;
            }

            if inner.ddl_in_progress {
                inner.chunk_info.add_incomplete_chunk(chunk, resume_block);
                inner = wait_default(inner, &self.inner, &self.condvar, |inner, alert| {
                    if !inner.ddl_in_progress {
                        return WaitOutcome::Done;
                    }
                    if alert {
                        if let Err(e) = task.check_abort() {
                            return WaitOutcome::Fail(e);
                        }
                    }
                    WaitOutcome::Continue
                })?;
                continue;
            }

            return Ok(Some(TaskMetadata {
                task_index,
                chunk_num: chunk,
                block_num: resume_block,
            }));
        }
    }

    /// Looks up the file owning `chunk_num` and pins it for active transfer
    /// in one step, so no DDL can rename/drop it while a task reads its
    /// bytes. Waits for any DDL fence already held on the snapshot to clear
    /// before pinning, so a task can never pin the exact file a concurrent
    /// `begin_ddl_file`/`end_ddl_file` pair is renaming or dropping. The
    /// caller must release the pin via [`Snapshot::unpin_file`] once it's
    /// done with this chunk's block, on every exit path including errors.
    pub fn pin_file_for_chunk<C: WorkerTaskContext>(
        &self,
        chunk_num: u32,
        task: &C,
    ) -> Result<(usize, FileMetadata), Error> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            let idx = Self::file_for_chunk(&inner, chunk_num).ok_or_else(|| {
                CloneError::Internal(format!(
                    "chunk {} has no owning file in snapshot {}",
                    chunk_num, self.snapshot_id
                ))
            })?;

            if !inner.ddl_in_progress {
                inner.files[idx].context.pin();
                return Ok((idx, inner.files[idx].metadata.clone()));
            }

            inner = wait_default(inner, &self.inner, &self.condvar, |inner, alert| {
                if !inner.ddl_in_progress {
                    return WaitOutcome::Done;
                }
                if alert {
                    if let Err(e) = task.check_abort() {
                        return WaitOutcome::Fail(e);
                    }
                }
                WaitOutcome::Continue
            })?;
        }
    }

    /// Consumes the "modified since last transferred" flag for a pinned
    /// file, so the caller knows to resend FILE_METADATA before its next
    /// DATA descriptor.
    pub fn take_modified_by_ddl(&self, file_idx: usize) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.files[file_idx].context.take_modified_by_ddl()
    }

    pub fn unpin_file(&self, file_idx: usize) {
        {
            let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.files[file_idx].context.unpin();
        }
        self.condvar.notify_all();
    }

    /// DDL notification entry point: fences state
    /// transitions, requests `next` (RENAMING or DROPPING) for the file at
    /// `file_index`, and blocks until its last pin drains (`DATA_FILE_CLOSE`).
    /// Returns a guard that keeps the DDL fence held until the caller's own
    /// rename/drop completes; pair with [`Snapshot::end_ddl_file`].
    pub fn begin_ddl_file<C: WorkerTaskContext>(
        &self,
        file_index: u32,
        next: FileContextState,
        task: &C,
    ) -> Result<DdlGuard<'_>, Error> {
        let guard = self.begin_ddl_state();
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let idx = Self::position_of_file_index(&inner, file_index).ok_or_else(|| {
            CloneError::Internal(format!("no file with file_index {}", file_index))
        })?;
        inner.files[idx].context.request_state(next);
        inner.files[idx].context.begin_wait();

        let wait_result = wait_default(inner, &self.inner, &self.condvar, |inner, alert| {
            if !inner.files[idx].context.is_pinned() {
                return WaitOutcome::Done;
            }
            if alert {
                if let Err(e) = task.check_abort() {
                    return WaitOutcome::Fail(e);
                }
            }
            WaitOutcome::Continue
        });

        match wait_result {
            Ok(inner) => {
                inner.files[idx].context.end_wait();
                Ok(guard)
            }
            Err(e) => {
                let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
                inner.files[idx].context.end_wait();
                Err(e)
            }
        }
    }

    /// Applies the lifecycle transition [`Snapshot::begin_ddl_file`]
    /// requested, once the caller's own rename/drop has actually completed:
    /// end-of-DDL flips `renamed`/`deleted` on the file metadata and records
    /// the ddl extension. Dropping the `DdlGuard` releases the transition
    /// fence taken by `begin_ddl_file`.
    pub fn end_ddl_file(&self, file_index: u32, renamed: bool, deleted: bool) -> Result<FileContextState, Error> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let idx = Self::position_of_file_index(&inner, file_index).ok_or_else(|| {
            CloneError::Internal(format!("no file with file_index {}", file_index))
        })?;
        let new_state = inner.files[idx].context.apply_pending_state();
        inner.files[idx].metadata.renamed = renamed;
        inner.files[idx].metadata.deleted = deleted;
        inner.files[idx].context.mark_modified_by_ddl();
        Ok(new_state)
    }

    /// Installs the archived-redo geometry for REDO_COPY and computes
    /// `num_redo_chunks` (body chunks plus header/trailer).
    /// Call before advancing the snapshot into `RedoCopy`.
    pub fn set_redo_geometry(
        &self,
        files: Vec<String>,
        file_size: u64,
        start_offset: u64,
        header: Vec<u8>,
        trailer: Vec<u8>,
    ) {
        let chunk_len = 1u64 << self.chunk_size_pow2();
        let body_bytes = (files.len() as u64).saturating_mul(file_size);
        let body_chunks = body_bytes.div_ceil(chunk_len.max(1));

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.redo_files = files;
        inner.redo_file_size = file_size;
        inner.redo_start_offset = start_offset;
        inner.redo_header = header;
        inner.redo_trailer = trailer;
        inner.num_redo_chunks = body_chunks as u32 + 2;
    }

    pub fn num_redo_chunks(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).num_redo_chunks
    }

    pub fn redo_start_offset(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).redo_start_offset
    }

    pub fn redo_header(&self) -> Vec<u8> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).redo_header.clone()
    }

    pub fn redo_trailer(&self) -> Vec<u8> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).redo_trailer.clone()
    }

    /// Records that `(space_id, page_no)` was queued for transfer this
    /// state; returns `false` (and bumps `num_duplicate_pages`) if it was
    /// already queued, so PAGE_COPY doesn't re-send a page twice just
    /// because it appears in both the dirty-page list and an overlapping
    /// chunk scan.
    pub fn mark_page_queued(&self, space_id: u32, page_no: u64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.num_pages += 1;
        let inserted = inner.page_set.insert((space_id, page_no));
        if !inserted {
            inner.num_duplicate_pages += 1;
        }
        inserted
    }

    pub fn page_dedup_counts(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        (inner.num_pages, inner.num_duplicate_pages)
    }

    /// Records progress within a chunk that isn't complete yet, so a crash
    /// mid-chunk resumes from `block_num` rather than from the start.
    pub fn record_progress(&self, chunk_num: u32, block_num: u32) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.chunk_info.add_incomplete_chunk(chunk_num, block_num);
    }

    pub fn complete_chunk(&self, chunk_num: u32) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.chunk_info.mark_complete(chunk_num);
    }

    /// Step 1 of the five-step protocol: a task declares it has drained
    /// the current state's chunks. Returns whether this call was the last
    /// one needed, i.e. the caller is now responsible for driving the
    /// transition via [`Snapshot::advance_state`].
    pub fn task_done_with_state(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.tasks_done += 1;
        inner.tasks_done >= inner.tasks_total
    }

    /// Steps 2-5 of the protocol, run by whichever task's
    /// `task_done_with_state` returned `true`:
    /// fence DDL, install the next state's chunk geometry, flip the
    /// state, release the DDL fence, wake every waiter.
    pub fn advance_state(&self, next: SnapshotState, next_total_chunks: u32, tasks_total: u32) {
        let _ddl_guard = self.begin_ddl_state();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.chunk_info.reset(next_total_chunks);
            inner.state = next;
            inner.tasks_done = 0;
            inner.tasks_total = tasks_total;
            inner.generation += 1;
        }
        self.last_transition_at
            .store(proxmox_time::epoch_i64(), Ordering::Release);
        self.condvar.notify_all();
    }

    /// Step for every task that is not the one driving the transition:
    /// block until `generation` has moved past `since_generation`.
    pub fn wait_for_state_change<C: WorkerTaskContext>(
        &self,
        since_generation: u64,
        task: &C,
    ) -> Result<SnapshotState, Error> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let inner = wait_default(inner, &self.inner, &self.condvar, |inner, alert| {
            if inner.generation > since_generation {
                return WaitOutcome::Done;
            }
            if alert {
                if let Err(e) = task.check_abort() {
                    return WaitOutcome::Fail(e);
                }
            }
            WaitOutcome::Continue
        })?;
        Ok(inner.state)
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).generation
    }

    /// Fences DDL against the snapshot's read of file metadata: while
    /// held, no task may pin a new file or begin a new chunk transfer that
    /// would read stale metadata.
    pub fn begin_ddl_state(&self) -> DdlGuard<'_> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.ddl_in_progress = true;
        DdlGuard { snapshot: self }
    }

    fn end_ddl_state(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.ddl_in_progress = false;
        self.condvar.notify_all();
    }

    pub fn is_ddl_in_progress(&self) -> bool {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).ddl_in_progress
    }

    /// First-non-network-error-wins: records `err` unless a more
    /// specific error is already stored.
    pub fn record_error(&self, err: CloneError) {
        let mut slot = self.error.lock().unwrap_or_else(|p| p.into_inner());
        let should_replace = match slot.as_ref() {
            None => true,
            Some(existing) => err.supersedes(existing),
        };
        if should_replace {
            *slot = Some(err);
        }
    }

    /// Reads the current sticky error without clearing it, for callers that
    /// just need to check whether the snapshot is already fatally poisoned.
    /// A `NetworkError` must not poison other tasks, so most callers want
    /// this rather than [`Snapshot::take_error`].
    pub fn peek_error(&self) -> Option<CloneError> {
        self.error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Consumes and clears the sticky error. Only the handle that is about
    /// to report a terminal failure to its caller should call this.
    pub fn take_error(&self) -> Option<CloneError> {
        self.error.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_api_types::{CompressType, EncryptionMetadata};

    struct NoAbort;
    impl WorkerTaskContext for NoAbort {
        fn check_abort(&self) -> Result<(), Error> {
            Ok(())
        }
        fn log(&self, _level: log::Level, _message: &std::fmt::Arguments) {}
    }

    fn file(begin: u32, end: u32, deleted: bool) -> FileMetadata {
        FileMetadata {
            file_size: 0,
            space_id: 1,
            file_index: 0,
            begin_chunk: begin,
            end_chunk: end,
            name: "t1.ibd".into(),
            fsp_flags: 0,
            encryption: EncryptionMetadata::none(),
            compress_type: CompressType::None,
            punch_hole: false,
            fsblk_size: 4096,
            deleted,
            renamed: false,
        }
    }

    #[test]
    fn get_next_block_reserves_chunks_in_order() {
        let snap = Snapshot::new(1, CloneType::Blocking, 4, 1);
        snap.add_file(file(1, 4, false));

        let first = snap.get_next_block(0, &NoAbort).unwrap().unwrap();
        assert_eq!(first.chunk_num, 1);
        let second = snap.get_next_block(0, &NoAbort).unwrap().unwrap();
        assert_eq!(second.chunk_num, 2);
    }

    #[test]
    fn deleted_file_chunks_are_skipped_automatically() {
        let snap = Snapshot::new(1, CloneType::Blocking, 4, 1);
        snap.add_file(file(1, 2, true));
        snap.add_file(file(3, 4, false));

        let first = snap.get_next_block(0, &NoAbort).unwrap().unwrap();
        assert_eq!(first.chunk_num, 3);
    }

    #[test]
    fn last_task_drives_the_transition() {
        let snap = Snapshot::new(1, CloneType::Page, 4, 2);
        assert!(!snap.task_done_with_state());
        assert!(snap.task_done_with_state());
        snap.advance_state(SnapshotState::PageCopy, 8, 2);
        assert_eq!(snap.state(), SnapshotState::PageCopy);
    }

    #[test]
    fn waiter_observes_the_transition() {
        let snap = Snapshot::new(1, CloneType::Page, 4, 1);
        let gen = snap.generation();
        snap.advance_state(SnapshotState::PageCopy, 8, 1);
        let state = snap.wait_for_state_change(gen, &NoAbort).unwrap();
        assert_eq!(state, SnapshotState::PageCopy);
    }

    #[test]
    fn record_error_follows_first_non_network_wins() {
        let snap = Snapshot::new(1, CloneType::Blocking, 4, 1);
        snap.record_error(CloneError::NetworkError("reset".into()));
        snap.record_error(CloneError::CorruptPage("page 1".into()));
        assert_eq!(
            snap.take_error(),
            Some(CloneError::CorruptPage("page 1".into()))
        );
    }

    #[test]
    fn update_block_size_never_exceeds_chunk_size() {
        let snap = Snapshot::new(1, CloneType::Blocking, 4, 1);
        snap.update_block_size(200);
        assert_eq!(snap.block_size_pow2(), snap.chunk_size_pow2());
    }

    #[test]
    fn take_error_clears_the_slot_but_peek_error_does_not() {
        let snap = Snapshot::new(1, CloneType::Blocking, 4, 1);
        snap.record_error(CloneError::CorruptPage("page 1".into()));
        assert!(snap.peek_error().is_some());
        assert!(snap.peek_error().is_some());
        assert!(snap.take_error().is_some());
        assert!(snap.peek_error().is_none());
        assert!(snap.take_error().is_none());
    }

    #[test]
    fn pin_file_for_chunk_pins_the_owning_file() {
        let snap = Snapshot::new(1, CloneType::Blocking, 4, 1);
        snap.add_file(file(1, 4, false));

        let (idx, meta) = snap.pin_file_for_chunk(2, &NoAbort).unwrap();
        assert_eq!(meta.begin_chunk, 1);
        assert!(snap.with_files(|files| files[idx].context.is_pinned()));
        snap.unpin_file(idx);
        assert!(!snap.with_files(|files| files[idx].context.is_pinned()));
    }

    #[test]
    fn begin_ddl_file_waits_for_the_pin_to_drain() {
        let snap = Snapshot::new(1, CloneType::Blocking, 4, 1);
        snap.add_file(file(1, 4, false));
        let (idx, _meta) = snap.pin_file_for_chunk(1, &NoAbort).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                snap.unpin_file(idx);
            });

            let guard = snap
                .begin_ddl_file(0, FileContextState::Dropping, &NoAbort)
                .unwrap();
            let new_state = snap.end_ddl_file(0, false, true).unwrap();
            assert_eq!(new_state, FileContextState::Dropping);
            drop(guard);
        });

        assert!(snap.with_files(|files| files[0].metadata.deleted));
    }

    #[test]
    fn pin_file_for_chunk_waits_out_a_concurrent_ddl_fence() {
        let snap = Snapshot::new(1, CloneType::Blocking, 4, 1);
        snap.add_file(file(1, 4, false));

        // Hold the file pinned so begin_ddl_file has to wait for it to
        // drain, then release it so begin_ddl_file proceeds while
        // ddl_in_progress is still set. A racing pin_file_for_chunk must
        // block for that entire window and never pin the file mid-drop.
        let (idx, _meta) = snap.pin_file_for_chunk(1, &NoAbort).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                snap.unpin_file(idx);
            });

            let guard = snap
                .begin_ddl_file(0, FileContextState::Dropping, &NoAbort)
                .unwrap();

            let racer = scope.spawn(|| {
                let start = std::time::Instant::now();
                let (pinned_idx, meta) = snap.pin_file_for_chunk(1, &NoAbort).unwrap();
                (start.elapsed(), pinned_idx, meta)
            });

            std::thread::sleep(std::time::Duration::from_millis(60));
            let new_state = snap.end_ddl_file(0, false, true).unwrap();
            assert_eq!(new_state, FileContextState::Dropping);
            drop(guard);

            let (elapsed, pinned_idx, meta) = racer.join().unwrap();
            // Must not have pinned before the fence cleared.
            assert!(elapsed >= std::time::Duration::from_millis(30));
            assert!(meta.deleted);
            snap.unpin_file(pinned_idx);
        });
    }

    #[test]
    fn redo_geometry_computes_body_chunks_plus_header_and_trailer() {
        let snap = Snapshot::new(1, CloneType::Redo, 4, 1);
        snap.set_redo_geometry(
            vec!["redo_1".into(), "redo_2".into()],
            1 << 12,
            0,
            vec![0xaa; 16],
            vec![0xbb; 16],
        );
        // two 4096-byte files over a 4096-byte chunk = 2 body chunks + 2.
        assert_eq!(snap.num_redo_chunks(), 4);
        assert_eq!(snap.redo_header(), vec![0xaa; 16]);
        assert_eq!(snap.redo_trailer(), vec![0xbb; 16]);
    }

    #[test]
    fn mark_page_queued_counts_duplicates() {
        let snap = Snapshot::new(1, CloneType::Page, 4, 1);
        assert!(snap.mark_page_queued(1, 7));
        assert!(!snap.mark_page_queued(1, 7));
        assert!(snap.mark_page_queued(1, 8));
        assert_eq!(snap.page_dedup_counts(), (3, 1));
    }
}
