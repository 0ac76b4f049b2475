//! Per-direction clone handle: the façade a
//! caller drives through `begin`/`copy`/`apply`/`ack`/`end`, and the small
//! callback interface ([`TransferCallback`]) that lets this crate stay
//! ignorant of how pages are actually read from or written to a tablespace
//! file.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use ck_api_types::{
    CloneError, CloneType, FileMetadata, HandleState, HandleType, Locator, SnapshotState,
};
use ck_datastore::descriptor::{
    self, DataDescriptorBody, DescriptorType, StateDescriptorBody,
};
use ck_datastore::{FileContextState, Snapshot, TaskManager};
use ck_tools::task::WorkerTaskContext;
use ck_tools::{task_debug, task_log};

use crate::clone_system::CloneSystem;

/// Sentinel `space_id` routing REDO_COPY's header/body/trailer reads
/// through the same four-method [`TransferCallback`] every other state
/// uses, rather than adding a dedicated redo-log callback -- a small
/// interface, not a generic I/O abstraction. A real `space_id`
/// never reaches `u32::MAX`.
pub const REDO_SPACE_ID: u32 = u32::MAX;

/// Releases a file's pin on every exit path out of
/// [`Handle::copy`], including the early return on a network error.
struct PinGuard<'a> {
    snapshot: &'a Snapshot,
    file_idx: usize,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.snapshot.unpin_file(self.file_idx);
    }
}

/// The four touch points a caller must supply so this crate can drive a
/// transfer without knowing how pages are read from or written to disk
/// ("a small interface, not a generic I/O abstraction").
///
/// `file_cbk`/`apply_file_cbk` fire once per file, before its first block;
/// `buffer_cbk`/`apply_buffer_cbk` fire once per block.
pub trait TransferCallback {
    /// Copy side: about to start sending `metadata`'s file. A typical
    /// implementation opens the source file read-only here.
    fn file_cbk(&self, metadata: &FileMetadata) -> Result<()>;

    /// Apply side: about to start receiving `metadata`'s file. A typical
    /// implementation creates (or truncates) the destination file,
    /// pre-sized to `metadata.file_size`.
    fn apply_file_cbk(&self, metadata: &FileMetadata) -> Result<()>;

    /// Copy side: read one block's worth of bytes starting at `offset`
    /// within `space_id`'s file into the returned buffer.
    fn buffer_cbk(&self, space_id: u32, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Apply side: write `payload` at `offset` within `space_id`'s file.
    fn apply_buffer_cbk(&self, space_id: u32, offset: u64, payload: &[u8]) -> Result<()>;
}

/// One side (COPY or APPLY) of one clone attempt. A `Handle` is attached to
/// exactly one [`Snapshot`] for its lifetime; network restarts reattach a
/// fresh `Handle` to the same snapshot via the locator exchanged at
/// `begin()`.
pub struct Handle {
    pub handle_type: HandleType,
    state: Mutex<HandleState>,
    locator: Mutex<Locator>,
    snapshot: Arc<Snapshot>,
    task_manager: Arc<TaskManager>,
    desc_version: AtomicU32,
    arr_index: Mutex<Option<usize>>,
    /// `(local master key, destination master key)`, set once the
    /// destination's key is known: page 0 of an encrypted
    /// tablespace is re-encrypted under the destination's master key
    /// before it ever leaves the source). `None` until then; a COPY
    /// handle for an unencrypted snapshot never needs to set it.
    master_keys: Mutex<Option<([u8; 32], [u8; 32])>>,
}

impl Handle {
    /// `begin()`: negotiates a descriptor version, and either
    /// creates a fresh snapshot (COPY with no reference locator) or
    /// attaches to an existing one (APPLY with a reference locator from a
    /// prior, now-reconnecting attempt).
    pub fn begin(
        system: &CloneSystem,
        handle_type: HandleType,
        ref_locator: Option<Locator>,
        clone_type: CloneType,
        num_tasks: u32,
        total_chunks: u32,
    ) -> Result<Arc<Handle>> {
        let (snapshot, locator) = match ref_locator {
            Some(loc) if loc.is_valid() => {
                let snapshot = system
                    .find_snapshot(loc.snapshot_id)
                    .ok_or_else(|| CloneError::InvalidDescriptor(format!(
                        "no snapshot {} registered for restart locator",
                        loc.snapshot_id
                    )))?;
                (snapshot, loc)
            }
            _ => {
                let clone_id = system.next_clone_id();
                let snapshot_id = clone_id;
                let snapshot =
                    system.register_snapshot(snapshot_id, clone_type, total_chunks, num_tasks)?;
                let locator = Locator {
                    clone_id,
                    snapshot_id,
                    clone_index: 0,
                    state: SnapshotState::Init,
                    metadata_transferred: false,
                };
                (snapshot, locator)
            }
        };

        let task_manager = Arc::new(TaskManager::new(num_tasks as usize)?);
        let handle = Arc::new(Handle {
            handle_type,
            state: Mutex::new(HandleState::Init),
            locator: Mutex::new(locator),
            snapshot,
            task_manager,
            desc_version: AtomicU32::new(descriptor::LOCAL_MAX_VERSION),
            arr_index: Mutex::new(None),
            master_keys: Mutex::new(None),
        });

        let idx = system.register_handle(handle.clone())?;
        *handle.arr_index.lock().unwrap_or_else(|p| p.into_inner()) = Some(idx);
        *handle.state.lock().unwrap_or_else(|p| p.into_inner()) = HandleState::Active;
        Ok(handle)
    }

    pub fn locator(&self) -> Locator {
        *self.locator.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> HandleState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn negotiate_version(&self, remote_version: u32) -> u32 {
        let negotiated = descriptor::negotiate_version(remote_version);
        self.desc_version.store(negotiated, Ordering::Release);
        negotiated
    }

    fn desc_version(&self) -> u32 {
        self.desc_version.load(Ordering::Acquire)
    }

    /// Records the key pair `copy()` should use to re-encrypt page 0 of an
    /// encrypted tablespace once the destination's master key has been
    /// learned (normally during the locator exchange at `begin()`).
    pub fn set_master_keys(&self, local: [u8; 32], destination: [u8; 32]) {
        *self.master_keys.lock().unwrap_or_else(|p| p.into_inner()) = Some((local, destination));
    }

    /// `copy()`: the per-task driving loop on the source
    /// side. Reserves the next chunk, walks its blocks through
    /// `callback.buffer_cbk`, and encodes a DATA descriptor for each one.
    /// Returns `Ok(None)` once this task has drained every chunk of the
    /// current state and the caller should move on to `ack`/state-advance
    /// handling; `Ok(Some(descriptors))` carries the encoded wire bytes for
    /// the caller to send.
    pub fn copy<C: WorkerTaskContext>(
        &self,
        task_index: u32,
        callback: &dyn TransferCallback,
        task: &C,
    ) -> Result<Option<Vec<Vec<u8>>>> {
        task.check_abort()?;
        if let Some(err) = self.task_manager.handle_error_other_task(&self.snapshot) {
            bail!(err);
        }

        let reserved = self
            .task_manager
            .reserve_next_chunk(&self.snapshot, task_index, task)?;

        let meta = match reserved {
            Some(meta) => meta,
            None => {
                task_debug!(task, "task {} drained the current state's chunks", task_index);
                return Ok(None);
            }
        };

        if self.snapshot.state() == SnapshotState::RedoCopy {
            return self.copy_redo_chunk(task_index, meta, callback);
        }

        let version = self.desc_version();
        let mut out = Vec::new();
        let block_size_pow2 = self.snapshot.block_size_pow2();
        let block_len = 1usize << block_size_pow2;

        // Pinned for the lifetime of this block's transfer: DDL
        // on this file blocks in `begin_ddl_file` until `_pin` is dropped.
        let (file_idx, mut file) = self.snapshot.pin_file_for_chunk(meta.chunk_num, task)?;
        let _pin = PinGuard {
            snapshot: &self.snapshot,
            file_idx,
        };

        let needs_metadata =
            meta.block_num == 0 || self.snapshot.take_modified_by_ddl(file_idx);
        if needs_metadata {
            if self.snapshot.state() == SnapshotState::PageCopy && file.encryption.encrypted {
                if let Some((local_key, dest_key)) =
                    *self.master_keys.lock().unwrap_or_else(|p| p.into_inner())
                {
                    let next_version = file.encryption.key_version + 1;
                    file.encryption = ck_datastore::reencrypt_for_destination(
                        &file.encryption,
                        &local_key,
                        &dest_key,
                        next_version,
                    )
                    .map_err(|e| CloneError::Internal(format!(
                        "re-encrypting tablespace key for space {}: {}", file.space_id, e
                    )))?;
                }
            }
            callback
                .file_cbk(&file)
                .map_err(|e| CloneError::IoError(e.to_string()))?;
            out.push(descriptor::encode_file_metadata(version, &file));
        }

        let offset = (meta.block_num as u64) * block_len as u64;
        if self.snapshot.state() == SnapshotState::PageCopy {
            self.snapshot
                .mark_page_queued(file.space_id, meta.block_num as u64);
        }
        let payload = match callback.buffer_cbk(file.space_id, offset, block_len) {
            Ok(p) => p,
            Err(e) => {
                // Leave the chunk's resume point where it is so a restart
                // picks this same block back up; don't drop
                // the pin guard's drop order by returning early here.
                self.snapshot.record_progress(meta.chunk_num, meta.block_num);
                let err = CloneError::NetworkError(e.to_string());
                self.record_and_propagate(task_index, err)?;
                unreachable!();
            }
        };

        out.push(descriptor::encode_data(
            version,
            &DataDescriptorBody {
                space_id: file.space_id,
                offset,
                payload: &payload,
            },
        ));

        self.task_manager
            .record_progress(task_index, meta.chunk_num, meta.block_num + 1);

        if ((meta.block_num + 1) as u64 * block_len as u64) >= file.file_size.max(block_len as u64) {
            self.snapshot.complete_chunk(meta.chunk_num);
        } else {
            self.snapshot
                .record_progress(meta.chunk_num, meta.block_num + 1);
        }

        Ok(Some(out))
    }

    /// REDO_COPY's chunk dispatch: chunk 1 is the
    /// archived redo header, the last chunk is its trailer, everything in
    /// between is a `chunk_size`-wide slice of the archived redo files
    /// read back through `buffer_cbk` under [`REDO_SPACE_ID`]. Redo chunks
    /// aren't file-owned, so there's no pin to take here.
    fn copy_redo_chunk(
        &self,
        task_index: u32,
        meta: ck_api_types::TaskMetadata,
        callback: &dyn TransferCallback,
    ) -> Result<Option<Vec<Vec<u8>>>> {
        let version = self.desc_version();
        let num_redo_chunks = self.snapshot.num_redo_chunks();

        let payload = if meta.chunk_num == 1 {
            self.snapshot.redo_header()
        } else if meta.chunk_num == num_redo_chunks {
            self.snapshot.redo_trailer()
        } else {
            let chunk_len = 1u64 << self.snapshot.chunk_size_pow2();
            let body_index = (meta.chunk_num - 2) as u64;
            let offset = self.snapshot.redo_start_offset() + body_index * chunk_len;
            match callback.buffer_cbk(REDO_SPACE_ID, offset, chunk_len as usize) {
                Ok(p) => p,
                Err(e) => {
                    self.snapshot.record_progress(meta.chunk_num, 0);
                    let err = CloneError::NetworkError(e.to_string());
                    self.record_and_propagate(task_index, err)?;
                    unreachable!();
                }
            }
        };

        let out = vec![descriptor::encode_data(
            version,
            &DataDescriptorBody {
                space_id: REDO_SPACE_ID,
                offset: meta.chunk_num as u64,
                payload: &payload,
            },
        )];

        self.snapshot.complete_chunk(meta.chunk_num);
        Ok(Some(out))
    }

    /// `apply()`: dispatches one received descriptor by its
    /// wire type to the matching snapshot/callback action.
    pub fn apply<C: WorkerTaskContext>(
        &self,
        bytes: &[u8],
        callback: &dyn TransferCallback,
        task: &C,
    ) -> Result<()> {
        task.check_abort()?;
        if bytes.len() < descriptor::HEADER_LEN {
            bail!(CloneError::InvalidDescriptor("short descriptor".into()));
        }
        let raw_type = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        match raw_type {
            t if t == descriptor_type_u32(DescriptorType::TaskMetadata) => {
                let (_, meta) = descriptor::decode_task_metadata(bytes)?;
                task_debug!(task, "apply: task metadata for task {}", meta.task_index);
                Ok(())
            }
            t if t == descriptor_type_u32(DescriptorType::State) => {
                let (_, body) = descriptor::decode_state(bytes)?;
                self.apply_state(body, task)
            }
            t if t == descriptor_type_u32(DescriptorType::FileMetadata) => {
                let (_, meta) = descriptor::decode_file_metadata(bytes)?;
                callback
                    .apply_file_cbk(&meta)
                    .map_err(|e| CloneError::IoError(e.to_string()))?;
                self.snapshot.add_file(meta);
                Ok(())
            }
            t if t == descriptor_type_u32(DescriptorType::Data) => {
                let (_, space_id, offset, payload) = descriptor::decode_data(bytes)?;
                callback
                    .apply_buffer_cbk(space_id, offset, payload)
                    .map_err(|e| CloneError::NetworkError(e.to_string()))?;
                Ok(())
            }
            t if t == descriptor_type_u32(DescriptorType::Locator) => {
                let (_, locator) = descriptor::decode_locator(bytes)?;
                *self.locator.lock().unwrap_or_else(|p| p.into_inner()) = locator;
                Ok(())
            }
            other => bail!(CloneError::InvalidDescriptor(format!(
                "unrecognized descriptor type {}", other
            ))),
        }
    }

    fn apply_state<C: WorkerTaskContext>(&self, body: StateDescriptorBody, task: &C) -> Result<()> {
        task_log!(task, "apply: advancing to state {}", body.state);
        self.snapshot
            .update_block_size(body.block_size_pow2);
        self.snapshot
            .advance_state(body.state, body.num_chunks, self.task_manager.num_tasks() as u32);
        Ok(())
    }

    /// `ack()`: step 1 of the five-step state-advance protocol
    /// for one task -- declares this task drained the current state, and
    /// either drives the transition (if it was the last task) or waits for
    /// another task to do so. When this task drives the transition, it also
    /// returns the STATE descriptor plus a FILE_METADATA descriptor for
    /// every file current in the next state, so the
    /// caller can send them ahead of that state's DATA descriptors.
    pub fn ack<C: WorkerTaskContext>(
        &self,
        next_state: SnapshotState,
        next_total_chunks: u32,
        task: &C,
    ) -> Result<(SnapshotState, Option<Vec<Vec<u8>>>)> {
        let since = self.snapshot.generation();
        if self.task_manager.num_tasks() == 1 || self.snapshot_is_last_task() {
            self.snapshot
                .advance_state(next_state, next_total_chunks, self.task_manager.num_tasks() as u32);

            let version = self.desc_version();
            let mut out = Vec::new();
            let state_body = StateDescriptorBody {
                state: next_state,
                task_index: 0,
                num_chunks: next_total_chunks,
                num_files: self.snapshot.with_files(|files| files.len() as u32),
                estimate_bytes: 0,
                flags: 0,
                chunk_size_pow2: self.snapshot.chunk_size_pow2(),
                block_size_pow2: self.snapshot.block_size_pow2(),
                chunk_info: ck_datastore::ChunkInfo::new(next_total_chunks),
            };
            out.push(descriptor::encode_state(version, &state_body));
            let file_descriptors = self
                .snapshot
                .with_files(|files| {
                    files
                        .iter()
                        .map(|f| descriptor::encode_file_metadata(version, &f.metadata))
                        .collect::<Vec<_>>()
                });
            out.extend(file_descriptors);

            return Ok((next_state, Some(out)));
        }
        Ok((self.snapshot.wait_for_state_change(since, task)?, None))
    }

    fn snapshot_is_last_task(&self) -> bool {
        self.snapshot.task_done_with_state()
    }

    /// Routes a chunk-transfer error: a `NetworkError` takes the
    /// handle `Idle` without poisoning the shared error slot -- another
    /// task, or a restarted handle reattached via locator, may still
    /// succeed. Any other error is sticky and fatal for the whole snapshot.
    fn record_and_propagate(&self, task_index: u32, err: CloneError) -> Result<()> {
        if err.is_network() {
            self.task_manager.mark_inactive(task_index);
            *self.state.lock().unwrap_or_else(|p| p.into_inner()) = HandleState::Idle;
        } else {
            self.task_manager.set_error(&self.snapshot, task_index, err.clone());
            *self.state.lock().unwrap_or_else(|p| p.into_inner()) = HandleState::Abort;
        }
        Err(err.into())
    }

    /// Public DDL notification entry point: a caller whose
    /// RENAME/DROP TABLE statement touches one of this snapshot's files
    /// calls this before performing the rename/drop, to fence clone off the
    /// file and wait for any in-flight transfer of it to finish.
    pub fn begin_ddl_file<C: WorkerTaskContext>(
        &self,
        file_index: u32,
        next: FileContextState,
        task: &C,
    ) -> Result<ck_datastore::DdlGuard<'_>> {
        self.snapshot.begin_ddl_file(file_index, next, task)
    }

    /// Completes a DDL notification started with [`Handle::begin_ddl_file`]
    /// once the rename/drop has actually happened; `guard` is consumed here
    /// so the DDL fence can't outlive the state update it protects.
    pub fn end_ddl_file(
        &self,
        guard: ck_datastore::DdlGuard<'_>,
        file_index: u32,
        renamed: bool,
        deleted: bool,
    ) -> Result<FileContextState> {
        let result = self.snapshot.end_ddl_file(file_index, renamed, deleted);
        drop(guard);
        result
    }

    /// `end()`: releases this handle's array slot; if it was the
    /// last handle attached to the snapshot, releases the snapshot too.
    pub fn end(self: &Arc<Self>, system: &CloneSystem) -> Result<()> {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = HandleState::Idle;
        if let Some(idx) = self.arr_index.lock().unwrap_or_else(|p| p.into_inner()).take() {
            system.unregister_handle(idx);
        }
        if system.active_handle_count() == 0 {
            system.release_snapshot(self.snapshot.snapshot_id);
        }
        Ok(())
    }

    /// Translates the current snapshot error (if any) into the MySQL
    /// `ER_*` code `begin`/`copy`/`apply`/`end` are allowed to surface.
    pub fn mysql_errno(&self) -> Option<u32> {
        self.snapshot.take_error().map(|e| e.mysql_errno())
    }
}

fn descriptor_type_u32(t: DescriptorType) -> u32 {
    // Mirrors `DescriptorType::to_u32`, which `ck_datastore::descriptor`
    // keeps private; re-derived here rather than widening that crate's
    // public surface for a single dispatch helper.
    match t {
        DescriptorType::Locator => 1,
        DescriptorType::TaskMetadata => 2,
        DescriptorType::State => 3,
        DescriptorType::FileMetadata => 4,
        DescriptorType::Data => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_api_types::{CompressType, EncryptionMetadata};
    use std::sync::Mutex as StdMutex;

    struct NoAbort;
    impl WorkerTaskContext for NoAbort {
        fn check_abort(&self) -> Result<()> {
            Ok(())
        }
        fn log(&self, _level: log::Level, _message: &std::fmt::Arguments) {}
    }

    struct RecordingCallback {
        written: StdMutex<Vec<(u64, Vec<u8>)>>,
    }

    impl TransferCallback for RecordingCallback {
        fn file_cbk(&self, _metadata: &FileMetadata) -> Result<()> {
            Ok(())
        }
        fn apply_file_cbk(&self, _metadata: &FileMetadata) -> Result<()> {
            Ok(())
        }
        fn buffer_cbk(&self, _space_id: u32, _offset: u64, len: usize) -> Result<Vec<u8>> {
            Ok(vec![0xab; len])
        }
        fn apply_buffer_cbk(&self, _space_id: u32, offset: u64, payload: &[u8]) -> Result<()> {
            self.written
                .lock()
                .unwrap()
                .push((offset, payload.to_vec()));
            Ok(())
        }
    }

    fn file() -> FileMetadata {
        FileMetadata {
            file_size: 64,
            space_id: 1,
            file_index: 0,
            begin_chunk: 1,
            end_chunk: 1,
            name: "t1.ibd".into(),
            fsp_flags: 0,
            encryption: EncryptionMetadata::none(),
            compress_type: CompressType::None,
            punch_hole: false,
            fsblk_size: 4096,
            deleted: false,
            renamed: false,
        }
    }

    #[test]
    fn begin_registers_a_fresh_snapshot_for_copy() {
        let system = CloneSystem::new();
        let handle = Handle::begin(&system, HandleType::Copy, None, CloneType::Blocking, 1, 1).unwrap();
        assert_eq!(handle.state(), HandleState::Active);
        assert!(handle.locator().is_valid());
    }

    #[test]
    fn copy_then_apply_round_trips_a_data_descriptor() {
        let system = CloneSystem::new();
        let handle = Handle::begin(&system, HandleType::Copy, None, CloneType::Blocking, 1, 1).unwrap();
        handle.snapshot.add_file(file());

        let callback = RecordingCallback {
            written: StdMutex::new(Vec::new()),
        };
        let descriptors = handle.copy(0, &callback, &NoAbort).unwrap().unwrap();
        assert_eq!(descriptors.len(), 2); // file metadata + data

        let apply_handle =
            Handle::begin(&system, HandleType::Apply, None, CloneType::Blocking, 1, 1).unwrap();
        for bytes in &descriptors {
            apply_handle.apply(bytes, &callback, &NoAbort).unwrap();
        }
        assert_eq!(callback.written.lock().unwrap().len(), 1);
    }

    #[test]
    fn page_copy_reencrypts_page_zero_under_the_destination_master_key() {
        let local_key = [1u8; 32];
        let dest_key = [2u8; 32];
        let wrapped = ck_datastore::wrap_tablespace_key(&local_key, 1, b"0123456789abcdef", &[3u8; 16]).unwrap();

        let mut encrypted_file = file();
        encrypted_file.encryption = wrapped.clone();

        let system = CloneSystem::new();
        let handle = Handle::begin(&system, HandleType::Copy, None, CloneType::Page, 1, 1).unwrap();
        handle.snapshot.add_file(encrypted_file);
        handle.snapshot.advance_state(SnapshotState::PageCopy, 1, 1);
        handle.set_master_keys(local_key, dest_key);

        let callback = RecordingCallback {
            written: StdMutex::new(Vec::new()),
        };
        let descriptors = handle.copy(0, &callback, &NoAbort).unwrap().unwrap();
        let (_, decoded) = ck_datastore::decode_file_metadata(&descriptors[0]).unwrap();

        assert!(decoded.encryption.encrypted);
        assert_eq!(decoded.encryption.key_version, 2);
        assert_ne!(decoded.encryption.wrapped_key, wrapped.wrapped_key);
        assert_eq!(
            ck_datastore::unwrap_tablespace_key(&dest_key, &decoded.encryption).unwrap(),
            ck_datastore::unwrap_tablespace_key(&local_key, &wrapped).unwrap()
        );
    }

    #[test]
    fn end_releases_the_handle_slot() {
        let system = CloneSystem::new();
        let handle = Handle::begin(&system, HandleType::Copy, None, CloneType::Blocking, 1, 1).unwrap();
        assert_eq!(system.active_handle_count(), 1);
        handle.end(&system).unwrap();
        assert_eq!(system.active_handle_count(), 0);
    }
}
