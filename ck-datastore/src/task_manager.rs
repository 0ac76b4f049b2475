//! Fixed-size registry of the tasks cooperating on one snapshot (spec
//! §4.5, component C5): chunk reservation, per-task progress, and the
//! shared error slot every task consults before reserving its next chunk.

use std::sync::Mutex;

use anyhow::Result;
use ck_api_types::{CloneError, TaskMetadata};
use ck_tools::task::WorkerTaskContext;

use crate::constants::CLONE_MAX_TASKS;
use crate::snapshot::Snapshot;

struct TaskSlot {
    meta: TaskMetadata,
    active: bool,
}

/// Coordinates up to [`CLONE_MAX_TASKS`] workers copying the same
/// snapshot. Reservation itself is delegated to the snapshot's chunk
/// info; this layer adds per-task identity and the "one task's error
/// stops every task" propagation.
pub struct TaskManager {
    slots: Mutex<Vec<TaskSlot>>,
}

impl TaskManager {
    pub fn new(num_tasks: usize) -> Result<Self> {
        if num_tasks > CLONE_MAX_TASKS {
            return Err(CloneError::TooManyConcurrent.into());
        }
        let slots = (0..num_tasks)
            .map(|i| TaskSlot {
                meta: TaskMetadata::new(i as u32),
                active: true,
            })
            .collect();
        Ok(TaskManager {
            slots: Mutex::new(slots),
        })
    }

    pub fn num_tasks(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Reserves the next chunk for `task_index` from `snapshot`, recording
    /// the reservation locally so [`TaskManager::progress_of`] can report
    /// it without going back through the snapshot.
    pub fn reserve_next_chunk<C: WorkerTaskContext>(
        &self,
        snapshot: &Snapshot,
        task_index: u32,
        task: &C,
    ) -> Result<Option<TaskMetadata>> {
        if let Some(err) = snapshot.peek_error() {
            return Err(err.into());
        }
        let reserved = snapshot.get_next_block(task_index, task)?;
        if let Some(meta) = reserved {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(slot) = slots.get_mut(task_index as usize) {
                slot.meta = meta;
            }
        }
        Ok(reserved)
    }

    /// Records that `task_index` made progress on its current chunk, for
    /// crash-resumable reporting (`incomplete_chunks` lives on the
    /// snapshot; this is just the task-local view of it).
    pub fn record_progress(&self, task_index: u32, chunk_num: u32, block_num: u32) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = slots.get_mut(task_index as usize) {
            slot.meta.chunk_num = chunk_num;
            slot.meta.block_num = block_num;
        }
    }

    pub fn progress_of(&self, task_index: u32) -> Option<TaskMetadata> {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(task_index as usize)
            .map(|slot| slot.meta)
    }

    pub fn mark_inactive(&self, task_index: u32) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = slots.get_mut(task_index as usize) {
            slot.active = false;
        }
    }

    pub fn active_task_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|s| s.active)
            .count()
    }

    /// Records `err` against the snapshot's shared error slot (first
    /// non-network error wins) and marks `task_index` inactive so
    /// other tasks stop waiting on it.
    pub fn set_error(&self, snapshot: &Snapshot, task_index: u32, err: CloneError) {
        snapshot.record_error(err);
        self.mark_inactive(task_index);
    }

    /// Whether some other task has already recorded a fatal error, in
    /// which case `task_index` should stop reserving new chunks and
    /// unwind instead.
    pub fn handle_error_other_task(&self, snapshot: &Snapshot) -> Option<CloneError> {
        snapshot.peek_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_api_types::{CloneType, CompressType, EncryptionMetadata, FileMetadata};
    use ck_tools::task::LoggingContext;

    fn file(begin: u32, end: u32) -> FileMetadata {
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
            deleted: false,
            renamed: false,
        }
    }

    #[test]
    fn new_rejects_too_many_tasks() {
        let err = TaskManager::new(CLONE_MAX_TASKS + 1).unwrap_err();
        assert!(err.to_string().contains("too many concurrent"));
    }

    #[test]
    fn reserve_next_chunk_updates_task_local_progress() {
        let snap = Snapshot::new(1, CloneType::Blocking, 4, 2);
        snap.add_file(file(1, 4));
        let tm = TaskManager::new(2).unwrap();

        let reserved = tm.reserve_next_chunk(&snap, 0, &LoggingContext).unwrap().unwrap();
        assert_eq!(reserved.chunk_num, 1);
        assert_eq!(tm.progress_of(0).unwrap().chunk_num, 1);
    }

    #[test]
    fn set_error_stops_other_tasks_from_reserving() {
        let snap = Snapshot::new(1, CloneType::Blocking, 4, 2);
        snap.add_file(file(1, 4));
        let tm = TaskManager::new(2).unwrap();

        tm.set_error(&snap, 0, CloneError::CorruptPage("page 2".into()));
        let result = tm.reserve_next_chunk(&snap, 1, &LoggingContext);
        assert!(result.is_err());
        assert_eq!(tm.active_task_count(), 1);
    }
}
