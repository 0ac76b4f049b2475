//! Global clone registry: a fixed-size table of
//! handles and snapshots, the clone id generator, and the abort latch
//! every wait point in the engine consults.
//!
//! `CLONE_ARR_SIZE`/`SNAPSHOT_ARR_SIZE` are `2 * MAX_CLONES` /
//! `2 * MAX_SNAPSHOTS`: since both `MAX_*` constants are 1, these are
//! length-2 tables so a freshly constructed handle can coexist with a
//! zombie left behind by a previous failed attempt while it's torn down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use ck_api_types::CloneType;
use ck_datastore::Snapshot;
use ck_tools::task::WorkerTaskContext;
use ck_tools::wait::{wait, WaitOutcome};

use ck_datastore::constants::{CLONE_ARR_SIZE, SNAPSHOT_ARR_SIZE};

use crate::handle::Handle;

struct Registry {
    handles: [Option<Arc<Handle>>; CLONE_ARR_SIZE],
    snapshots: [Option<Arc<Snapshot>>; SNAPSHOT_ARR_SIZE],
}

/// Process-wide clone registry; construct one and pass it by reference
/// rather than reaching for a hidden global.
pub struct CloneSystem {
    registry: Mutex<Registry>,
    condvar: Condvar,
    next_clone_id: AtomicU64,
    aborted: AtomicBool,
}

impl CloneSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(CloneSystem {
            registry: Mutex::new(Registry {
                handles: Default::default(),
                snapshots: Default::default(),
            }),
            condvar: Condvar::new(),
            next_clone_id: AtomicU64::new(1),
            aborted: AtomicBool::new(false),
        })
    }

    /// Monotonic clone/snapshot id generator; `0` stays
    /// reserved for "invalid" so it is never handed out.
    pub fn next_clone_id(&self) -> u64 {
        self.next_clone_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Registers a new handle into the first free slot.
    pub fn register_handle(&self, handle: Arc<Handle>) -> Result<usize> {
        let mut reg = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        for (idx, slot) in reg.handles.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(idx);
            }
        }
        bail!(ck_api_types::CloneError::TooManyConcurrent)
    }

    pub fn unregister_handle(&self, arr_index: usize) {
        let mut reg = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = reg.handles.get_mut(arr_index) {
            *slot = None;
        }
        self.condvar.notify_all();
    }

    pub fn register_snapshot(
        &self,
        snapshot_id: u64,
        clone_type: CloneType,
        total_chunks: u32,
        tasks_total: u32,
    ) -> Result<Arc<Snapshot>> {
        let mut reg = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        for slot in reg.snapshots.iter_mut() {
            if slot.is_none() {
                let snapshot = Arc::new(Snapshot::new(snapshot_id, clone_type, total_chunks, tasks_total));
                *slot = Some(snapshot.clone());
                return Ok(snapshot);
            }
        }
        bail!(ck_api_types::CloneError::TooManyConcurrent)
    }

    pub fn find_snapshot(&self, snapshot_id: u64) -> Option<Arc<Snapshot>> {
        let reg = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        reg.snapshots
            .iter()
            .flatten()
            .find(|s| s.snapshot_id == snapshot_id)
            .cloned()
    }

    pub fn release_snapshot(&self, snapshot_id: u64) {
        let mut reg = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        for slot in reg.snapshots.iter_mut() {
            if slot.as_ref().map(|s| s.snapshot_id) == Some(snapshot_id) {
                *slot = None;
            }
        }
    }

    pub fn active_handle_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .handles
            .iter()
            .filter(|h| h.is_some())
            .count()
    }

    /// Sets the system-wide abort latch. With `force`, blocks up to five
    /// minutes for every active handle to notice and unregister,
    /// printing a heartbeat on the minute, then gives up with a warning
    /// rather than hanging forever.
    pub fn mark_abort<C: WorkerTaskContext>(&self, force: bool, task: &C) -> Result<()> {
        self.aborted.store(true, Ordering::Release);
        self.condvar.notify_all();
        if !force {
            return Ok(());
        }

        let guard = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        let result = wait(
            guard,
            &self.registry,
            &self.condvar,
            Duration::from_millis(100),
            Duration::from_secs(5 * 60),
            Duration::from_secs(60),
            |reg: &mut Registry, alert| {
                if reg.handles.iter().all(|h| h.is_none()) {
                    return WaitOutcome::Done;
                }
                if alert {
                    task_warn_active(task, reg.handles.iter().filter(|h| h.is_some()).count());
                }
                WaitOutcome::Continue
            },
        );
        match result {
            Ok(_) => Ok(()),
            Err(_) => {
                ck_tools::task_warn!(
                    task,
                    "mark_abort(force=true) gave up waiting for active clones to notice"
                );
                Ok(())
            }
        }
    }
}

fn task_warn_active<C: WorkerTaskContext>(task: &C, remaining: usize) {
    ck_tools::task_warn!(task, "mark_abort: {} clones still active", remaining);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_tools::task::LoggingContext;

    #[test]
    fn clone_ids_are_monotonic_and_never_zero() {
        let sys = CloneSystem::new();
        let a = sys.next_clone_id();
        let b = sys.next_clone_id();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn mark_abort_without_force_returns_immediately() {
        let sys = CloneSystem::new();
        sys.mark_abort(false, &LoggingContext).unwrap();
        assert!(sys.is_aborted());
    }

    #[test]
    fn register_snapshot_fails_once_table_is_full() {
        let sys = CloneSystem::new();
        for i in 0..SNAPSHOT_ARR_SIZE {
            sys.register_snapshot(i as u64 + 1, CloneType::Blocking, 4, 1)
                .unwrap();
        }
        let err = sys
            .register_snapshot(999, CloneType::Blocking, 4, 1)
            .unwrap_err();
        assert!(err.to_string().contains("too many concurrent"));
    }

    #[test]
    fn find_snapshot_locates_a_registered_snapshot() {
        let sys = CloneSystem::new();
        sys.register_snapshot(42, CloneType::Blocking, 4, 1).unwrap();
        assert!(sys.find_snapshot(42).is_some());
        assert!(sys.find_snapshot(43).is_none());
    }
}
