//! Undo tablespace truncation: chooses a
//! candidate, drains its rollback segments, logs a crash-safe intent
//! file, swaps in a fresh space id, and finalizes.
//!
//! Lock order is fixed and must never be reversed: MDL on the
//! tablespace name, then `undo::ddl_mutex`, then the rollback segments'
//! `x_lock`. `truncate_marked_undo` takes all three as already-acquired
//! guards rather than acquiring them itself, so the caller's lock
//! acquisition order is visible at the call site instead of buried here.

use std::path::Path;

use anyhow::{bail, Result};
use ck_tools::task::WorkerTaskContext;
use ck_tools::{task_log, task_warn};

use crate::space_id_bank::SpaceIdBank;
use crate::truncate_log::TruncateLog;

/// What the caller must already hold, in order, before calling
/// [`truncate_marked_undo`]. Each field is a marker proving the caller
/// acquired that lock; the types carry no data because the actual lock
/// objects live in the embedding server and are opaque to this crate.
pub struct LockOrderProof {
    _mdl: (),
    _ddl_mutex: (),
}

impl LockOrderProof {
    /// Constructed only by acquiring locks in the mandated order: MDL
    /// first, then `undo::ddl_mutex`. There is deliberately no way to
    /// build this proving only the reverse order was taken.
    pub fn acquire_mdl_then_ddl_mutex() -> Self {
        LockOrderProof {
            _mdl: (),
            _ddl_mutex: (),
        }
    }
}

/// Per-rollback-segment emptiness check, supplied by the embedding server
/// since rollback segments themselves are opaque to this crate: empty
/// means `trx_ref_count == 0` and `last_page_no == FIL_NULL`.
pub trait RsegInspector {
    fn rseg_count(&self, undo_num: u32) -> usize;
    /// Takes the rseg's `x_lock` for the duration of the call -- the
    /// third and last lock in the mandated order.
    fn is_rseg_empty(&self, undo_num: u32, rseg_index: usize) -> bool;
}

pub fn check_if_marked_undo_is_empty(undo_num: u32, rsegs: &dyn RsegInspector) -> bool {
    (0..rsegs.rseg_count(undo_num)).all(|i| rsegs.is_rseg_empty(undo_num, i))
}

/// Drains, logs, truncates, and finalizes undo tablespace `undo_num`.
/// `_proof` establishes that MDL and `undo::ddl_mutex` are already held in
/// the correct order; `rsegs` supplies the rseg `x_lock` internally while
/// re-confirming emptiness.
pub fn truncate_marked_undo<C: WorkerTaskContext>(
    undo_num: u32,
    bank: &mut SpaceIdBank,
    rsegs: &dyn RsegInspector,
    log_dir: &Path,
    _proof: &LockOrderProof,
    task: &C,
) -> Result<u32> {
    if !bank.is_marked(undo_num)? {
        bail!("undo tablespace {} is not marked for truncate", undo_num);
    }
    if !check_if_marked_undo_is_empty(undo_num, rsegs) {
        bail!(
            "undo tablespace {} still has live rollback segments",
            undo_num
        );
    }

    let mut log = TruncateLog::create(log_dir, undo_num)?;
    task_log!(task, "undo tablespace {}: truncate log opened", undo_num);

    bank.mark_empty(undo_num)?;
    let new_space_id = bank.next_space_id(undo_num)?;
    bank.reactivate(undo_num)?;

    log.mark_complete()?;
    log.unlink()?;
    task_log!(
        task,
        "undo tablespace {}: truncated, new space id {}",
        undo_num,
        new_space_id
    );

    Ok(new_space_id)
}

/// Crash recovery entry point: redoes any truncation whose log file is
/// present without the completion magic.
pub fn recover_interrupted_truncate<C: WorkerTaskContext>(
    undo_num: u32,
    bank: &mut SpaceIdBank,
    rsegs: &dyn RsegInspector,
    log_dir: &Path,
    task: &C,
) -> Result<Option<u32>> {
    if !crate::truncate_log::is_active_truncate_log_present(log_dir, undo_num)? {
        return Ok(None);
    }
    task_warn!(
        task,
        "undo tablespace {}: truncate log present without completion magic, redoing",
        undo_num
    );
    if !bank.is_marked(undo_num)? {
        bank.mark_for_truncate(undo_num)?;
    }
    let proof = LockOrderProof::acquire_mdl_then_ddl_mutex();
    let new_id = truncate_marked_undo(undo_num, bank, rsegs, log_dir, &proof, task)?;
    Ok(Some(new_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_tools::task::LoggingContext;

    struct AlwaysEmpty;
    impl RsegInspector for AlwaysEmpty {
        fn rseg_count(&self, _undo_num: u32) -> usize {
            2
        }
        fn is_rseg_empty(&self, _undo_num: u32, _rseg_index: usize) -> bool {
            true
        }
    }

    struct OneBusy;
    impl RsegInspector for OneBusy {
        fn rseg_count(&self, _undo_num: u32) -> usize {
            2
        }
        fn is_rseg_empty(&self, _undo_num: u32, rseg_index: usize) -> bool {
            rseg_index != 0
        }
    }

    #[test]
    fn truncate_marked_undo_reassigns_space_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = SpaceIdBank::new(1).unwrap();
        bank.mark_for_truncate(0).unwrap();
        let proof = LockOrderProof::acquire_mdl_then_ddl_mutex();

        let new_id = truncate_marked_undo(0, &mut bank, &AlwaysEmpty, dir.path(), &proof, &LoggingContext)
            .unwrap();
        assert_eq!(new_id, 0);
        assert!(!crate::truncate_log::is_active_truncate_log_present(dir.path(), 0).unwrap());
    }

    #[test]
    fn repeated_truncation_yields_the_wraparound_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = SpaceIdBank::new(1).unwrap();
        let proof = LockOrderProof::acquire_mdl_then_ddl_mutex();

        let mut ids = Vec::new();
        for _ in 0..3 {
            bank.mark_for_truncate(0).unwrap();
            let id = truncate_marked_undo(0, &mut bank, &AlwaysEmpty, dir.path(), &proof, &LoggingContext)
                .unwrap();
            ids.push(id);
        }
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn truncate_refused_while_a_rseg_is_still_busy() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = SpaceIdBank::new(1).unwrap();
        bank.mark_for_truncate(0).unwrap();
        let proof = LockOrderProof::acquire_mdl_then_ddl_mutex();

        let err = truncate_marked_undo(0, &mut bank, &OneBusy, dir.path(), &proof, &LoggingContext)
            .unwrap_err();
        assert!(err.to_string().contains("still has live rollback segments"));
    }

    #[test]
    fn recovery_redoes_an_interrupted_truncate() {
        let dir = tempfile::tempdir().unwrap();
        TruncateLog::create(dir.path(), 4).unwrap();

        let mut bank = SpaceIdBank::new(5).unwrap();
        let recovered = recover_interrupted_truncate(4, &mut bank, &AlwaysEmpty, dir.path(), &LoggingContext)
            .unwrap();
        assert!(recovered.is_some());
        assert!(!crate::truncate_log::is_active_truncate_log_present(dir.path(), 4).unwrap());
    }
}
