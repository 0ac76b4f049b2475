//! Space-id bank: tracks the lifecycle
//! state of every undo tablespace slot, the round-robin truncate-candidate
//! scan, and hands out a fresh space id for a truncated-and-reconstructed
//! tablespace without ever reusing one still resident in the buffer pool.

use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use ck_api_types::undo::{CONCURRENT_UNDO_TRUNCATE_LIMIT, FSP_MAX_UNDO_TABLESPACES, UNDO_SPACE_ID_RANGE};
use ck_api_types::UndoSpaceState;

/// Minimum spacing between `mark_undo_for_truncate`'s round-robin size
/// scans ("the 1-second timer elapsed").
pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);

struct Slot {
    state: UndoSpaceState,
    /// Set once this slot has actually been handed to the truncate
    /// pipeline (distinct from `InactiveExplicit`, which only means a user
    /// issued `ALTER UNDO TABLESPACE ... SET INACTIVE` -- the scan still
    /// has to pick it up before truncation begins).
    truncating: bool,
    /// Next offset within this undo number's id range to hand out;
    /// monotonically increasing and wrapped modulo `UNDO_SPACE_ID_RANGE`
    /// so a freshly truncated space never collides with one a lingering
    /// reader still has pinned.
    next_offset: u32,
}

pub struct SpaceIdBank {
    slots: Vec<Slot>,
    marked_for_truncate: usize,
    scan_pos: usize,
    last_scan_at: Option<Instant>,
}

impl SpaceIdBank {
    pub fn new(num_undo_spaces: u32) -> Result<Self> {
        if num_undo_spaces > FSP_MAX_UNDO_TABLESPACES {
            bail!(
                "num_undo_spaces {} exceeds FSP_MAX_UNDO_TABLESPACES {}",
                num_undo_spaces,
                FSP_MAX_UNDO_TABLESPACES
            );
        }
        let slots = (0..num_undo_spaces)
            .map(|_| Slot {
                state: UndoSpaceState::Active,
                truncating: false,
                next_offset: 0,
            })
            .collect();
        Ok(SpaceIdBank {
            slots,
            marked_for_truncate: 0,
            scan_pos: 0,
            last_scan_at: None,
        })
    }

    fn check_bounds(&self, undo_num: u32) -> Result<()> {
        if undo_num as usize >= self.slots.len() {
            bail!("undo number {} out of range", undo_num);
        }
        Ok(())
    }

    pub fn state_of(&self, undo_num: u32) -> Result<UndoSpaceState> {
        self.check_bounds(undo_num)?;
        Ok(self.slots[undo_num as usize].state)
    }

    /// Models `ALTER UNDO TABLESPACE ... SET INACTIVE`: a user-initiated
    /// transition that makes the space eligible for the truncate scan's
    /// first preference, without itself starting truncation or consuming
    /// a `CONCURRENT_UNDO_TRUNCATE_LIMIT` slot.
    pub fn set_user_inactive(&mut self, undo_num: u32) -> Result<()> {
        self.check_bounds(undo_num)?;
        let slot = &mut self.slots[undo_num as usize];
        if slot.state == UndoSpaceState::Active {
            slot.state = UndoSpaceState::InactiveExplicit;
        }
        Ok(())
    }

    /// Marks an active (or previously user-inactivated) undo tablespace as
    /// a candidate for truncation. Refuses once
    /// [`CONCURRENT_UNDO_TRUNCATE_LIMIT`] tablespaces are already marked
    /// and not yet empty, so the destination never has more truncations in
    /// flight than it can track resident pages for.
    pub fn mark_for_truncate(&mut self, undo_num: u32) -> Result<()> {
        self.check_bounds(undo_num)?;
        if self.slots[undo_num as usize].truncating {
            return Ok(());
        }
        if self.marked_for_truncate >= CONCURRENT_UNDO_TRUNCATE_LIMIT {
            log::warn!(
                "undo tablespace {} not selected for truncate: {} spaces already marked (limit {})",
                undo_num,
                self.marked_for_truncate,
                CONCURRENT_UNDO_TRUNCATE_LIMIT
            );
            bail!(
                "already {} undo tablespaces marked for truncate (limit {})",
                self.marked_for_truncate,
                CONCURRENT_UNDO_TRUNCATE_LIMIT
            );
        }
        let slot = &mut self.slots[undo_num as usize];
        if slot.state == UndoSpaceState::Active {
            slot.state = UndoSpaceState::InactiveImplicit;
        }
        slot.truncating = true;
        self.marked_for_truncate += 1;
        Ok(())
    }

    pub fn is_marked(&self, undo_num: u32) -> Result<bool> {
        self.check_bounds(undo_num)?;
        Ok(self.slots[undo_num as usize].state.is_inactive())
    }

    /// Called once the rollback segment is confirmed drained: flips the
    /// slot to `Empty`, making it eligible for [`SpaceIdBank::next_space_id`].
    pub fn mark_empty(&mut self, undo_num: u32) -> Result<()> {
        self.check_bounds(undo_num)?;
        let slot = &mut self.slots[undo_num as usize];
        if slot.state.is_inactive() {
            slot.state = UndoSpaceState::Empty;
            self.marked_for_truncate = self.marked_for_truncate.saturating_sub(1);
        }
        Ok(())
    }

    /// Reactivates a slot after its tablespace file has been recreated
    /// under a fresh space id.
    pub fn reactivate(&mut self, undo_num: u32) -> Result<()> {
        self.check_bounds(undo_num)?;
        let slot = &mut self.slots[undo_num as usize];
        slot.state = UndoSpaceState::Active;
        slot.truncating = false;
        Ok(())
    }

    /// Next space id for `undo_num`'s tablespace, wrapping within its
    /// `UNDO_SPACE_ID_RANGE`-sized slice of the id space once exhausted.
    pub fn next_space_id(&mut self, undo_num: u32) -> Result<u32> {
        self.check_bounds(undo_num)?;
        let slot = &mut self.slots[undo_num as usize];
        let id = undo_num * UNDO_SPACE_ID_RANGE + slot.next_offset;
        slot.next_offset = (slot.next_offset + 1) % UNDO_SPACE_ID_RANGE;
        Ok(id)
    }

    /// `mark_undo_for_truncate`: picks the undo number
    /// the purge loop should work on this batch, marking it in the
    /// process, or returns `None` if nothing qualifies this round.
    ///
    /// Priority order: (1) a space already mid-truncate, so the caller
    /// keeps draining the one it started; (2) a space the user explicitly
    /// set inactive; (3) -- only for a background pass (`truncate_count
    /// == 0`) with at least two active spaces, and no more often than
    /// once per [`SCAN_INTERVAL`] -- a round-robin scan for an active
    /// space whose on-disk size (`size_of`) exceeds `max_size` or
    /// `initial_size`.
    pub fn mark_undo_for_truncate(
        &mut self,
        truncate_count: u32,
        now: Instant,
        size_of: impl Fn(u32) -> u64,
        max_size: u64,
        initial_size: u64,
    ) -> Result<Option<u32>> {
        if let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.truncating && s.state != UndoSpaceState::Empty)
        {
            return Ok(Some(idx as u32));
        }

        if let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.state == UndoSpaceState::InactiveExplicit && !s.truncating)
        {
            self.mark_for_truncate(idx as u32)?;
            return Ok(Some(idx as u32));
        }

        let active_count = self
            .slots
            .iter()
            .filter(|s| s.state == UndoSpaceState::Active)
            .count();
        if truncate_count != 0 || active_count < 2 || self.slots.is_empty() {
            return Ok(None);
        }
        let scan_due = match self.last_scan_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= SCAN_INTERVAL,
        };
        if !scan_due {
            return Ok(None);
        }
        self.last_scan_at = Some(now);

        let len = self.slots.len();
        for step in 0..len {
            let idx = (self.scan_pos + step) % len;
            if self.slots[idx].state != UndoSpaceState::Active {
                continue;
            }
            let size = size_of(idx as u32);
            if size > max_size || size > initial_size {
                self.scan_pos = (idx + 1) % len;
                self.mark_for_truncate(idx as u32)?;
                return Ok(Some(idx as u32));
            }
        }
        self.scan_pos = (self.scan_pos + 1) % len;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_space_id_wraps_within_its_range() {
        let mut bank = SpaceIdBank::new(2).unwrap();
        let first = bank.next_space_id(0).unwrap();
        for _ in 0..(UNDO_SPACE_ID_RANGE - 1) {
            bank.next_space_id(0).unwrap();
        }
        let wrapped = bank.next_space_id(0).unwrap();
        assert_eq!(wrapped, first);
    }

    #[test]
    fn next_space_id_does_not_collide_across_undo_numbers() {
        let mut bank = SpaceIdBank::new(2).unwrap();
        let a = bank.next_space_id(0).unwrap();
        let b = bank.next_space_id(1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn mark_for_truncate_respects_concurrent_limit() {
        let mut bank = SpaceIdBank::new((CONCURRENT_UNDO_TRUNCATE_LIMIT as u32) + 1).unwrap();
        for i in 0..CONCURRENT_UNDO_TRUNCATE_LIMIT as u32 {
            bank.mark_for_truncate(i).unwrap();
        }
        let err = bank.mark_for_truncate(CONCURRENT_UNDO_TRUNCATE_LIMIT as u32).unwrap_err();
        assert!(err.to_string().contains("already"));
    }

    #[test]
    fn mark_empty_frees_a_truncate_slot() {
        let mut bank = SpaceIdBank::new(1).unwrap();
        bank.mark_for_truncate(0).unwrap();
        bank.mark_empty(0).unwrap();
        assert_eq!(bank.state_of(0).unwrap(), UndoSpaceState::Empty);
        // Freed slot lets another tablespace be marked again up to the limit.
        assert_eq!(bank.marked_for_truncate, 0);
    }

    #[test]
    fn scan_prefers_a_user_inactivated_space_over_size_scan() {
        let mut bank = SpaceIdBank::new(3).unwrap();
        bank.set_user_inactive(2).unwrap();

        let chosen = bank
            .mark_undo_for_truncate(0, Instant::now(), |_| 0, u64::MAX, u64::MAX)
            .unwrap();
        assert_eq!(chosen, Some(2));
        assert!(bank.is_marked(2).unwrap());
    }

    #[test]
    fn scan_picks_an_oversized_active_space_round_robin() {
        let mut bank = SpaceIdBank::new(3).unwrap();
        let sizes = [1_000u64, 50_000_000u64, 2_000u64];
        let chosen = bank
            .mark_undo_for_truncate(0, Instant::now(), |n| sizes[n as usize], 1_000_000, 1_000_000)
            .unwrap();
        assert_eq!(chosen, Some(1));
    }

    #[test]
    fn scan_is_skipped_for_an_explicit_truncate_count() {
        let mut bank = SpaceIdBank::new(3).unwrap();
        let chosen = bank
            .mark_undo_for_truncate(1, Instant::now(), |_| u64::MAX, 1, 1)
            .unwrap();
        assert_eq!(chosen, None);
    }

    #[test]
    fn scan_requires_at_least_two_active_spaces() {
        let mut bank = SpaceIdBank::new(1).unwrap();
        let chosen = bank
            .mark_undo_for_truncate(0, Instant::now(), |_| u64::MAX, 1, 1)
            .unwrap();
        assert_eq!(chosen, None);
    }

    #[test]
    fn scan_continues_an_already_marked_truncation() {
        let mut bank = SpaceIdBank::new(2).unwrap();
        bank.mark_for_truncate(0).unwrap();
        let chosen = bank
            .mark_undo_for_truncate(0, Instant::now(), |_| 0, u64::MAX, u64::MAX)
            .unwrap();
        assert_eq!(chosen, Some(0));
    }
}
