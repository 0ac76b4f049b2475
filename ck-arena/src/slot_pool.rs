//! Fixed-capacity slot pool with an `i`-handle free list, the allocator
//! every other arena primitive in this crate builds on (grounded on
//! NDB's `ArrayPool`).
//!
//! Elements never move once placed: `seize`/`release` only touch a
//! `next_pool` intrusive link, so an `i`-handle stays valid as long as the
//! slot is not released, even while other slots are seized or released.

use anyhow::{bail, Error};

/// Sentinel meaning "no index" (NDB's `RNIL`).
pub const RNIL: u32 = 0xFFFF_FFFF;

/// Implemented by element types so the pool can thread a free list through
/// them without a separate side table. Mirrors the `nextPool` field NDB
/// bakes into every poolable struct.
pub trait Poolable {
    fn next_pool(&self) -> u32;
    fn set_next_pool(&mut self, next: u32);
}

/// A fixed-size array of `T` plus a free list of unused slots.
///
/// In debug builds an allocation bitmap shadows the free list so that
/// double-release and use-after-release (`get`/`get_mut` on a free slot)
/// are caught immediately instead of silently corrupting the free list,
/// matching the `ARRAY_GUARD` debug instrumentation in the original pool.
pub struct SlotPool<T> {
    slots: Vec<T>,
    free_head: u32,
    free_count: u32,
    #[cfg(debug_assertions)]
    allocated: Vec<bool>,
}

impl<T: Poolable + Default> SlotPool<T> {
    /// Builds a pool of `capacity` slots, all initially free, threaded
    /// into a singly-linked free list in index order.
    pub fn with_capacity(capacity: u32) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            let mut slot = T::default();
            let next = if i + 1 < capacity { i + 1 } else { RNIL };
            slot.set_next_pool(next);
            slots.push(slot);
        }
        SlotPool {
            slots,
            free_head: if capacity == 0 { RNIL } else { 0 },
            free_count: capacity,
            #[cfg(debug_assertions)]
            allocated: vec![false; capacity as usize],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn num_free(&self) -> u32 {
        self.free_count
    }

    /// Pops the head of the free list. Returns `RNIL` if the pool is full.
    pub fn seize(&mut self) -> u32 {
        let i = self.free_head;
        if i == RNIL {
            return RNIL;
        }
        self.free_head = self.slots[i as usize].next_pool();
        self.free_count -= 1;
        #[cfg(debug_assertions)]
        {
            self.allocated[i as usize] = true;
        }
        i
    }

    /// Seizes a specific slot by walking the free list to find it,
    /// exactly as NDB's `seizeId` does (O(free list length); this
    /// primitive is used for restart-time re-attachment of a known index,
    /// not on a hot path).
    pub fn seize_id(&mut self, i: u32) -> Result<(), Error> {
        if i >= self.capacity() {
            bail!("slot index {i} out of range (capacity {})", self.capacity());
        }
        #[cfg(debug_assertions)]
        if self.allocated[i as usize] {
            bail!("slot {i} is already seized");
        }

        if self.free_head == i {
            self.free_head = self.slots[i as usize].next_pool();
            self.free_count -= 1;
            #[cfg(debug_assertions)]
            {
                self.allocated[i as usize] = true;
            }
            return Ok(());
        }

        let mut prev = self.free_head;
        while prev != RNIL {
            let next = self.slots[prev as usize].next_pool();
            if next == i {
                let after = self.slots[i as usize].next_pool();
                self.slots[prev as usize].set_next_pool(after);
                self.free_count -= 1;
                #[cfg(debug_assertions)]
                {
                    self.allocated[i as usize] = true;
                }
                return Ok(());
            }
            prev = next;
        }

        bail!("slot {i} not found on free list (already seized or never free)")
    }

    /// Returns a slot to the free list. In debug builds, releasing a
    /// free slot twice panics instead of corrupting the list.
    pub fn release(&mut self, i: u32) {
        assert!(i < self.capacity(), "release of out-of-range slot {i}");
        #[cfg(debug_assertions)]
        {
            assert!(
                self.allocated[i as usize],
                "double free of slot {i} detected"
            );
            self.allocated[i as usize] = false;
        }
        self.slots[i as usize].set_next_pool(self.free_head);
        self.free_head = i;
        self.free_count += 1;
    }

    pub fn get(&self, i: u32) -> &T {
        #[cfg(debug_assertions)]
        assert!(
            self.allocated[i as usize],
            "use-after-free of slot {i} detected"
        );
        &self.slots[i as usize]
    }

    pub fn get_mut(&mut self, i: u32) -> &mut T {
        #[cfg(debug_assertions)]
        assert!(
            self.allocated[i as usize],
            "use-after-free of slot {i} detected"
        );
        &mut self.slots[i as usize]
    }

    pub fn is_seized(&self, i: u32) -> bool {
        if i >= self.capacity() {
            return false;
        }
        #[cfg(debug_assertions)]
        {
            self.allocated[i as usize]
        }
        #[cfg(not(debug_assertions))]
        {
            true
        }
    }
}
