//! Intrusive doubly-linked FIFO list over a [`SlotPool`], grounded on NDB's
//! `DLFifoList`.
//!
//! A list does not own storage; it only threads `next_list`/`prev_list`
//! links through elements that already live in a [`SlotPool`]. The head
//! (`first`/`last`) is a small value type ([`ListHead`]) that callers
//! persist wherever convenient -- typically embedded in a larger struct,
//! such as the snapshot's task descriptor chains.

use crate::slot_pool::{Poolable, SlotPool, RNIL};

/// Elements participating in a [`FifoList`] need both a pool link (so they
/// can live in a [`SlotPool`]) and list links (so they can be threaded onto
/// a FIFO chain independent of pool membership).
pub trait ListLinks: Poolable {
    fn next_list(&self) -> u32;
    fn set_next_list(&mut self, v: u32);
    fn prev_list(&self) -> u32;
    fn set_prev_list(&mut self, v: u32);
}

/// Head/anchor for a [`FifoList`]: just the two boundary indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListHead {
    pub first: u32,
    pub last: u32,
}

impl ListHead {
    pub fn empty() -> Self {
        ListHead {
            first: RNIL,
            last: RNIL,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first == RNIL
    }
}

/// A FIFO list view over a pool, anchored at a caller-owned [`ListHead`].
pub struct FifoList<'p, T> {
    pool: &'p mut SlotPool<T>,
    head: ListHead,
}

impl<'p, T: ListLinks> FifoList<'p, T> {
    pub fn new(pool: &'p mut SlotPool<T>, head: ListHead) -> Self {
        FifoList { pool, head }
    }

    pub fn head(&self) -> ListHead {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    /// Seizes a fresh slot from the pool and appends it to the tail.
    /// Returns `RNIL` if the pool is exhausted.
    pub fn seize(&mut self) -> u32 {
        let i = self.pool.seize();
        if i != RNIL {
            self.add(i);
        }
        i
    }

    /// Appends an already-seized element to the tail of the list.
    pub fn add(&mut self, i: u32) {
        let last = self.head.last;
        {
            let t = self.pool.get_mut(i);
            t.set_next_list(RNIL);
            t.set_prev_list(last);
        }
        if self.head.first == RNIL {
            self.head.first = i;
        }
        self.head.last = i;
        if last != RNIL {
            self.pool.get_mut(last).set_next_list(i);
        }
    }

    /// Unlinks an element from the list without returning it to the pool.
    pub fn remove(&mut self, i: u32) {
        let (next, prev) = {
            let t = self.pool.get(i);
            (t.next_list(), t.prev_list())
        };

        if next != RNIL {
            self.pool.get_mut(next).set_prev_list(prev);
        } else {
            self.head.last = prev;
        }

        if prev != RNIL {
            self.pool.get_mut(prev).set_next_list(next);
        } else {
            self.head.first = next;
        }
    }

    /// Unlinks and releases an element back to the pool.
    pub fn release(&mut self, i: u32) {
        self.remove(i);
        self.pool.release(i);
    }

    /// Unlinks and releases every element currently on the list.
    pub fn release_all(&mut self) {
        let mut i = self.head.first;
        while i != RNIL {
            let next = self.pool.get(i).next_list();
            self.pool.release(i);
            i = next;
        }
        self.head = ListHead::empty();
    }

    pub fn first(&self) -> Option<u32> {
        if self.head.first == RNIL {
            None
        } else {
            Some(self.head.first)
        }
    }

    pub fn next(&self, i: u32) -> Option<u32> {
        let n = self.pool.get(i).next_list();
        if n == RNIL {
            None
        } else {
            Some(n)
        }
    }

    pub fn count(&self) -> u32 {
        let mut c = 0;
        let mut i = self.head.first;
        while i != RNIL {
            c += 1;
            i = self.pool.get(i).next_list();
        }
        c
    }

    pub fn get(&self, i: u32) -> &T {
        self.pool.get(i)
    }

    pub fn get_mut(&mut self, i: u32) -> &mut T {
        self.pool.get_mut(i)
    }
}

/// A [`FifoList`] that borrows its head out of a caller's storage for the
/// duration of a scope and writes the (possibly mutated) head back on
/// drop -- the "local list" discipline NDB uses everywhere it needs to
/// mutate a list embedded in a larger, already-locked structure without
/// holding a long-lived borrow of that structure.
pub struct LocalFifoList<'p, 's, T> {
    inner: FifoList<'p, T>,
    src: &'s mut ListHead,
}

impl<'p, 's, T: ListLinks> LocalFifoList<'p, 's, T> {
    pub fn new(pool: &'p mut SlotPool<T>, src: &'s mut ListHead) -> Self {
        let head = *src;
        LocalFifoList {
            inner: FifoList::new(pool, head),
            src,
        }
    }
}

impl<'p, 's, T> std::ops::Deref for LocalFifoList<'p, 's, T> {
    type Target = FifoList<'p, T>;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'p, 's, T> std::ops::DerefMut for LocalFifoList<'p, 's, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<'p, 's, T> Drop for LocalFifoList<'p, 's, T> {
    fn drop(&mut self) {
        *self.src = self.inner.head;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Node {
        next_pool: u32,
        next_list: u32,
        prev_list: u32,
        value: u32,
    }

    impl Poolable for Node {
        fn next_pool(&self) -> u32 {
            self.next_pool
        }
        fn set_next_pool(&mut self, v: u32) {
            self.next_pool = v;
        }
    }

    impl ListLinks for Node {
        fn next_list(&self) -> u32 {
            self.next_list
        }
        fn set_next_list(&mut self, v: u32) {
            self.next_list = v;
        }
        fn prev_list(&self) -> u32 {
            self.prev_list
        }
        fn set_prev_list(&mut self, v: u32) {
            self.prev_list = v;
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut pool: SlotPool<Node> = SlotPool::with_capacity(8);
        let mut head = ListHead::empty();
        {
            let mut list = FifoList::new(&mut pool, head);
            for v in 0..5 {
                let i = list.seize();
                list.get_mut(i).value = v;
            }
            head = list.head();
        }

        let list = FifoList::new(&mut pool, head);
        let mut values = vec![];
        let mut cur = list.first();
        while let Some(i) = cur {
            values.push(list.get(i).value);
            cur = list.next(i);
        }
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(list.count(), 5);
    }

    #[test]
    fn remove_from_middle_relinks_neighbors() {
        let mut pool: SlotPool<Node> = SlotPool::with_capacity(8);
        let mut head = ListHead::empty();
        let mut ids = vec![];
        {
            let mut list = FifoList::new(&mut pool, head);
            for v in 0..4 {
                let i = list.seize();
                list.get_mut(i).value = v;
                ids.push(i);
            }
            head = list.head();
        }

        let mut list = FifoList::new(&mut pool, head);
        list.remove(ids[1]); // remove value 1
        let mut values = vec![];
        let mut cur = list.first();
        while let Some(i) = cur {
            values.push(list.get(i).value);
            cur = list.next(i);
        }
        assert_eq!(values, vec![0, 2, 3]);
    }

    #[test]
    fn local_list_writes_back_on_drop() {
        let mut pool: SlotPool<Node> = SlotPool::with_capacity(4);
        let mut stored_head = ListHead::empty();

        {
            let mut local = LocalFifoList::new(&mut pool, &mut stored_head);
            local.seize();
            local.seize();
        }

        assert!(!stored_head.is_empty());
        assert_eq!(
            FifoList::new(&mut pool, stored_head).count(),
            2,
            "mutations inside the local list scope must be visible after drop"
        );
    }
}
