//! Chained hash table over a [`SlotPool`], grounded on NDB's `DLHashTable`
//!. Buckets hold doubly-linked chains threaded through the
//! same pool elements the table indexes, so no extra allocation happens
//! beyond the pool itself.

use crate::slot_pool::{Poolable, SlotPool, RNIL};

/// Elements participating in a [`HashTable`] need a hash chain link pair,
/// independent of whatever FIFO list links (if any) they also carry.
pub trait HashChainLinks: Poolable {
    fn next_hash(&self) -> u32;
    fn set_next_hash(&mut self, v: u32);
    fn prev_hash(&self) -> u32;
    fn set_prev_hash(&mut self, v: u32);
}

/// Keys must expose equality and a hash value; the table never looks at
/// anything else about `T`.
pub trait HashKey {
    fn hash_value(&self) -> u32;
    fn key_equal(&self, other: &Self) -> bool;
}

fn round_up_pow2(n: u32) -> u32 {
    if n <= 1 {
        return 1;
    }
    1u32 << (32 - (n - 1).leading_zeros())
}

/// A chained hash table whose bucket array size is always a power of two
/// (so bucket selection is a mask, not a modulo).
pub struct HashTable<T> {
    buckets: Vec<u32>,
    len: u32,
    _marker: std::marker::PhantomData<T>,
}

impl<T: HashChainLinks + HashKey> HashTable<T> {
    pub fn with_capacity_hint(capacity_hint: u32) -> Self {
        let n = round_up_pow2(capacity_hint.max(1));
        HashTable {
            buckets: vec![RNIL; n as usize],
            len: 0,
            _marker: std::marker::PhantomData,
        }
    }

    fn bucket_of(&self, hash: u32) -> usize {
        (hash & (self.buckets.len() as u32 - 1)) as usize
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finds the slot holding a key equal to `key`, if any.
    pub fn find(&self, pool: &SlotPool<T>, key: &T) -> Option<u32> {
        let bucket = self.bucket_of(key.hash_value());
        let mut i = self.buckets[bucket];
        while i != RNIL {
            let elem = pool.get(i);
            if elem.key_equal(key) {
                return Some(i);
            }
            i = elem.next_hash();
        }
        None
    }

    /// Adds an already-seized slot to the table, at the head of its
    /// bucket's chain.
    pub fn add(&mut self, pool: &mut SlotPool<T>, i: u32) {
        let hash = pool.get(i).hash_value();
        let bucket = self.bucket_of(hash);
        let old_head = self.buckets[bucket];

        {
            let elem = pool.get_mut(i);
            elem.set_next_hash(old_head);
            elem.set_prev_hash(RNIL);
        }
        if old_head != RNIL {
            pool.get_mut(old_head).set_prev_hash(i);
        }
        self.buckets[bucket] = i;
        self.len += 1;
    }

    /// Unlinks a slot from the table without returning it to the pool.
    pub fn remove(&mut self, pool: &mut SlotPool<T>, i: u32) {
        let (hash, next, prev) = {
            let elem = pool.get(i);
            (elem.hash_value(), elem.next_hash(), elem.prev_hash())
        };
        let bucket = self.bucket_of(hash);

        if next != RNIL {
            pool.get_mut(next).set_prev_hash(prev);
        }
        if prev != RNIL {
            pool.get_mut(prev).set_next_hash(next);
        } else {
            self.buckets[bucket] = next;
        }
        self.len -= 1;
    }

    /// Unlinks and releases a slot back to the pool.
    pub fn release(&mut self, pool: &mut SlotPool<T>, i: u32) {
        self.remove(pool, i);
        pool.release(i);
    }

    /// Forward iteration over every slot currently in the table, bucket by
    /// bucket.
    pub fn iter<'a>(&'a self, pool: &'a SlotPool<T>) -> HashTableIter<'a, T> {
        HashTableIter {
            table: self,
            pool,
            bucket: 0,
            cur: if self.buckets.is_empty() {
                RNIL
            } else {
                self.buckets[0]
            },
        }
    }
}

pub struct HashTableIter<'a, T> {
    table: &'a HashTable<T>,
    pool: &'a SlotPool<T>,
    bucket: usize,
    cur: u32,
}

impl<'a, T: HashChainLinks + HashKey> Iterator for HashTableIter<'a, T> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        loop {
            if self.cur != RNIL {
                let ret = self.cur;
                self.cur = self.pool.get(ret).next_hash();
                return Some(ret);
            }
            self.bucket += 1;
            if self.bucket >= self.table.buckets.len() {
                return None;
            }
            self.cur = self.table.buckets[self.bucket];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Entry {
        next_pool: u32,
        next_hash: u32,
        prev_hash: u32,
        key: u32,
    }

    impl Poolable for Entry {
        fn next_pool(&self) -> u32 {
            self.next_pool
        }
        fn set_next_pool(&mut self, v: u32) {
            self.next_pool = v;
        }
    }

    impl HashChainLinks for Entry {
        fn next_hash(&self) -> u32 {
            self.next_hash
        }
        fn set_next_hash(&mut self, v: u32) {
            self.next_hash = v;
        }
        fn prev_hash(&self) -> u32 {
            self.prev_hash
        }
        fn set_prev_hash(&mut self, v: u32) {
            self.prev_hash = v;
        }
    }

    impl HashKey for Entry {
        fn hash_value(&self) -> u32 {
            self.key.wrapping_mul(2654435761)
        }
        fn key_equal(&self, other: &Self) -> bool {
            self.key == other.key
        }
    }

    #[test]
    fn bucket_count_rounds_up_to_power_of_two() {
        let table: HashTable<Entry> = HashTable::with_capacity_hint(10);
        assert_eq!(table.buckets.len(), 16);
    }

    #[test]
    fn find_add_remove_round_trip() {
        let mut pool: SlotPool<Entry> = SlotPool::with_capacity(32);
        let mut table: HashTable<Entry> = HashTable::with_capacity_hint(16);

        let mut ids = vec![];
        for k in 0..20u32 {
            let i = pool.seize();
            pool.get_mut(i).key = k;
            table.add(&mut pool, i);
            ids.push(i);
        }
        assert_eq!(table.len(), 20);

        let probe = Entry {
            next_pool: 0,
            next_hash: 0,
            prev_hash: 0,
            key: 7,
        };
        let found = table.find(&pool, &probe).expect("key 7 must be present");
        assert_eq!(pool.get(found).key, 7);

        table.release(&mut pool, found);
        assert_eq!(table.len(), 19);
        assert!(table.find(&pool, &probe).is_none());

        let mut seen: Vec<u32> = table.iter(&pool).map(|i| pool.get(i).key).collect();
        seen.sort_unstable();
        let mut expected: Vec<u32> = (0..20).filter(|&k| k != 7).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }
}
