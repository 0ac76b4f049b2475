//! Segmented data buffer over a [`SlotPool`], grounded on NDB's
//! `DataBuffer<sz>`. Used by the snapshot/task-manager layer
//! to hold serialized descriptor payloads without a single contiguous
//! allocation sized to the worst case.

use anyhow::{bail, Error};

use crate::slot_pool::{Poolable, SlotPool, RNIL};

/// One fixed-size segment of `SZ` data words.
pub struct Segment<const SZ: usize> {
    next_pool: u32,
    data: [u32; SZ],
}

impl<const SZ: usize> Default for Segment<SZ> {
    fn default() -> Self {
        Segment {
            next_pool: RNIL,
            data: [0u32; SZ],
        }
    }
}

impl<const SZ: usize> Poolable for Segment<SZ> {
    fn next_pool(&self) -> u32 {
        self.next_pool
    }
    fn set_next_pool(&mut self, v: u32) {
        self.next_pool = v;
    }
}

/// Head/anchor for a segmented buffer: number of words used plus the
/// boundary segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferHead {
    pub used: u32,
    pub first_segment: u32,
    pub last_segment: u32,
}

/// A stable cursor into a buffer: which segment, and the word offset
/// inside it. Computed from an absolute word position by `pos / SZ` /
/// `pos % SZ` rather than by walking word by word.
#[derive(Debug, Clone, Copy)]
pub struct BufferIter {
    pub segment: u32,
    pub offset_in_segment: u32,
    pub pos: u32,
}

pub struct SegBuffer<'p, const SZ: usize> {
    pool: &'p mut SlotPool<Segment<SZ>>,
    head: BufferHead,
}

impl<'p, const SZ: usize> SegBuffer<'p, SZ> {
    pub fn new(pool: &'p mut SlotPool<Segment<SZ>>, head: BufferHead) -> Self {
        assert!(SZ > 0, "segment size must be positive");
        SegBuffer { pool, head }
    }

    pub fn head(&self) -> BufferHead {
        self.head
    }

    pub fn len(&self) -> u32 {
        self.head.used
    }

    pub fn is_empty(&self) -> bool {
        self.head.used == 0
    }

    /// Grows the tail by `n` words (zero-initialized), allocating whatever
    /// new segments are required.
    pub fn seize(&mut self, n: u32) -> Result<(), Error> {
        let mut remaining = n;
        while remaining > 0 {
            let tail_used = (self.head.used as usize) % SZ;
            if self.head.last_segment == RNIL || tail_used == 0 {
                let new_seg = self.pool.seize();
                if new_seg == RNIL {
                    bail!("segment pool exhausted while growing buffer");
                }
                if self.head.last_segment != RNIL {
                    self.pool.get_mut(self.head.last_segment).next_pool = new_seg;
                } else {
                    self.head.first_segment = new_seg;
                }
                self.head.last_segment = new_seg;
            }

            let space_left = SZ - (self.head.used as usize) % SZ;
            let take = remaining.min(space_left as u32);
            self.head.used += take;
            remaining -= take;
        }
        Ok(())
    }

    /// Seizes `src.len()` words and copies `src` into them.
    pub fn append(&mut self, src: &[u32]) -> Result<(), Error> {
        let start = self.head.used;
        self.seize(src.len() as u32)?;
        let mut iter = self.position(start);
        for &word in src {
            self.pool.get_mut(iter.segment).data[iter.offset_in_segment as usize] = word;
            iter = self.next(iter, 1);
        }
        Ok(())
    }

    /// Builds a cursor at absolute word position `pos` by walking only
    /// `pos / SZ` segment hops, not `pos` individual words.
    pub fn position(&self, pos: u32) -> BufferIter {
        let segment_index = pos as usize / SZ;
        let offset = (pos as usize % SZ) as u32;

        let mut seg = self.head.first_segment;
        for _ in 0..segment_index {
            seg = self.pool.get(seg).next_pool; // segment chain reuses next_pool
        }

        BufferIter {
            segment: seg,
            offset_in_segment: offset,
            pos,
        }
    }

    /// Advances a cursor by `hops` words, crossing segment boundaries by
    /// arithmetic on the offset rather than a word-by-word walk.
    pub fn next(&self, iter: BufferIter, hops: u32) -> BufferIter {
        let new_pos = iter.pos + hops;
        let mut offset = iter.offset_in_segment + hops;
        let mut seg = iter.segment;

        while offset as usize >= SZ {
            seg = self.pool.get(seg).next_pool;
            offset -= SZ as u32;
        }

        BufferIter {
            segment: seg,
            offset_in_segment: offset,
            pos: new_pos,
        }
    }

    pub fn word_at(&self, iter: BufferIter) -> u32 {
        self.pool.get(iter.segment).data[iter.offset_in_segment as usize]
    }

    /// Releases every segment back to the pool.
    pub fn release(&mut self) {
        let mut seg = self.head.first_segment;
        while seg != RNIL {
            let next = self.pool.get(seg).next_pool;
            self.pool.release(seg);
            seg = next;
        }
        self.head = BufferHead::default();
    }

    /// Reads the buffer out as a flat `Vec<u32>`.
    pub fn to_vec(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.head.used as usize);
        if self.head.used == 0 {
            return out;
        }
        let mut iter = self.position(0);
        for _ in 0..self.head.used {
            out.push(self.word_at(iter));
            iter = self.next(iter, 1);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back_across_segment_boundaries() {
        let mut pool: SlotPool<Segment<4>> = SlotPool::with_capacity(8);
        let mut head = BufferHead::default();
        {
            let mut buf: SegBuffer<4> = SegBuffer::new(&mut pool, head);
            buf.append(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
            head = buf.head();
        }

        let buf: SegBuffer<4> = SegBuffer::new(&mut pool, head);
        assert_eq!(buf.len(), 9);
        assert_eq!(buf.to_vec(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn position_and_next_match_linear_scan() {
        let mut pool: SlotPool<Segment<3>> = SlotPool::with_capacity(16);
        let mut head = BufferHead::default();
        {
            let mut buf: SegBuffer<3> = SegBuffer::new(&mut pool, head);
            let words: Vec<u32> = (0..20).collect();
            buf.append(&words).unwrap();
            head = buf.head();
        }

        let buf: SegBuffer<3> = SegBuffer::new(&mut pool, head);
        for p in 0..20u32 {
            let iter = buf.position(p);
            assert_eq!(buf.word_at(iter), p);
        }

        let mut iter = buf.position(5);
        iter = buf.next(iter, 7);
        assert_eq!(buf.word_at(iter), 12);
    }

    #[test]
    fn release_frees_all_segments() {
        let mut pool: SlotPool<Segment<4>> = SlotPool::with_capacity(8);
        let mut head = BufferHead::default();
        {
            let mut buf: SegBuffer<4> = SegBuffer::new(&mut pool, head);
            buf.append(&(0..16).collect::<Vec<u32>>()).unwrap();
            head = buf.head();
        }
        assert!(pool.num_free() < 8);
        {
            let mut buf: SegBuffer<4> = SegBuffer::new(&mut pool, head);
            buf.release();
        }
        assert_eq!(pool.num_free(), 8);
    }
}
