//! Persisted chunk reservation state for one snapshot state. Tracks which
//! chunks have been fully reserved, and which
//! chunks have been handed to a task but only partially copied at the time
//! a crash or a state transition needs to serialize progress.

use std::collections::BTreeMap;

use anyhow::{Error, Result};
use ck_api_types::CloneError;

use crate::chunk_bitmap::ChunkBitmap;
use crate::constants::CLONE_MAX_TASKS;

/// Reservation bookkeeping for the chunks of a single snapshot state.
///
/// `incomplete_chunks` records, for every chunk currently assigned to a
/// task but not yet fully copied, the last block number the task reached.
/// On restart after a crash a task resumes a chunk from this block rather
/// than from the beginning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    reserved_chunks: ChunkBitmap,
    incomplete_chunks: BTreeMap<u32, u32>,
    min_unreserved: u32,
}

impl ChunkInfo {
    pub fn new(total_chunks: u32) -> Self {
        ChunkInfo {
            reserved_chunks: ChunkBitmap::new(total_chunks),
            incomplete_chunks: BTreeMap::new(),
            min_unreserved: 1,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.reserved_chunks.total_chunks()
    }

    /// hands back the smallest chunk still recorded as
    /// incomplete, removing it from the map so it isn't handed to a second
    /// task concurrently. A task that stops mid-chunk re-adds it via
    /// [`ChunkInfo::add_incomplete_chunk`] if it needs to give it up again.
    fn process_incomplete_chunk(&mut self) -> Option<(u32, u32)> {
        let chunk = *self.incomplete_chunks.keys().next()?;
        let block = self.incomplete_chunks.remove(&chunk).unwrap();
        Some((chunk, block))
    }

    /// Reserves the next chunk for a task: incomplete chunks left over from
    /// a restart are drained before any fresh chunk, each returned with its
    /// saved resume block. A fresh
    /// chunk always resumes at block 0. Advances `min_unreserved` as a
    /// cache so repeated calls don't rescan chunks already known to be
    /// reserved.
    pub fn reserve_next_chunk(&mut self) -> Option<(u32, u32)> {
        if let Some(incomplete) = self.process_incomplete_chunk() {
            return Some(incomplete);
        }
        if self.min_unreserved > self.total_chunks() {
            return None;
        }
        let chunk = self.reserved_chunks.get_min_unset_bit();
        if chunk > self.total_chunks() {
            self.min_unreserved = chunk;
            return None;
        }
        self.reserved_chunks.set(chunk);
        self.min_unreserved = chunk + 1;
        Some((chunk, 0))
    }

    /// Records that `chunk` is not yet complete, resuming from `block`.
    pub fn add_incomplete_chunk(&mut self, chunk: u32, block: u32) {
        self.incomplete_chunks.insert(chunk, block);
    }

    /// The resume block for `chunk`, if it was left incomplete.
    pub fn incomplete_block(&self, chunk: u32) -> Option<u32> {
        self.incomplete_chunks.get(&chunk).copied()
    }

    /// Marks `chunk` as fully copied, dropping any resume bookkeeping.
    pub fn mark_complete(&mut self, chunk: u32) {
        self.incomplete_chunks.remove(&chunk);
    }

    pub fn is_fully_reserved(&self) -> bool {
        self.reserved_chunks.get_min_unset_bit() > self.total_chunks()
    }

    /// Re-sizes for a new snapshot state, clearing all reservations.
    pub fn reset(&mut self, total_chunks: u32) {
        self.reserved_chunks.reset(total_chunks);
        self.incomplete_chunks.clear();
        self.min_unreserved = 1;
    }

    /// Serializes as `[u32 incomplete_count][u32 chunk, u32 block]*
    /// [u32 bitmap_words][u32 word]*`, all big-endian, for inclusion in a
    /// STATE descriptor body.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.incomplete_chunks.len() as u32).to_be_bytes());
        for (&chunk, &block) in &self.incomplete_chunks {
            out.extend_from_slice(&chunk.to_be_bytes());
            out.extend_from_slice(&block.to_be_bytes());
        }
        let words = self.reserved_chunks.words_snapshot();
        out.extend_from_slice(&(words.len() as u32).to_be_bytes());
        for word in words {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out
    }

    /// Parses the format written by [`serialize`](Self::serialize).
    /// `total_chunks` must match the snapshot state the descriptor belongs
    /// to; it is not itself encoded in the body.
    pub fn deserialize(total_chunks: u32, buf: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(buf);
        let incomplete_count = cursor.take_u32()? as usize;
        if incomplete_count > CLONE_MAX_TASKS {
            return Err(CloneError::InvalidDescriptor(format!(
                "incomplete chunk count {} exceeds CLONE_MAX_TASKS {}",
                incomplete_count, CLONE_MAX_TASKS
            ))
            .into());
        }

        let mut incomplete_chunks = BTreeMap::new();
        for _ in 0..incomplete_count {
            let chunk = cursor.take_u32()?;
            let block = cursor.take_u32()?;
            incomplete_chunks.insert(chunk, block);
        }

        let word_count = cursor.take_u32()? as usize;
        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(cursor.take_u32()?);
        }

        let reserved_chunks = ChunkBitmap::from_words(total_chunks, words)?;
        let min_unreserved = reserved_chunks.get_min_unset_bit();

        Ok(ChunkInfo {
            reserved_chunks,
            incomplete_chunks,
            min_unreserved,
        })
    }
}

/// Minimal big-endian cursor; the descriptor codec uses the same pattern
/// for its own fixed-header/body layout.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take_u32(&mut self) -> Result<u32, Error> {
        if self.pos + 4 > self.buf.len() {
            return Err(CloneError::InvalidDescriptor(
                "chunk info body truncated".into(),
            )
            .into());
        }
        let bytes = [
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ];
        self.pos += 4;
        Ok(u32::from_be_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_next_chunk_walks_forward() {
        let mut ci = ChunkInfo::new(4);
        assert_eq!(ci.reserve_next_chunk(), Some((1, 0)));
        assert_eq!(ci.reserve_next_chunk(), Some((2, 0)));
        assert_eq!(ci.reserve_next_chunk(), Some((3, 0)));
        assert_eq!(ci.reserve_next_chunk(), Some((4, 0)));
        assert_eq!(ci.reserve_next_chunk(), None);
        assert!(ci.is_fully_reserved());
    }

    #[test]
    fn reserve_next_chunk_drains_incomplete_chunks_before_fresh_ones() {
        let mut ci = ChunkInfo::new(40);
        ci.reserve_next_chunk();
        ci.reserve_next_chunk();
        ci.reserve_next_chunk();
        ci.add_incomplete_chunk(2, 7);

        // Chunk 2 was already reserved once (its bit is set); without the
        // incomplete-first check it could never be handed out again.
        assert_eq!(ci.reserve_next_chunk(), Some((2, 7)));
        assert_eq!(ci.incomplete_block(2), None);
        assert_eq!(ci.reserve_next_chunk(), Some((4, 0)));
    }

    #[test]
    fn incomplete_chunk_round_trips_through_serialization() {
        let mut ci = ChunkInfo::new(40);
        ci.reserve_next_chunk();
        ci.reserve_next_chunk();
        ci.add_incomplete_chunk(2, 7);

        let bytes = ci.serialize();
        let restored = ChunkInfo::deserialize(40, &bytes).unwrap();

        assert_eq!(restored.incomplete_block(2), Some(7));
        assert_eq!(restored.reserved_chunks, ci.reserved_chunks);
    }

    #[test]
    fn deserialize_rejects_incomplete_count_over_limit() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((CLONE_MAX_TASKS as u32) + 1).to_be_bytes());
        let err = ChunkInfo::deserialize(40, &bytes).unwrap_err();
        assert!(err.to_string().contains("CLONE_MAX_TASKS"));
    }

    #[test]
    fn mark_complete_drops_resume_bookkeeping() {
        let mut ci = ChunkInfo::new(4);
        ci.add_incomplete_chunk(1, 3);
        ci.mark_complete(1);
        assert_eq!(ci.incomplete_block(1), None);
    }
}
