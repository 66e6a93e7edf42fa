// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Chunk-addressed entry arena. A span allocator over
// `chunks_per_segment` fixed-size chunks, handing back absolute byte
// offsets that `entry.rs` and `segment.rs` read and write through the
// segment's `ByteStore`.

use std::cell::Cell;

use crate::byte_store::ByteStore;
use crate::error::{Error, Result};
use crate::free_bits::FreeBits;

/// One segment's entry arena: `chunks_per_segment * chunk_size` bytes
/// starting at `base_offset`, governed by a `FreeBits` bitset.
pub struct Arena {
    base_offset: usize,
    chunk_size: usize,
    chunks_per_segment: usize,
    free_bits: FreeBits,
    rotating_cursor: Cell<usize>,
}

impl Arena {
    pub fn new(base_offset: usize, chunk_size: usize, chunks_per_segment: usize, free_bits: FreeBits) -> Self {
        Self {
            base_offset,
            chunk_size,
            chunks_per_segment,
            free_bits,
            rotating_cursor: Cell::new(0),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunks_per_segment(&self) -> usize {
        self.chunks_per_segment
    }

    /// Absolute byte offset (into the segment's `ByteStore`) of the
    /// first byte of the entry at chunk `pos`.
    pub fn entry_offset(&self, pos: usize) -> usize {
        self.base_offset + pos * self.chunk_size
    }

    /// `n_chunks = ceil(entry_bytes / chunk_size)` is computed by the
    /// caller (`entry::EntryLayout::chunks_needed`);
    /// this just allocates that many contiguous chunks.
    pub fn allocate(&self, store: &ByteStore, n_chunks: usize, segment_index: usize) -> Result<usize> {
        let cursor = self.rotating_cursor.get();
        match self.free_bits.allocate(store, n_chunks, cursor) {
            Some(pos) => {
                self.rotating_cursor.set((pos + n_chunks) % self.chunks_per_segment.max(1));
                Ok(pos)
            }
            None => {
                tracing::warn!(segment = segment_index, chunks_needed = n_chunks, "segment full");
                Err(Error::SegmentFull { segment: segment_index, chunks_needed: n_chunks })
            }
        }
    }

    pub fn free(&self, store: &ByteStore, pos: usize, n_chunks: usize) {
        self.free_bits.free(store, pos, n_chunks);
    }

    pub fn free_bits(&self) -> &FreeBits {
        &self.free_bits
    }

    /// Initialize the arena's free-bits for a freshly created segment.
    pub fn init_fresh(&self, store: &ByteStore) {
        self.free_bits.init_all_free(store);
    }
}
