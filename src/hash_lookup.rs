// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-segment open-addressed hash lookup table. Plain fields in a
// shared region, protected by the caller's lock —
// no internal synchronization of its own.
//
// Each slot is one `u64` word packing `(hash_low : h_bits, entry_position
// + 1 : p_bits)`. Slot value `0` means empty — positions are stored as
// `position + 1` so that a live entry at position 0 does not collide
// with the empty sentinel.

use crate::byte_store::ByteStore;

/// Layout and accessors for one segment's hash lookup table. Does not
/// own any memory itself — it's a view over a range of `base_offset
/// .. base_offset + num_slots * 8` inside the segment's `ByteStore`.
#[derive(Debug, Clone, Copy)]
pub struct HashLookup {
    base_offset: usize,
    num_slots: usize,
    /// Bits used for the entry position field (low bits of the slot).
    p_bits: u32,
    /// Bits used for the truncated hash field (high bits of the slot).
    h_bits: u32,
}

/// What `search` found at one probe step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHit {
    pub slot_index: usize,
    pub entry_pos: u32,
}

impl HashLookup {
    /// Number of bytes occupied by a table of `num_slots` slots.
    pub const fn byte_size(num_slots: usize) -> usize {
        num_slots * 8
    }

    /// `p_bits` must satisfy `(1 << p_bits) > chunks_per_segment`, one
    /// bit more than the minimum needed to address every chunk, so that
    /// `position + 1` never overflows the field — see `builder.rs`'s
    /// sizing code, which is the sole caller of `new`.
    pub fn new(base_offset: usize, num_slots: usize, p_bits: u32) -> Self {
        assert!(num_slots.is_power_of_two(), "hash_lookup table size must be a power of two");
        assert!(p_bits < 64, "p_bits must leave room for a hash field");
        let h_bits = 64 - p_bits;
        assert!(
            h_bits >= num_slots.trailing_zeros(),
            "h_bits must cover the table's probe-index bits so backward-shift deletion can \
             recompute an entry's home slot"
        );
        Self { base_offset, num_slots, p_bits, h_bits }
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    fn slot_offset(&self, index: usize) -> usize {
        self.base_offset + index * 8
    }

    fn p_mask(&self) -> u64 {
        (1u64 << self.p_bits) - 1
    }

    fn h_mask(&self) -> u64 {
        if self.h_bits == 64 {
            u64::MAX
        } else {
            (1u64 << self.h_bits) - 1
        }
    }

    fn pack(&self, hash_low: u64, entry_pos: u32) -> u64 {
        let h = hash_low & self.h_mask();
        let p = (entry_pos as u64 + 1) & self.p_mask();
        (h << self.p_bits) | p
    }

    /// Returns `None` for an empty slot.
    fn unpack(&self, slot: u64) -> Option<(u64, u32)> {
        if slot == 0 {
            return None;
        }
        let p = slot & self.p_mask();
        let h = slot >> self.p_bits;
        Some((h, (p - 1) as u32))
    }

    fn get_slot(&self, store: &ByteStore, index: usize) -> u64 {
        store.load_u64_acquire(self.slot_offset(index))
    }

    fn set_slot(&self, store: &ByteStore, index: usize, value: u64) {
        store.store_u64_release(self.slot_offset(index), value);
    }

    fn home_index(&self, segment_hash: u64) -> usize {
        (segment_hash as usize) & (self.num_slots - 1)
    }

    /// Probe for every slot whose hash-low field matches `segment_hash`,
    /// in probe order, stopping at the first truly-empty slot. Also
    /// records the index of that first empty slot so the
    /// caller can insert there via [`HashLookup::put_after_probe`]
    /// without re-scanning.
    pub fn search<'a>(&'a self, store: &'a ByteStore, segment_hash: u64) -> Search<'a> {
        Search {
            lookup: self,
            store,
            hash_low: segment_hash & self.h_mask(),
            index: self.home_index(segment_hash),
            steps: 0,
            first_empty: None,
            done: false,
        }
    }

    /// Insert `entry_pos` at `first_empty_index` (obtained from a prior
    /// [`Search`] that found no match): the caller has already probed,
    /// and this inserts at the first empty slot encountered during that
    /// search.
    pub fn put_after_probe(
        &self,
        store: &ByteStore,
        segment_hash: u64,
        first_empty_index: usize,
        entry_pos: u32,
    ) {
        let slot = self.pack(segment_hash, entry_pos);
        self.set_slot(store, first_empty_index, slot);
    }

    /// Zero every slot. Used by `clear()`, which resets a segment
    /// wholesale rather than removing one key at a time.
    pub fn clear_all(&self, store: &ByteStore) {
        for i in 0..self.num_slots {
            self.set_slot(store, i, 0);
        }
    }

    /// Remove the slot at `slot_index` using backward-shift deletion, so
    /// later probe chains through this slot remain intact.
    pub fn remove(&self, store: &ByteStore, slot_index: usize) {
        let mask = self.num_slots - 1;
        let cyclic_dist = |from: usize, to: usize| (to + self.num_slots - from) % self.num_slots;

        let mut i = slot_index;
        loop {
            let mut j = i;
            loop {
                j = (j + 1) & mask;
                let slot_j = self.get_slot(store, j);
                match self.unpack(slot_j) {
                    None => {
                        // Empty slot reached: clear `i` and we're done.
                        self.set_slot(store, i, 0);
                        return;
                    }
                    Some((hash_low_j, pos_j)) => {
                        let home_j = self.home_index(hash_low_j);
                        // Safe to move j back into i iff i does not lie
                        // strictly between home_j and j in probe order.
                        if cyclic_dist(home_j, i) <= cyclic_dist(home_j, j) {
                            let slot = self.pack(hash_low_j, pos_j);
                            self.set_slot(store, i, slot);
                            i = j;
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Lazy iterator over the slots matching a probed hash, in probe order,
/// stopping at the first truly-empty slot.
pub struct Search<'a> {
    lookup: &'a HashLookup,
    store: &'a ByteStore,
    hash_low: u64,
    index: usize,
    steps: usize,
    first_empty: Option<usize>,
    done: bool,
}

impl<'a> Search<'a> {
    /// Index of the first empty slot encountered, if the whole table
    /// has been exhausted (or a `None` result has been produced). Valid
    /// to call only once the iterator has stopped yielding.
    pub fn first_empty_index(&self) -> Option<usize> {
        self.first_empty
    }
}

impl<'a> Iterator for Search<'a> {
    type Item = ProbeHit;

    fn next(&mut self) -> Option<ProbeHit> {
        if self.done {
            return None;
        }
        loop {
            if self.steps >= self.lookup.num_slots {
                // Probed the entire table without an empty slot — every
                // slot occupied counts as "wrapped"; stop.
                self.done = true;
                return None;
            }
            let slot = self.lookup.get_slot(self.store, self.index);
            let cur = self.index;
            self.index = (self.index + 1) & (self.lookup.num_slots - 1);
            self.steps += 1;

            match self.lookup.unpack(slot) {
                None => {
                    if self.first_empty.is_none() {
                        self.first_empty = Some(cur);
                    }
                    self.done = true;
                    return None;
                }
                Some((hash_low, entry_pos)) => {
                    if hash_low == self.hash_low {
                        return Some(ProbeHit { slot_index: cur, entry_pos });
                    }
                    // keep scanning
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_table(num_slots: usize) -> (ByteStore, HashLookup) {
        let store = ByteStore::anonymous(HashLookup::byte_size(num_slots)).unwrap();
        let p_bits = (num_slots as u64).max(2).next_power_of_two().trailing_zeros() + 1;
        let lookup = HashLookup::new(0, num_slots, p_bits);
        (store, lookup)
    }

    #[test]
    fn insert_and_find() {
        let (mut store, lookup) = new_table(16);
        let h = 42u64;
        let search = lookup.search(&store, h);
        let hits: Vec<_> = search.collect();
        assert!(hits.is_empty());
        let empty_idx = lookup.search(&store, h).first_empty_index().unwrap();
        lookup.put_after_probe(&mut store, h, empty_idx, 7);

        let hits: Vec<_> = lookup.search(&store, h).collect();
        assert_eq!(hits, vec![ProbeHit { slot_index: empty_idx, entry_pos: 7 }]);
    }

    #[test]
    fn collision_forces_linear_probe() {
        let (mut store, lookup) = new_table(8);
        // Two different "hashes" that happen to share the same home
        // index because they agree on the low bits used for homing but
        // differ in the stored hash field.
        let home = 3usize;
        // Construct hash values whose home index is identical.
        let mask_bits = 3; // log2(8)
        let h1 = home as u64;
        let h2 = (1u64 << mask_bits) | home as u64;

        let e1 = lookup.search(&store, h1).first_empty_index().unwrap();
        lookup.put_after_probe(&mut store, h1, e1, 1);
        let e2 = lookup.search(&store, h2).first_empty_index().unwrap();
        assert_ne!(e1, e2, "second insert must probe past the first");
        lookup.put_after_probe(&mut store, h2, e2, 2);

        assert_eq!(lookup.search(&store, h1).collect::<Vec<_>>(), vec![ProbeHit { slot_index: e1, entry_pos: 1 }]);
        assert_eq!(lookup.search(&store, h2).collect::<Vec<_>>(), vec![ProbeHit { slot_index: e2, entry_pos: 2 }]);
    }

    #[test]
    fn remove_preserves_probe_chain() {
        let (mut store, lookup) = new_table(8);
        let mask_bits = 3;
        let home = 2usize;
        let h1 = home as u64;
        let h2 = (1u64 << mask_bits) | home as u64;

        let e1 = lookup.search(&store, h1).first_empty_index().unwrap();
        lookup.put_after_probe(&mut store, h1, e1, 10);
        let e2 = lookup.search(&store, h2).first_empty_index().unwrap();
        lookup.put_after_probe(&mut store, h2, e2, 20);

        lookup.remove(&mut store, e1);

        // h2's entry must still be found even though h1 (which was in
        // its probe path) is gone — backward-shift may relocate it, but
        // it must remain reachable by its own hash.
        let hits: Vec<_> = lookup.search(&store, h2).map(|hit| hit.entry_pos).collect();
        assert_eq!(hits, vec![20]);
    }
}
