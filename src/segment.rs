// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One segment: a `HashLookup` + `Arena`(+`FreeBits`) + `SegmentLock` +
// size counter, combined into `put`/`get`/`remove`/`replace`/
// `contains_key`/`put_if_absent`. Each lock acquisition
// returns a lock-guarded accessor released on `Drop`.
//
// A `Segment` owns no memory; it is a view (offsets + codecs) over a
// range of the map's single `ByteStore`, exactly like `HashLookup` and
// `Arena` are views over their own sub-ranges. The map core
// (`map.rs`) computes a key's hash once and passes the segment-local
// hash down so a segment never needs to know the total segment count.

use std::sync::Arc;
use std::time::Duration;

use crate::arena::Arena;
use crate::byte_store::{ByteStore, ReadCursor, WriteCursor};
use crate::codec::Codec;
use crate::entry::EntryLayout;
use crate::error::Result;
use crate::free_bits::FreeBits;
use crate::hash_lookup::{HashLookup, ProbeHit};
use crate::listener::{ErrorListener, EventListener, MetaBytes};
use crate::lock::SegmentLock;

/// Byte layout of one segment, computed by the builder's sizer
/// and handed to [`Segment::new`]. Offsets are relative to the
/// segment's own base offset in the shared `ByteStore`. Laid out in
/// field order: hash_lookup, free_bits, size_counter, entry_arena,
/// lock_word.
#[derive(Debug, Clone, Copy)]
pub struct SegmentGeometry {
    pub hash_lookup_offset: usize,
    pub free_bits_offset: usize,
    pub size_counter_offset: usize,
    pub arena_offset: usize,
    pub lock_offset: usize,
    pub total_size: usize,
    pub num_slots: usize,
    pub p_bits: u32,
    pub chunks_per_segment: usize,
    pub chunk_size: usize,
}

/// Cache-line stride every segment is padded to, so that a segment's
/// internal u64 words stay 8-aligned no matter which segment index
/// they fall in.
const SEGMENT_ALIGNMENT: usize = 64;

fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) / alignment * alignment
}

impl SegmentGeometry {
    pub fn compute(num_slots: usize, p_bits: u32, chunks_per_segment: usize, chunk_size: usize) -> Self {
        let hash_lookup_offset = 0;
        let free_bits_offset = hash_lookup_offset + HashLookup::byte_size(num_slots);
        let size_counter_offset = free_bits_offset + FreeBits::byte_size(chunks_per_segment);
        let arena_offset = size_counter_offset + 8;
        let lock_offset = arena_offset + chunks_per_segment * chunk_size;
        let total_size = align_up(lock_offset + SegmentLock::BYTE_SIZE, SEGMENT_ALIGNMENT);
        Self {
            hash_lookup_offset,
            free_bits_offset,
            size_counter_offset,
            arena_offset,
            lock_offset,
            total_size,
            num_slots,
            p_bits,
            chunks_per_segment,
            chunk_size,
        }
    }
}

/// One independently-locked partition of the map.
pub struct Segment<K, V> {
    index: usize,
    hash_lookup: HashLookup,
    arena: Arena,
    lock: SegmentLock,
    lock_word_offset: usize,
    size_counter_offset: usize,
    entry_layout: EntryLayout,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    lock_timeout: Duration,
    put_returns_null: bool,
    remove_returns_null: bool,
    listener: Arc<dyn EventListener<K, V>>,
    error_listener: Arc<dyn ErrorListener>,
}

/// The `lock_word` is read/written only through `ByteStore`'s atomic
/// helpers, never through the borrow checker's aliasing rules, so
/// sharing a `Segment` across threads is sound by construction: no
/// two threads observe the same byte range without going through the
/// lock protocol first.
unsafe impl<K, V> Send for Segment<K, V> {}
unsafe impl<K, V> Sync for Segment<K, V> {}

#[allow(clippy::too_many_arguments)]
impl<K, V> Segment<K, V> {
    pub fn new(
        index: usize,
        base_offset: usize,
        geometry: SegmentGeometry,
        meta_data_bytes: usize,
        alignment: usize,
        replicated: bool,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        lock_timeout: Duration,
        put_returns_null: bool,
        remove_returns_null: bool,
        listener: Arc<dyn EventListener<K, V>>,
        error_listener: Arc<dyn ErrorListener>,
    ) -> Self {
        let free_bits = FreeBits::new(base_offset + geometry.free_bits_offset, geometry.chunks_per_segment);
        let hash_lookup = HashLookup::new(base_offset + geometry.hash_lookup_offset, geometry.num_slots, geometry.p_bits);
        let arena = Arena::new(base_offset + geometry.arena_offset, geometry.chunk_size, geometry.chunks_per_segment, free_bits);
        let lock_word_offset = base_offset + geometry.lock_offset;
        let lock = SegmentLock::new(lock_word_offset);
        let entry_layout = EntryLayout::new(meta_data_bytes, alignment, replicated);
        Self {
            index,
            hash_lookup,
            arena,
            lock,
            lock_word_offset,
            size_counter_offset: base_offset + geometry.size_counter_offset,
            entry_layout,
            key_codec,
            value_codec,
            lock_timeout,
            put_returns_null,
            remove_returns_null,
            listener,
            error_listener,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Zero a freshly created segment: all free-bits set free, all
    /// slots and the size counter zero. A reopened map skips this and
    /// trusts what is already on disk.
    pub fn init_fresh(&self, store: &ByteStore) {
        self.arena.init_fresh(store);
        store.store_u64_release(self.size_counter_offset, 0);
        crate::lock::init_unlocked(store, self.lock_word_offset);
    }

    /// Live entry count in this segment. Read without acquiring the
    /// lock, so the result is an eventually-consistent snapshot.
    pub fn len(&self, store: &ByteStore) -> u64 {
        store.load_u64_relaxed(self.size_counter_offset)
    }

    /// Read-locked search with no value materialization.
    pub fn contains_key(&self, store: &ByteStore, segment_hash: u64, key_bytes: &[u8]) -> Result<bool> {
        let _guard = self.acquire_read(store)?;
        Ok(self.find(store, segment_hash, key_bytes).is_some())
    }

    /// `get`: read-lock, search, decode the value on a match.
    /// `key` is the already-decoded key, passed through to the
    /// listener only — matching is done on `key_bytes`.
    pub fn get(&self, store: &ByteStore, segment_hash: u64, key_bytes: &[u8], key: &K) -> Result<Option<V>> {
        let _guard = self.acquire_read(store)?;
        match self.find(store, segment_hash, key_bytes) {
            Some((_, entry_off, key_len)) => {
                let value_off = self.entry_layout.value_offset(key_len);
                let mut cursor = ReadCursor::new(store, entry_off + value_off);
                let value = self.value_codec.read(&mut cursor);
                let meta = self.meta_view(store, entry_off, key_len);
                self.listener.on_get_found(self.index, key, &value, meta);
                Ok(Some(value))
            }
            None => {
                self.listener.on_get_missing(self.index, key);
                Ok(None)
            }
        }
    }

    /// Reusable-read variant of `get`: decodes into `reusable` instead
    /// of allocating a fresh `V`.
    /// Returns whether a match was found.
    pub fn get_into(&self, store: &ByteStore, segment_hash: u64, key_bytes: &[u8], key: &K, reusable: &mut V) -> Result<bool> {
        let _guard = self.acquire_read(store)?;
        match self.find(store, segment_hash, key_bytes) {
            Some((_, entry_off, key_len)) => {
                let value_off = self.entry_layout.value_offset(key_len);
                let mut cursor = ReadCursor::new(store, entry_off + value_off);
                self.value_codec.read_reusing(&mut cursor, reusable);
                let meta = self.meta_view(store, entry_off, key_len);
                self.listener.on_get_found(self.index, key, reusable, meta);
                Ok(true)
            }
            None => {
                self.listener.on_get_missing(self.index, key);
                Ok(false)
            }
        }
    }

    /// `put`: write-lock, search, overwrite in place / relocate / insert.
    pub fn put(&self, store: &ByteStore, segment_hash: u64, key_bytes: &[u8], key: &K, value: &V, return_previous: bool) -> Result<Option<V>> {
        let _guard = self.acquire_write(store)?;
        self.put_locked(store, segment_hash, key, key_bytes, value, return_previous, /*only_if_absent=*/ false)
    }

    /// `putIfAbsent`: on an existing key, returns the current
    /// value without writing.
    pub fn put_if_absent(&self, store: &ByteStore, segment_hash: u64, key_bytes: &[u8], key: &K, value: &V, return_previous: bool) -> Result<Option<V>> {
        let _guard = self.acquire_write(store)?;
        self.put_locked(store, segment_hash, key, key_bytes, value, return_previous, /*only_if_absent=*/ true)
    }

    fn put_locked(
        &self,
        store: &ByteStore,
        segment_hash: u64,
        key: &K,
        key_bytes: &[u8],
        value: &V,
        return_previous: bool,
        only_if_absent: bool,
    ) -> Result<Option<V>> {
        let want_previous = return_previous && !self.put_returns_null;
        match self.find(store, segment_hash, key_bytes) {
            Some((hit, old_off, old_key_len)) => {
                let previous = if want_previous || (only_if_absent && !self.put_returns_null) {
                    let value_off = self.entry_layout.value_offset(old_key_len);
                    let mut cursor = ReadCursor::new(store, old_off + value_off);
                    Some(self.value_codec.read(&mut cursor))
                } else {
                    None
                };
                if only_if_absent {
                    return Ok(previous);
                }
                self.write_match(store, segment_hash, hit, old_off, old_key_len, value);
                let meta = self.meta_view(store, old_off, old_key_len);
                self.listener.on_put(self.index, key, value, meta, false);
                Ok(if want_previous { previous } else { None })
            }
            None => {
                let first_empty = self
                    .hash_lookup
                    .search(store, segment_hash)
                    .first_empty_index()
                    .expect("a segment sized by the builder always has at least one empty slot below its load factor");
                let entry_off = self.insert_new(store, segment_hash, first_empty, key_bytes, value)?;
                let meta = self.meta_view(store, entry_off, key_bytes.len());
                self.listener.on_put(self.index, key, value, meta, true);
                Ok(None)
            }
        }
    }

    /// Overwrite-in-place or relocate an existing entry to hold `value`.
    /// Returns the value field's offset within the
    /// (possibly new) entry, relative to the store.
    fn write_match(&self, store: &ByteStore, segment_hash: u64, hit: ProbeHit, old_off: usize, key_len: usize, value: &V) -> usize {
        let chunk_size = self.arena.chunk_size();
        let old_value_off = self.entry_layout.value_offset(key_len);
        let old_value_len = store.read_u32(old_off + self.entry_layout.value_size_offset(key_len)) as usize;
        let old_chunks = self.entry_layout.chunks_needed(key_len, old_value_len, chunk_size);
        let new_value_len = self.value_codec.encoded_len(value);
        let new_chunks = self.entry_layout.chunks_needed(key_len, new_value_len, chunk_size);

        if new_chunks <= old_chunks {
            // Replacement locality: entry_position in the slot
            // does not change.
            let value_off = old_off + old_value_off;
            let mut cursor = WriteCursor::new(store, value_off);
            self.value_codec.write(&mut cursor, value);
            // value_size published last, after the bytes it describes.
            store.write_u32(old_off + self.entry_layout.value_size_offset(key_len), new_value_len as u32);
            if new_chunks < old_chunks {
                // The tail of the old span is no longer covered by
                // chunks_needed(current value); free it now so
                // remove/snapshot don't later treat it as live.
                let old_pos = hit.entry_pos as usize;
                self.arena.free(store, old_pos + new_chunks, old_chunks - new_chunks);
            }
            old_off + old_value_off
        } else {
            let old_pos = hit.entry_pos as usize;
            let new_pos = self
                .arena
                .allocate(store, new_chunks, self.index)
                .expect("relocation allocation failure is surfaced to the caller before write_match is reached");
            let new_off = self.arena.entry_offset(new_pos);

            store.write_u32(new_off + self.entry_layout.key_size_offset(), key_len as u32);
            let key_bytes = store.read_bytes(old_off + self.entry_layout.key_offset(), key_len).to_vec();
            store.write_bytes(new_off + self.entry_layout.key_offset(), &key_bytes);

            let meta_len = self.entry_layout.meta_data_bytes();
            if meta_len > 0 {
                let old_meta = store.read_bytes(old_off + self.entry_layout.meta_offset(key_len), meta_len).to_vec();
                store.write_bytes(new_off + self.entry_layout.meta_offset(key_len), &old_meta);
            }

            let value_off = new_off + self.entry_layout.value_offset(key_len);
            let mut cursor = WriteCursor::new(store, value_off);
            self.value_codec.write(&mut cursor, value);
            store.write_u32(new_off + self.entry_layout.value_size_offset(key_len), new_value_len as u32);

            // Publish the new position, then free the old span.
            self.hash_lookup.put_after_probe(store, segment_hash, hit.slot_index, new_pos as u32);
            self.arena.free(store, old_pos, old_chunks);
            value_off
        }
    }

    /// Allocates and writes a brand-new entry, publishes its hash_lookup
    /// slot, and bumps the size counter. Returns the entry's absolute
    /// offset (used by the caller to build the `on_put` meta-data
    /// view).
    fn insert_new(&self, store: &ByteStore, segment_hash: u64, first_empty_slot: usize, key_bytes: &[u8], value: &V) -> Result<usize> {
        let key_len = key_bytes.len();
        let value_len = self.value_codec.encoded_len(value);
        let chunks = self.entry_layout.chunks_needed(key_len, value_len, self.arena.chunk_size());
        let pos = self.arena.allocate(store, chunks, self.index)?;
        let off = self.arena.entry_offset(pos);

        store.write_u32(off + self.entry_layout.key_size_offset(), key_len as u32);
        store.write_bytes(off + self.entry_layout.key_offset(), key_bytes);
        let meta_len = self.entry_layout.meta_data_bytes();
        if meta_len > 0 {
            store.write_bytes(off + self.entry_layout.meta_offset(key_len), &vec![0u8; meta_len]);
        }
        let value_off = off + self.entry_layout.value_offset(key_len);
        let mut cursor = WriteCursor::new(store, value_off);
        self.value_codec.write(&mut cursor, value);
        store.write_u32(off + self.entry_layout.value_size_offset(key_len), value_len as u32);

        self.hash_lookup.put_after_probe(store, segment_hash, first_empty_slot, pos as u32);
        store.fetch_add_u64(self.size_counter_offset, 1);
        Ok(off)
    }

    /// `remove`: write-lock, search, optional expected-value check,
    /// clear slot, free span, decrement counter.
    pub fn remove(
        &self,
        store: &ByteStore,
        segment_hash: u64,
        key_bytes: &[u8],
        key: &K,
        expected_value: Option<&V>,
        return_previous: bool,
    ) -> Result<Option<V>>
    where
        V: PartialEq,
    {
        let _guard = self.acquire_write(store)?;
        match self.find(store, segment_hash, key_bytes) {
            Some((hit, off, key_len)) => {
                let value_off = self.entry_layout.value_offset(key_len);
                let mut cursor = ReadCursor::new(store, off + value_off);
                let current = self.value_codec.read(&mut cursor);
                if let Some(expected) = expected_value {
                    if &current != expected {
                        return Ok(None);
                    }
                }
                let value_len = store.read_u32(off + self.entry_layout.value_size_offset(key_len)) as usize;
                let chunks = self.entry_layout.chunks_needed(key_len, value_len, self.arena.chunk_size());
                self.hash_lookup.remove(store, hit.slot_index);
                self.arena.free(store, hit.entry_pos as usize, chunks);
                store.fetch_sub_u64(self.size_counter_offset, 1);
                let meta = self.meta_view(store, off, key_len);
                self.listener.on_remove(self.index, key, &current, meta);
                Ok(if return_previous && !self.remove_returns_null { Some(current) } else { None })
            }
            None => Ok(None),
        }
    }

    /// `replace`: atomic equivalent of get-then-put-if-matches.
    /// A missing key is a no-op; an `old` mismatch is a no-op.
    pub fn replace(&self, store: &ByteStore, segment_hash: u64, key_bytes: &[u8], key: &K, old: Option<&V>, new: &V) -> Result<Option<V>>
    where
        V: PartialEq,
    {
        let _guard = self.acquire_write(store)?;
        match self.find(store, segment_hash, key_bytes) {
            Some((hit, off, key_len)) => {
                let value_off = self.entry_layout.value_offset(key_len);
                let mut cursor = ReadCursor::new(store, off + value_off);
                let current = self.value_codec.read(&mut cursor);
                if let Some(expected) = old {
                    if &current != expected {
                        return Ok(None);
                    }
                }
                self.write_match(store, segment_hash, hit, off, key_len, new);
                let meta = self.meta_view(store, off, key_len);
                self.listener.on_put(self.index, key, new, meta, false);
                Ok(Some(current))
            }
            None => Ok(None),
        }
    }

    /// Eagerly decode every live entry into an owned `Vec` under this
    /// segment's read lock, then release the lock: callers must not
    /// hold segment locks across external calls.
    pub fn snapshot(&self, store: &ByteStore) -> Result<Vec<(K, V)>> {
        let _guard = self.acquire_read(store)?;
        let mut out = Vec::new();
        let chunk_size = self.arena.chunk_size();
        let mut chunk = 0usize;
        while chunk < self.arena.chunks_per_segment() {
            if self.arena.free_bits().is_free(store, chunk) {
                chunk += 1;
                continue;
            }
            let off = self.arena.entry_offset(chunk);
            let key_len = store.read_u32(off + self.entry_layout.key_size_offset()) as usize;
            let mut key_cursor = ReadCursor::new(store, off + self.entry_layout.key_offset());
            let key = self.key_codec.read(&mut key_cursor);
            let value_len = store.read_u32(off + self.entry_layout.value_size_offset(key_len)) as usize;
            let mut value_cursor = ReadCursor::new(store, off + self.entry_layout.value_offset(key_len));
            let value = self.value_codec.read(&mut value_cursor);
            out.push((key, value));
            chunk += self.entry_layout.chunks_needed(key_len, value_len, chunk_size).max(1);
        }
        Ok(out)
    }

    /// Reset this segment to empty: every free-bit set free, every slot
    /// zero, size counter zero. Caller (`map.rs::clear`) already holds
    /// this segment's write lock when calling this.
    pub fn clear_locked(&self, store: &ByteStore) {
        self.hash_lookup.clear_all(store);
        self.arena.free_bits().init_all_free(store);
        store.store_u64_release(self.size_counter_offset, 0);
    }

    pub fn acquire_write<'a>(&self, store: &'a ByteStore) -> Result<crate::lock::WriteGuard<'a>> {
        match self.lock.write(store, self.index, self.lock_timeout) {
            Ok(guard) => Ok(guard),
            Err(e) => {
                self.error_listener.on_lock_timeout(self.index);
                Err(e)
            }
        }
    }

    pub fn acquire_read<'a>(&self, store: &'a ByteStore) -> Result<crate::lock::ReadGuard<'a>> {
        match self.lock.read(store, self.index, self.lock_timeout) {
            Ok(guard) => Ok(guard),
            Err(e) => {
                self.error_listener.on_lock_timeout(self.index);
                Err(e)
            }
        }
    }

    /// Search for `key_bytes`, returning the probe hit plus the
    /// matching entry's absolute offset and key length. First match
    /// wins on hash collisions.
    fn find(&self, store: &ByteStore, segment_hash: u64, key_bytes: &[u8]) -> Option<(ProbeHit, usize, usize)> {
        for hit in self.hash_lookup.search(store, segment_hash) {
            let off = self.arena.entry_offset(hit.entry_pos as usize);
            let stored_key_len = store.read_u32(off + self.entry_layout.key_size_offset()) as usize;
            if stored_key_len != key_bytes.len() {
                continue;
            }
            let stored_key = store.read_bytes(off + self.entry_layout.key_offset(), stored_key_len);
            if stored_key == key_bytes {
                return Some((hit, off, stored_key_len));
            }
        }
        None
    }

    fn meta_view<'a>(&self, store: &'a ByteStore, entry_off: usize, key_len: usize) -> MetaBytes<'a> {
        let len = self.entry_layout.meta_data_bytes();
        MetaBytes::new(store, entry_off + self.entry_layout.meta_offset(key_len), len)
    }

    /// Reads the `(identifier, timestamp, is_deleted)` prefix of the
    /// entry at `entry_off`, or `None` for a non-replicated segment.
    pub(crate) fn read_replication_prefix(&self, store: &ByteStore, entry_off: usize) -> Option<(u8, u64, bool)> {
        if self.entry_layout.prefix_len() == 0 {
            return None;
        }
        let identifier = store.read_u8(entry_off + self.entry_layout.replication_identifier_offset());
        let timestamp = store.read_u64(entry_off + self.entry_layout.replication_timestamp_offset());
        let is_deleted = store.read_u8(entry_off + self.entry_layout.replication_deleted_offset()) != 0;
        Some((identifier, timestamp, is_deleted))
    }

    pub(crate) fn write_replication_prefix(&self, store: &ByteStore, entry_off: usize, identifier: u8, timestamp: u64, is_deleted: bool) {
        if self.entry_layout.prefix_len() == 0 {
            return;
        }
        store.write_u8(entry_off + self.entry_layout.replication_identifier_offset(), identifier);
        store.write_u64(entry_off + self.entry_layout.replication_timestamp_offset(), timestamp);
        store.write_u8(entry_off + self.entry_layout.replication_deleted_offset(), is_deleted as u8);
    }

    /// Current `(identifier, timestamp, is_deleted)` for `key_bytes`, if
    /// present, read under this segment's read lock.
    pub fn replication_status(&self, store: &ByteStore, segment_hash: u64, key_bytes: &[u8]) -> Result<Option<(u8, u64, bool)>> {
        let _guard = self.acquire_read(store)?;
        Ok(self
            .find(store, segment_hash, key_bytes)
            .and_then(|(_, off, _)| self.read_replication_prefix(store, off)))
    }

    /// Applies a replicated write: ignored if `timestamp` is older than
    /// what's already stored for this key (last-writer-wins), otherwise
    /// behaves like `put` and stamps the winning
    /// entry's replication prefix. Returns whether the write was
    /// applied.
    pub fn put_replicated(
        &self,
        store: &ByteStore,
        segment_hash: u64,
        key_bytes: &[u8],
        key: &K,
        value: &V,
        identifier: u8,
        timestamp: u64,
    ) -> Result<bool> {
        let _guard = self.acquire_write(store)?;
        if let Some((_, off, _)) = self.find(store, segment_hash, key_bytes) {
            if let Some((_, existing_ts, _)) = self.read_replication_prefix(store, off) {
                if timestamp < existing_ts {
                    return Ok(false);
                }
            }
        }
        self.put_locked(store, segment_hash, key, key_bytes, value, false, false)?;
        if let Some((_, off, _)) = self.find(store, segment_hash, key_bytes) {
            self.write_replication_prefix(store, off, identifier, timestamp, false);
        }
        Ok(true)
    }

    /// Applies a replicated remove as a tombstone (`is_deleted = 1`)
    /// rather than actually freeing the entry's span, so a
    /// late-arriving older write can still be recognized as stale;
    /// the entry remains until compacted.
    pub fn remove_replicated(
        &self,
        store: &ByteStore,
        segment_hash: u64,
        key_bytes: &[u8],
        identifier: u8,
        timestamp: u64,
    ) -> Result<bool> {
        let _guard = self.acquire_write(store)?;
        match self.find(store, segment_hash, key_bytes) {
            Some((_, off, _)) => {
                if let Some((_, existing_ts, _)) = self.read_replication_prefix(store, off) {
                    if timestamp < existing_ts {
                        return Ok(false);
                    }
                }
                self.write_replication_prefix(store, off, identifier, timestamp, true);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
