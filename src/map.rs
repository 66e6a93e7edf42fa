// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The map core: owns the single `ByteStore`, the validated `MapHeader`,
// and one `Segment` per partition. A key is encoded to bytes exactly
// once per operation, here, then routed by
// `hash::segment_index`/`hash::segment_hash` to the owning segment —
// segments never re-encode a key and never need to know the total
// segment count, since a slot's hash field is `hash64(key) >>
// log2(segment_count)`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::byte_store::ByteStore;
use crate::codec::{self, Codec};
use crate::error::Result;
use crate::hash;
use crate::header::MapHeader;
use crate::segment::Segment;

/// An embeddable, off-heap, optionally persistent concurrent hash map.
/// Construct via [`crate::builder::MapBuilder`].
pub struct Map<K, V> {
    store: ByteStore,
    header: MapHeader,
    segments: Vec<Segment<K, V>>,
    key_codec: Arc<dyn Codec<K>>,
    #[allow(dead_code)]
    value_codec: Arc<dyn Codec<V>>,
    path: Option<PathBuf>,
}

impl<K, V> Map<K, V> {
    pub(crate) fn from_parts(
        store: ByteStore,
        header: MapHeader,
        segments: Vec<Segment<K, V>>,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        path: Option<PathBuf>,
    ) -> Self {
        Self { store, header, segments, key_codec, value_codec, path }
    }

    pub fn header(&self) -> &MapHeader {
        &self.header
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Live entry count of one segment, read without acquiring its lock
    /// (the same eventually-consistent snapshot `len()` sums across all
    /// segments). Exposed so callers can verify key distribution across
    /// segments.
    pub fn segment_len(&self, index: usize) -> u64 {
        self.segments[index].len(&self.store)
    }

    pub fn is_file_backed(&self) -> bool {
        self.store.is_file_backed()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn store(&self) -> &ByteStore {
        &self.store
    }

    pub(crate) fn segment(&self, index: usize) -> &Segment<K, V> {
        &self.segments[index]
    }

    pub(crate) fn route(&self, key: &K) -> (usize, u64, Vec<u8>) {
        let key_bytes = codec::encode(self.key_codec.as_ref(), key);
        let idx = hash::segment_index(&key_bytes, self.segments.len());
        let seg_hash = hash::segment_hash(&key_bytes, self.segments.len());
        (idx, seg_hash, key_bytes)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let (idx, seg_hash, key_bytes) = self.route(key);
        self.segments[idx].contains_key(&self.store, seg_hash, &key_bytes)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let (idx, seg_hash, key_bytes) = self.route(key);
        self.segments[idx].get(&self.store, seg_hash, &key_bytes, key)
    }

    /// Decodes into `reusable` instead of allocating a fresh `V`.
    /// Returns whether a match was found.
    pub fn get_into(&self, key: &K, reusable: &mut V) -> Result<bool> {
        let (idx, seg_hash, key_bytes) = self.route(key);
        self.segments[idx].get_into(&self.store, seg_hash, &key_bytes, key, reusable)
    }

    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let (idx, seg_hash, key_bytes) = self.route(&key);
        self.segments[idx].put(&self.store, seg_hash, &key_bytes, &key, &value, true)
    }

    /// Like `put`, but skips decoding the previous value when one
    /// exists — cheaper when the caller doesn't need it (the builder's
    /// `put_returns_null` option makes this the default behavior of
    /// `put` itself).
    pub fn put_ignoring_previous(&self, key: K, value: V) -> Result<()> {
        let (idx, seg_hash, key_bytes) = self.route(&key);
        self.segments[idx].put(&self.store, seg_hash, &key_bytes, &key, &value, false)?;
        Ok(())
    }

    pub fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        let (idx, seg_hash, key_bytes) = self.route(&key);
        self.segments[idx].put_if_absent(&self.store, seg_hash, &key_bytes, &key, &value, true)
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>>
    where
        V: PartialEq,
    {
        let (idx, seg_hash, key_bytes) = self.route(key);
        self.segments[idx].remove(&self.store, seg_hash, &key_bytes, key, None, true)
    }

    /// Removes `key` only if its current value equals `expected`.
    pub fn remove_if_matches(&self, key: &K, expected: &V) -> Result<Option<V>>
    where
        V: PartialEq,
    {
        let (idx, seg_hash, key_bytes) = self.route(key);
        self.segments[idx].remove(&self.store, seg_hash, &key_bytes, key, Some(expected), true)
    }

    /// Atomic get-then-put-if-matches. `old = None` matches any current
    /// value.
    pub fn replace(&self, key: &K, old: Option<&V>, new: V) -> Result<Option<V>>
    where
        V: PartialEq,
    {
        let (idx, seg_hash, key_bytes) = self.route(key);
        self.segments[idx].replace(&self.store, seg_hash, &key_bytes, key, old, &new)
    }

    /// Eventually-consistent total size: sum of each segment's counter,
    /// read without acquiring any lock.
    pub fn len(&self) -> u64 {
        self.segments.iter().map(|s| s.len(&self.store)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resets every segment to empty. Acquires every segment's write
    /// lock in index order, then releases in reverse, so a concurrent
    /// `clear` never deadlocks against itself or another full-map
    /// operation that also locks in index order.
    pub fn clear(&self) -> Result<()> {
        let mut guards = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            guards.push(segment.acquire_write(&self.store)?);
        }
        for segment in &self.segments {
            segment.clear_locked(&self.store);
        }
        while let Some(guard) = guards.pop() {
            drop(guard);
        }
        Ok(())
    }

    /// Weakly consistent snapshot of every live entry: segments are
    /// visited one at a time, each decoded eagerly under
    /// its own read lock, never holding more than one segment's lock at
    /// once.
    pub fn iter(&self) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        for segment in &self.segments {
            out.extend(segment.snapshot(&self.store)?);
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush_all()?;
        Ok(())
    }
}

impl<K, V> Drop for Map<K, V> {
    fn drop(&mut self) {
        if self.store.is_file_backed() {
            if let Err(err) = self.store.flush_all() {
                tracing::warn!(error = %err, "failed to flush map on drop");
            }
        }
    }
}
