// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Event and error listener interfaces. Pure external
// collaborators: the core calls these while a segment lock is held and
// never re-enters the map from inside a callback ("listeners must not
// re-enter the map").

use crate::byte_store::ByteStore;

/// A view over one entry's reserved, listener-writable meta-data
/// bytes. Valid only for the duration of the callback that receives
/// it.
pub struct MetaBytes<'a> {
    store: &'a ByteStore,
    offset: usize,
    len: usize,
}

impl<'a> MetaBytes<'a> {
    pub(crate) fn new(store: &'a ByteStore, offset: usize, len: usize) -> Self {
        Self { store, offset, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read(&self) -> &[u8] {
        self.store.read_bytes(self.offset, self.len)
    }

    pub fn write(&self, bytes: &[u8]) {
        assert_eq!(bytes.len(), self.len, "meta-data write must match the configured meta_data_bytes length");
        self.store.write_bytes(self.offset, bytes);
    }
}

/// Observability hook invoked, under the segment's lock, around
/// `put`/`get`/`remove`. Every method has an empty default so
/// a listener can implement only what it needs.
pub trait EventListener<K, V>: Send + Sync {
    /// Called after a `put` has fully written its entry and published
    /// the hash-lookup slot. `added` is `true` for a fresh key, `false`
    /// for an in-place replace or relocation.
    fn on_put(&self, segment: usize, key: &K, value: &V, meta: MetaBytes<'_>, added: bool) {
        let _ = (segment, key, value, meta, added);
    }

    /// Called after a `get` finds a matching entry.
    fn on_get_found(&self, segment: usize, key: &K, value: &V, meta: MetaBytes<'_>) {
        let _ = (segment, key, value, meta);
    }

    /// Called after a `get` finds no matching entry.
    fn on_get_missing(&self, segment: usize, key: &K) {
        let _ = (segment, key);
    }

    /// Called after a `remove` has cleared the slot and freed the span.
    fn on_remove(&self, segment: usize, key: &K, value: &V, meta: MetaBytes<'_>) {
        let _ = (segment, key, value, meta);
    }
}

/// Observability hook for lock-acquisition failures.
pub trait ErrorListener: Send + Sync {
    /// Called when a segment's lock could not be acquired within its
    /// configured `lock_time_out`, just before `Error::LockTimeout` is
    /// returned to the caller.
    fn on_lock_timeout(&self, segment_index: usize) {
        let _ = segment_index;
    }
}

/// A no-op `EventListener`/`ErrorListener`, used when the caller does
/// not register one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl<K, V> EventListener<K, V> for NoopListener {}
impl ErrorListener for NoopListener {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingListener {
        puts: AtomicU64,
        gets_found: AtomicU64,
        gets_missing: AtomicU64,
        removes: AtomicU64,
    }

    impl EventListener<String, String> for CountingListener {
        fn on_put(&self, _segment: usize, _key: &String, _value: &String, meta: MetaBytes<'_>, _added: bool) {
            self.puts.fetch_add(1, Ordering::Relaxed);
            if !meta.is_empty() {
                let mut counter = [0u8; 8];
                counter.copy_from_slice(meta.read());
                let n = u64::from_le_bytes(counter) + 1;
                meta.write(&n.to_le_bytes());
            }
        }

        fn on_get_found(&self, _segment: usize, _key: &String, _value: &String, _meta: MetaBytes<'_>) {
            self.gets_found.fetch_add(1, Ordering::Relaxed);
        }

        fn on_get_missing(&self, _segment: usize, _key: &String) {
            self.gets_missing.fetch_add(1, Ordering::Relaxed);
        }

        fn on_remove(&self, _segment: usize, _key: &String, _value: &String, _meta: MetaBytes<'_>) {
            self.removes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn meta_bytes_round_trip_through_store() {
        let store = ByteStore::anonymous(8).unwrap();
        store.write_bytes(0, &0u64.to_le_bytes());
        let listener = CountingListener {
            puts: AtomicU64::new(0),
            gets_found: AtomicU64::new(0),
            gets_missing: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        };
        let key = "k".to_string();
        let value = "v".to_string();
        for _ in 0..4 {
            let meta = MetaBytes::new(&store, 0, 8);
            listener.on_put(0, &key, &value, meta, true);
        }
        assert_eq!(listener.puts.load(Ordering::Relaxed), 4);
        assert_eq!(u64::from_le_bytes(store.read_bytes(0, 8).try_into().unwrap()), 4);
    }
}
