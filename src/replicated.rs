// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Replicated variant: adds a per-entry
// `(identifier, timestamp, is_deleted)` prefix — already modeled by
// `entry.rs`'s `EntryLayout` and written/read via the small helpers
// added to `segment.rs` — plus a per-segment modification counter and
// a registry of external modification listeners. The wire protocol
// itself (`Replicator`) is a pure interface: the core never interprets
// what a registered transport does with a `ModificationRecord`.
//
// `Subscription` releases its registration on `Drop`, the same
// scoped-resource idiom used elsewhere in this crate for lock guards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::map::Map;

/// Source of timestamps for replicated writes.
pub trait TimeProvider: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall-clock time provider used unless the caller supplies its own
/// (e.g. a logical clock, for deterministic tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis() as u64
    }
}

/// One observed mutation, handed to every registered
/// [`ModificationListener`]. Carries the key's already-encoded bytes
/// rather than a typed key, since a transport disseminates raw bytes
/// over the wire.
#[derive(Debug, Clone)]
pub struct ModificationRecord {
    pub segment: usize,
    pub key_bytes: Vec<u8>,
    pub identifier: u8,
    pub timestamp: u64,
    pub is_deleted: bool,
}

/// Observes one segment's modification stream. A `Replicator`
/// registers one (or more) of these against a [`ReplicatedMap`] and
/// disseminates what it receives; the core has no further opinion.
pub trait ModificationListener: Send + Sync {
    fn on_modification(&self, record: &ModificationRecord);
}

/// External transport that observes per-segment modifications; the map
/// never interprets the wire protocol itself.
pub trait Replicator<K, V>: Send + Sync {
    /// The replication identifier this transport advertises. Every
    /// replicator registered against one map must advertise the same
    /// identifier as the map itself; a mismatch is rejected before any
    /// replicator is applied (spec §4.7: "all must advertise the same
    /// identifier").
    fn identifier(&self) -> u8;

    /// Registers this replicator against `map`, returning the
    /// resulting subscriptions. Dropping a [`Subscription`]
    /// deregisters it; `ReplicatedMap` drops all of them when it is
    /// dropped.
    fn apply_to(&self, map: &ReplicatedMap<K, V>) -> Vec<Subscription>;

    /// Whether this transport only makes a best effort at delivery
    /// (e.g. a UDP-style fan-out) rather than guaranteeing it.
    fn is_best_effort(&self) -> bool {
        false
    }
}

struct Registry {
    counters: Vec<AtomicU64>,
    listeners: Vec<Mutex<Vec<(u64, Arc<dyn ModificationListener>)>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn new(segment_count: usize) -> Self {
        Self {
            counters: (0..segment_count).map(|_| AtomicU64::new(0)).collect(),
            listeners: (0..segment_count).map(|_| Mutex::new(Vec::new())).collect(),
            next_id: AtomicU64::new(1),
        }
    }

    fn notify(&self, segment: usize, record: &ModificationRecord) {
        self.counters[segment].fetch_add(1, Ordering::Relaxed);
        let listeners = self.listeners[segment].lock().expect("modification listener registry poisoned");
        for (_, listener) in listeners.iter() {
            listener.on_modification(record);
        }
    }

    fn modification_count(&self, segment: usize) -> u64 {
        self.counters[segment].load(Ordering::Relaxed)
    }

    fn register(self: &Arc<Self>, segment: usize, listener: Arc<dyn ModificationListener>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners[segment]
            .lock()
            .expect("modification listener registry poisoned")
            .push((id, listener));
        Subscription { registry: Arc::downgrade(self), segment, id }
    }
}

/// A scoped handle to one registered [`ModificationListener`]:
/// deregisters automatically when dropped.
pub struct Subscription {
    registry: Weak<Registry>,
    segment: usize,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut listeners = registry.listeners[self.segment].lock().expect("modification listener registry poisoned");
            listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Whether an incoming replicated write should be applied over what's
/// already stored, per last-writer-wins: a write strictly older than
/// the stored timestamp is dropped; a tie or a fresher write wins.
pub fn accept_incoming(existing_timestamp: Option<u64>, incoming_timestamp: u64) -> bool {
    match existing_timestamp {
        Some(existing) => incoming_timestamp >= existing,
        None => true,
    }
}

/// Wraps a [`Map`] with the replicated variant's identifier, clock, and
/// modification-listener registry.
pub struct ReplicatedMap<K, V> {
    map: Map<K, V>,
    identifier: u8,
    time_provider: Arc<dyn TimeProvider>,
    registry: Arc<Registry>,
}

impl<K, V> ReplicatedMap<K, V> {
    pub fn new(map: Map<K, V>, identifier: u8) -> Self {
        Self::with_time_provider(map, identifier, Arc::new(SystemTimeProvider))
    }

    pub fn with_time_provider(map: Map<K, V>, identifier: u8, time_provider: Arc<dyn TimeProvider>) -> Self {
        let registry = Arc::new(Registry::new(map.segment_count()));
        Self { map, identifier, time_provider, registry }
    }

    pub fn map(&self) -> &Map<K, V> {
        &self.map
    }

    pub fn identifier(&self) -> u8 {
        self.identifier
    }

    pub fn modification_count(&self, segment: usize) -> u64 {
        self.registry.modification_count(segment)
    }

    /// Registers `listener` against every segment's modification
    /// stream, since a replicator typically mirrors the whole map
    /// rather than one partition of it.
    pub fn register(&self, listener: Arc<dyn ModificationListener>) -> Vec<Subscription> {
        (0..self.map.segment_count())
            .map(|segment| self.registry.register(segment, listener.clone()))
            .collect()
    }

    /// Registers every configured replicator, warning if exactly one is
    /// registered and it is best-effort; that case is safer paired with
    /// a guaranteed-delivery transport.
    ///
    /// Rejects with `Error::IllegalArgument` if any replicator
    /// advertises an identifier other than this map's own, before any
    /// replicator is applied.
    pub fn apply_replicators(&self, replicators: &[Arc<dyn Replicator<K, V>>]) -> Result<Vec<Subscription>> {
        if let Some(mismatched) = replicators.iter().find(|r| r.identifier() != self.identifier) {
            return Err(crate::error::Error::IllegalArgument(format!(
                "replicator identifier {} does not match map identifier {}",
                mismatched.identifier(),
                self.identifier
            )));
        }
        if replicators.len() == 1 && replicators[0].is_best_effort() {
            tracing::warn!(
                "a single best-effort replicator is registered; pair it with a guaranteed-delivery \
                 transport or writes may be silently lost"
            );
        }
        Ok(replicators.iter().flat_map(|r| r.apply_to(self)).collect())
    }

    /// Applies a locally-originated put, stamped with this map's own
    /// identifier and the current time.
    pub fn put(&self, key: K, value: V) -> Result<bool> {
        let timestamp = self.time_provider.now_millis();
        self.apply_put(key, value, self.identifier, timestamp)
    }

    /// Applies a write that arrived from a remote replica; ignored if
    /// stale relative to what is already stored.
    pub fn apply_remote_put(&self, key: K, value: V, identifier: u8, timestamp: u64) -> Result<bool> {
        self.apply_put(key, value, identifier, timestamp)
    }

    fn apply_put(&self, key: K, value: V, identifier: u8, timestamp: u64) -> Result<bool> {
        let (idx, seg_hash, key_bytes) = self.map.route(&key);
        let accepted =
            self.map
                .segment(idx)
                .put_replicated(self.map.store(), seg_hash, &key_bytes, &key, &value, identifier, timestamp)?;
        if accepted {
            self.registry.notify(
                idx,
                &ModificationRecord { segment: idx, key_bytes, identifier, timestamp, is_deleted: false },
            );
        }
        Ok(accepted)
    }

    /// Tombstones `key` locally, stamped with this map's own identifier
    /// and the current time.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let timestamp = self.time_provider.now_millis();
        self.apply_remove(key, self.identifier, timestamp)
    }

    /// Applies a tombstone that arrived from a remote replica.
    pub fn apply_remote_remove(&self, key: &K, identifier: u8, timestamp: u64) -> Result<bool> {
        self.apply_remove(key, identifier, timestamp)
    }

    fn apply_remove(&self, key: &K, identifier: u8, timestamp: u64) -> Result<bool> {
        let (idx, seg_hash, key_bytes) = self.map.route(key);
        let accepted = self.map.segment(idx).remove_replicated(self.map.store(), seg_hash, &key_bytes, identifier, timestamp)?;
        if accepted {
            self.registry.notify(
                idx,
                &ModificationRecord { segment: idx, key_bytes, identifier, timestamp, is_deleted: true },
            );
        }
        Ok(accepted)
    }

    /// Reads `key`'s current value, treating a tombstoned entry as
    /// absent even though its span has not yet been compacted away.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let (idx, seg_hash, key_bytes) = self.map.route(key);
        match self.map.segment(idx).replication_status(self.map.store(), seg_hash, &key_bytes)? {
            Some((_, _, true)) => Ok(None),
            _ => self.map.get(key),
        }
    }

    /// Current `(identifier, timestamp, is_deleted)` for `key`, if it
    /// has ever been written.
    pub fn replication_status(&self, key: &K) -> Result<Option<(u8, u64, bool)>> {
        let (idx, seg_hash, key_bytes) = self.map.route(key);
        self.map.segment(idx).replication_status(self.map.store(), seg_hash, &key_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MapBuilder;
    use crate::codec::Utf8Codec;
    use std::sync::atomic::AtomicUsize;

    fn replicated_map(identifier: u8) -> ReplicatedMap<String, String> {
        let map = MapBuilder::new()
            .entries(256)
            .entry_size(32)
            .actual_segments(4)
            .replicated(identifier)
            .key_codec(Arc::new(Utf8Codec))
            .value_codec(Arc::new(Utf8Codec))
            .create_anonymous()
            .unwrap();
        ReplicatedMap::new(map, identifier)
    }

    #[test]
    fn last_writer_wins_rejects_strictly_older() {
        assert!(!accept_incoming(Some(100), 50));
        assert!(accept_incoming(Some(100), 100));
        assert!(accept_incoming(Some(100), 150));
        assert!(accept_incoming(None, 1));
    }

    #[test]
    fn local_put_then_get_round_trips() {
        let map = replicated_map(1);
        assert!(map.put("a".to_string(), "1".to_string()).unwrap());
        assert_eq!(map.get(&"a".to_string()).unwrap(), Some("1".to_string()));
    }

    #[test]
    fn stale_remote_write_is_rejected() {
        let map = replicated_map(1);
        map.apply_remote_put("a".to_string(), "fresh".to_string(), 2, 1000).unwrap();
        let applied = map.apply_remote_put("a".to_string(), "stale".to_string(), 3, 500).unwrap();
        assert!(!applied);
        assert_eq!(map.get(&"a".to_string()).unwrap(), Some("fresh".to_string()));
    }

    #[test]
    fn remote_remove_tombstones_without_freeing() {
        let map = replicated_map(1);
        map.apply_remote_put("a".to_string(), "1".to_string(), 1, 100).unwrap();
        assert!(map.apply_remote_remove(&"a".to_string(), 1, 200).unwrap());
        assert_eq!(map.get(&"a".to_string()).unwrap(), None);
        let status = map.replication_status(&"a".to_string()).unwrap().unwrap();
        assert!(status.2, "tombstone flag should be set");
    }

    #[test]
    fn subscription_drop_deregisters_listener() {
        struct Counter(AtomicUsize);
        impl ModificationListener for Counter {
            fn on_modification(&self, _record: &ModificationRecord) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let map = replicated_map(1);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let subscriptions = map.register(counter.clone());
        map.put("a".to_string(), "1".to_string()).unwrap();
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);

        drop(subscriptions);
        map.put("b".to_string(), "2".to_string()).unwrap();
        assert_eq!(counter.0.load(Ordering::Relaxed), 1, "no further notifications after dropping the subscription");
    }

    #[test]
    fn modification_counter_advances_per_segment() {
        let map = replicated_map(1);
        map.put("a".to_string(), "1".to_string()).unwrap();
        let (idx, _, _) = map.map().route(&"a".to_string());
        assert_eq!(map.modification_count(idx), 1);
    }

    struct StubReplicator {
        id: u8,
    }

    impl Replicator<String, String> for StubReplicator {
        fn identifier(&self) -> u8 {
            self.id
        }

        fn apply_to(&self, _map: &ReplicatedMap<String, String>) -> Vec<Subscription> {
            Vec::new()
        }
    }

    #[test]
    fn apply_replicators_rejects_mismatched_identifier() {
        let map = replicated_map(1);
        let replicators: Vec<Arc<dyn Replicator<String, String>>> = vec![Arc::new(StubReplicator { id: 2 })];
        let err = map.apply_replicators(&replicators).unwrap_err();
        assert!(matches!(err, crate::error::Error::IllegalArgument(_)));
    }

    #[test]
    fn apply_replicators_accepts_matching_identifier() {
        let map = replicated_map(1);
        let replicators: Vec<Arc<dyn Replicator<String, String>>> = vec![Arc::new(StubReplicator { id: 1 })];
        assert!(map.apply_replicators(&replicators).unwrap().is_empty());
    }
}
