// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end scenarios exercised through the public `Map`/`MapBuilder`
// API only (no crate-internal access), covering the map's externally
// observable behavior: basic round-trips, metadata listeners, segment
// routing distribution, and file-backed reopen.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use offheap_map::{Alignment, EventListener, MapBuilder, MetaBytes};

fn string_map(entries: u64, segments: u32) -> offheap_map::Map<String, String> {
    MapBuilder::new()
        .entries(entries)
        .entry_size(64)
        .actual_segments(segments)
        .key_codec(Arc::new(offheap_map::Utf8Codec))
        .value_codec(Arc::new(offheap_map::Utf8Codec))
        .create_anonymous()
        .unwrap()
}

#[test]
fn basic_round_trip_four_entries() {
    let map = string_map(1024, 4);
    map.put("a".to_string(), "aye".to_string()).unwrap();
    map.put("b".to_string(), "bee".to_string()).unwrap();
    map.put("c".to_string(), "see".to_string()).unwrap();
    map.put("d".to_string(), "dee".to_string()).unwrap();

    assert_eq!(map.get(&"a".to_string()).unwrap(), Some("aye".to_string()));
    assert_eq!(map.get(&"b".to_string()).unwrap(), Some("bee".to_string()));
    assert_eq!(map.get(&"c".to_string()).unwrap(), Some("see".to_string()));
    assert_eq!(map.get(&"d".to_string()).unwrap(), Some("dee".to_string()));

    assert_eq!(map.remove(&"a".to_string()).unwrap(), Some("aye".to_string()));
    assert_eq!(map.remove(&"b".to_string()).unwrap(), Some("bee".to_string()));
    assert_eq!(map.remove(&"c".to_string()).unwrap(), Some("see".to_string()));
    assert_eq!(map.remove(&"d".to_string()).unwrap(), Some("dee".to_string()));
    assert_eq!(map.len(), 0);
}

#[test]
fn in_place_replace_keeps_entry_position() {
    // The same chunk-span replacement scenario is
    // verified below at `map.len()` granularity only; `segment.rs`'s
    // own tests check `entry_position` directly since that detail
    // isn't part of `Map`'s public surface.
    let map = MapBuilder::new()
        .entries(256)
        .entry_size(64)
        .alignment(Alignment::Four)
        .actual_segments(1)
        .key_codec(Arc::new(offheap_map::Utf8Codec))
        .value_codec(Arc::new(offheap_map::Utf8Codec))
        .create_anonymous()
        .unwrap();

    map.put("k".to_string(), "x".repeat(16)).unwrap();
    map.put("k".to_string(), "y".repeat(16)).unwrap();
    assert_eq!(map.get(&"k".to_string()).unwrap(), Some("y".repeat(16)));
    assert_eq!(map.len(), 1);
}

#[test]
fn relocation_on_grow_preserves_value() {
    let map = MapBuilder::new()
        .entries(256)
        .entry_size(64)
        .alignment(Alignment::Four)
        .actual_segments(1)
        .key_codec(Arc::new(offheap_map::Utf8Codec))
        .value_codec(Arc::new(offheap_map::Utf8Codec))
        .create_anonymous()
        .unwrap();

    map.put("k".to_string(), "x".repeat(16)).unwrap();
    map.put("k".to_string(), "x".repeat(80)).unwrap();
    assert_eq!(map.get(&"k".to_string()).unwrap(), Some("x".repeat(80)));
    assert_eq!(map.len(), 1);
}

#[test]
fn meta_data_listener_counts_puts_and_gets() {
    struct CountingListener(AtomicU64);

    impl EventListener<String, String> for CountingListener {
        fn on_put(&self, _segment: usize, _key: &String, _value: &String, meta: MetaBytes<'_>, _added: bool) {
            self.0.fetch_add(1, Ordering::Relaxed);
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(meta.read());
            let next = u64::from_le_bytes(bytes) + 1;
            meta.write(&next.to_le_bytes());
        }

        fn on_get_found(&self, _segment: usize, _key: &String, _value: &String, _meta: MetaBytes<'_>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let listener = Arc::new(CountingListener(AtomicU64::new(0)));
    let map: offheap_map::Map<String, String> = MapBuilder::new()
        .entries(256)
        .entry_size(64)
        .meta_data_bytes(8)
        .actual_segments(1)
        .key_codec(Arc::new(offheap_map::Utf8Codec))
        .value_codec(Arc::new(offheap_map::Utf8Codec))
        .event_listener(listener.clone())
        .create_anonymous()
        .unwrap();

    for i in 0..4 {
        map.put(format!("k{i}"), format!("v{i}")).unwrap();
    }
    for i in 0..4 {
        map.get(&format!("k{i}")).unwrap();
    }

    assert_eq!(listener.0.load(Ordering::Relaxed), 8);
}

#[test]
fn segment_routing_spreads_keys_within_tolerance() {
    let map = string_map(20_000, 4);
    for i in 0..10_000 {
        map.put(format!("key-{i}"), format!("value-{i}")).unwrap();
    }
    assert_eq!(map.len(), 10_000);

    let expected = 2_500.0;
    for segment in 0..map.segment_count() {
        let count = map.segment_len(segment) as f64;
        let deviation = (count - expected).abs() / expected;
        assert!(
            deviation <= 0.10,
            "segment {segment} has {count} entries, more than 10% away from the expected {expected}"
        );
    }
}

#[test]
fn file_backed_map_reopens_with_all_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reopen.bin");

    {
        let map: offheap_map::Map<String, String> = MapBuilder::new()
            .entries(2048)
            .entry_size(64)
            .actual_segments(8)
            .key_codec(Arc::new(offheap_map::Utf8Codec))
            .value_codec(Arc::new(offheap_map::Utf8Codec))
            .create_or_open(&path)
            .unwrap();
        for i in 0..1000 {
            map.put(format!("k{i}"), format!("v{i}")).unwrap();
        }
        map.flush().unwrap();
    }

    let reopened: offheap_map::Map<String, String> = MapBuilder::new()
        .entries(2048)
        .entry_size(64)
        .actual_segments(8)
        .key_codec(Arc::new(offheap_map::Utf8Codec))
        .value_codec(Arc::new(offheap_map::Utf8Codec))
        .create_or_open(&path)
        .unwrap();

    assert_eq!(reopened.len(), 1000);
    for i in 0..1000 {
        assert_eq!(reopened.get(&format!("k{i}")).unwrap(), Some(format!("v{i}")));
    }
}

#[test]
fn clear_resets_every_free_bit_and_slot() {
    let map = string_map(1024, 4);
    for i in 0..50 {
        map.put(format!("key-{i}"), format!("value-{i}")).unwrap();
    }
    assert_eq!(map.len(), 50);

    map.clear().unwrap();
    assert_eq!(map.len(), 0);
    for i in 0..50 {
        assert!(!map.contains_key(&format!("key-{i}")).unwrap());
    }

    // The arena is fully reusable after a clear, not just empty.
    for i in 0..50 {
        map.put(format!("key-{i}"), format!("value-{i}")).unwrap();
    }
    assert_eq!(map.len(), 50);
}

#[test]
fn put_put_is_idempotent_for_size() {
    let map = string_map(1024, 4);
    map.put("a".to_string(), "1".to_string()).unwrap();
    assert_eq!(map.len(), 1);
    map.put("a".to_string(), "1".to_string()).unwrap();
    assert_eq!(map.len(), 1);
}

