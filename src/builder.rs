// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Sizer derives segment geometry from user-facing
// parameters. `MapBuilder` collects those parameters and, for a
// file-backed map, persists them as a small versioned binary record —
// object serialization of the builder is a foreign concern here; a
// versioned, explicit binary header is used instead — written
// immediately before the `MapHeader`. Grounded
// in `header.rs`'s own validated-binary-record idiom, generalized to a
// second record sitting in front of it.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::byte_store::ByteStore;
use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::header::{self, MapHeader, FORMAT_VERSION, MAGIC};
use crate::listener::{ErrorListener, EventListener, NoopListener};
use crate::map::Map;
use crate::segment::{Segment, SegmentGeometry};

const DEFAULT_ENTRIES: u64 = 1 << 20;
const DEFAULT_ENTRY_SIZE: usize = 128;
const DEFAULT_LOCK_TIME_OUT: Duration = Duration::from_secs(2);

const BUILDER_MAGIC: u32 = 0x4F_48_42_43; // "OHBC"
const BUILDER_CONFIG_VERSION: u32 = 1;

/// Entry-count threshold above which `large_segments` is auto-enabled
/// even if the caller didn't opt in explicitly (spec §4.7).
const LARGE_SEGMENTS_THRESHOLD: u64 = 1 << 35;

/// Value alignment, one of the three the builder accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    None,
    Four,
    Eight,
}

impl Default for Alignment {
    fn default() -> Self {
        Alignment::Eight
    }
}

fn alignment_bytes(a: Alignment) -> usize {
    match a {
        Alignment::None => 1,
        Alignment::Four => 4,
        Alignment::Eight => 8,
    }
}

fn align_up(offset: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        offset
    } else {
        (offset + alignment - 1) / alignment * alignment
    }
}

fn round_up_to_64(n: u64) -> u64 {
    n.div_ceil(64) * 64
}

fn next_pow2_u64(n: u64) -> u64 {
    n.max(1).next_power_of_two()
}

/// Smallest power of two `s` with `s³ ≥ 2 × aligned_entry_size`, capped
/// at 2¹⁶ — the default `min_segments`.
fn default_min_segments(aligned_entry_size: usize) -> u32 {
    let target = 2u64 * aligned_entry_size as u64;
    let mut s: u64 = 1;
    while s < (1u64 << 16) && s.pow(3) < target {
        s *= 2;
    }
    s.min(1u64 << 16) as u32
}

/// Segment geometry derived from a [`MapBuilder`]'s parameters.
#[derive(Debug, Clone, Copy)]
struct SizerOutput {
    segment_count: u32,
    entries_per_segment: u32,
    chunk_size: u32,
    chunks_per_segment: u32,
    num_slots: usize,
    p_bits: u32,
}

struct Sizer;

impl Sizer {
    /// Segment-count derivation: honor an explicit
    /// override first, then `large_segments`, then the
    /// entries-vs-`min_segments` threshold; an entry count at or below
    /// that threshold falls back to `min_segments` itself.
    fn derive<K, V>(builder: &MapBuilder<K, V>) -> SizerOutput {
        let alignment = alignment_bytes(builder.alignment);
        let aligned_entry_size = align_up(builder.entry_size.max(1), alignment);
        let chunk_size = (aligned_entry_size as u64).next_power_of_two().max(1) as u32;

        let min_segments = builder.effective_min_segments();
        let large_segments = builder.effective_large_segments();

        let segment_count: u32 = if let Some(n) = builder.actual_segments {
            n
        } else if large_segments {
            next_pow2_u64(((builder.entries >> 30) + 1).max(min_segments as u64)) as u32
        } else if builder.entries > (min_segments as u64) << 15 {
            let candidate = next_pow2_u64((builder.entries >> 15).max(128));
            if candidate < (1 << 20) {
                candidate as u32
            } else {
                next_pow2_u64(((builder.entries >> 30) + 1).max(min_segments as u64)) as u32
            }
        } else {
            min_segments.next_power_of_two()
        };

        let entries_per_segment: u32 = if let Some(n) = builder.actual_entries_per_segment {
            n
        } else {
            let raw = (builder.entries * 2).div_ceil(segment_count.max(1) as u64);
            round_up_to_64(raw) as u32
        };

        // Simplifying assumption: one chunk reserved per entry slot.
        // Variable-length entries spanning more than one chunk are still
        // supported; this just sizes the arena for the average case the
        // same way `entries_per_segment` sizes the hash_lookup table.
        let chunks_per_segment = entries_per_segment.max(1);

        let min_slots = (chunks_per_segment as u64 * 3).div_ceil(2).max(2);
        let num_slots = min_slots.next_power_of_two() as usize;

        let mut p_bits = 1u32;
        while (1u64 << p_bits) <= chunks_per_segment as u64 {
            p_bits += 1;
        }
        if large_segments {
            p_bits = p_bits.max(32);
        }

        SizerOutput {
            segment_count: segment_count.max(1),
            entries_per_segment,
            chunk_size,
            chunks_per_segment,
            num_slots,
            p_bits,
        }
    }
}

/// Persisted builder configuration: a small fixed binary
/// record written once, immediately before the [`MapHeader`], and
/// compared byte-for-byte on every reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BuilderConfig {
    magic: u32,
    version: u32,
    entries: u64,
    entry_size: u32,
    alignment: u8,
    min_segments: u32,
    actual_segments: u32,
    actual_entries_per_segment: u32,
    replicas: u32,
    meta_data_bytes: u8,
    lock_time_out_millis: u64,
    put_returns_null: bool,
    remove_returns_null: bool,
    large_segments: bool,
    key_codec_kind: u8,
    value_codec_kind: u8,
}

impl BuilderConfig {
    const RAW_SIZE: usize = 4 + 4 + 8 + 4 + 1 + 4 + 4 + 4 + 4 + 1 + 8 + 1 + 1 + 1 + 1 + 1;

    fn write(&self, store: &ByteStore, offset: usize) {
        let mut pos = offset;
        store.write_u32(pos, self.magic);
        pos += 4;
        store.write_u32(pos, self.version);
        pos += 4;
        store.write_u64(pos, self.entries);
        pos += 8;
        store.write_u32(pos, self.entry_size);
        pos += 4;
        store.write_u8(pos, self.alignment);
        pos += 1;
        store.write_u32(pos, self.min_segments);
        pos += 4;
        store.write_u32(pos, self.actual_segments);
        pos += 4;
        store.write_u32(pos, self.actual_entries_per_segment);
        pos += 4;
        store.write_u32(pos, self.replicas);
        pos += 4;
        store.write_u8(pos, self.meta_data_bytes);
        pos += 1;
        store.write_u64(pos, self.lock_time_out_millis);
        pos += 8;
        store.write_u8(pos, self.put_returns_null as u8);
        pos += 1;
        store.write_u8(pos, self.remove_returns_null as u8);
        pos += 1;
        store.write_u8(pos, self.large_segments as u8);
        pos += 1;
        store.write_u8(pos, self.key_codec_kind);
        pos += 1;
        store.write_u8(pos, self.value_codec_kind);
    }

    fn read(store: &ByteStore, offset: usize) -> Result<Self> {
        let mut pos = offset;
        let magic = store.read_u32(pos);
        pos += 4;
        if magic != BUILDER_MAGIC {
            return Err(Error::CorruptHeader(format!(
                "bad builder config magic: expected {BUILDER_MAGIC:#x}, found {magic:#x}"
            )));
        }
        let version = store.read_u32(pos);
        pos += 4;
        if version != BUILDER_CONFIG_VERSION {
            return Err(Error::CorruptHeader(format!(
                "unsupported builder config version {version}, this build supports {BUILDER_CONFIG_VERSION}"
            )));
        }
        let entries = store.read_u64(pos);
        pos += 8;
        let entry_size = store.read_u32(pos);
        pos += 4;
        let alignment = store.read_u8(pos);
        pos += 1;
        let min_segments = store.read_u32(pos);
        pos += 4;
        let actual_segments = store.read_u32(pos);
        pos += 4;
        let actual_entries_per_segment = store.read_u32(pos);
        pos += 4;
        let replicas = store.read_u32(pos);
        pos += 4;
        let meta_data_bytes = store.read_u8(pos);
        pos += 1;
        let lock_time_out_millis = store.read_u64(pos);
        pos += 8;
        let put_returns_null = store.read_u8(pos) != 0;
        pos += 1;
        let remove_returns_null = store.read_u8(pos) != 0;
        pos += 1;
        let large_segments = store.read_u8(pos) != 0;
        pos += 1;
        let key_codec_kind = store.read_u8(pos);
        pos += 1;
        let value_codec_kind = store.read_u8(pos);

        Ok(Self {
            magic,
            version,
            entries,
            entry_size,
            alignment,
            min_segments,
            actual_segments,
            actual_entries_per_segment,
            replicas,
            meta_data_bytes,
            lock_time_out_millis,
            put_returns_null,
            remove_returns_null,
            large_segments,
            key_codec_kind,
            value_codec_kind,
        })
    }

    /// Compares a freshly read config against what this builder
    /// expects for a reopen.
    fn validate_matches(&self, expected: &BuilderConfig) -> Result<()> {
        if self != expected {
            return Err(Error::CorruptHeader(format!(
                "builder config mismatch on reopen: on-disk {self:?} != builder {expected:?}"
            )));
        }
        Ok(())
    }
}

/// Collects the builder's options table and builds an anonymous or
/// file-backed [`Map`].
pub struct MapBuilder<K, V> {
    entries: u64,
    entry_size: usize,
    alignment: Alignment,
    actual_segments: Option<u32>,
    min_segments: Option<u32>,
    actual_entries_per_segment: Option<u32>,
    replicas: u32,
    meta_data_bytes: u8,
    lock_time_out: Duration,
    put_returns_null: bool,
    remove_returns_null: bool,
    large_segments: bool,
    replicated: bool,
    replication_identifier: u8,
    key_codec: Option<Arc<dyn Codec<K>>>,
    value_codec: Option<Arc<dyn Codec<V>>>,
    error_listener: Arc<dyn ErrorListener>,
    event_listener: Arc<dyn EventListener<K, V>>,
}

impl<K, V> Default for MapBuilder<K, V> {
    fn default() -> Self {
        Self {
            entries: DEFAULT_ENTRIES,
            entry_size: DEFAULT_ENTRY_SIZE,
            alignment: Alignment::default(),
            actual_segments: None,
            min_segments: None,
            actual_entries_per_segment: None,
            replicas: 0,
            meta_data_bytes: 0,
            lock_time_out: DEFAULT_LOCK_TIME_OUT,
            put_returns_null: false,
            remove_returns_null: false,
            large_segments: false,
            replicated: false,
            replication_identifier: 0,
            key_codec: None,
            value_codec: None,
            error_listener: Arc::new(NoopListener),
            event_listener: Arc::new(NoopListener),
        }
    }
}

impl<K, V> MapBuilder<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(mut self, entries: u64) -> Self {
        self.entries = entries;
        self
    }

    pub fn entry_size(mut self, entry_size: usize) -> Self {
        self.entry_size = entry_size;
        self
    }

    pub fn alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn actual_segments(mut self, segments: u32) -> Self {
        self.actual_segments = Some(segments);
        self
    }

    pub fn min_segments(mut self, min_segments: u32) -> Self {
        self.min_segments = Some(min_segments);
        self
    }

    pub fn actual_entries_per_segment(mut self, n: u32) -> Self {
        self.actual_entries_per_segment = Some(n);
        self
    }

    pub fn replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn meta_data_bytes(mut self, n: u8) -> Self {
        self.meta_data_bytes = n;
        self
    }

    pub fn lock_time_out(mut self, timeout: Duration) -> Self {
        self.lock_time_out = timeout;
        self
    }

    pub fn put_returns_null(mut self, v: bool) -> Self {
        self.put_returns_null = v;
        self
    }

    pub fn remove_returns_null(mut self, v: bool) -> Self {
        self.remove_returns_null = v;
        self
    }

    pub fn large_segments(mut self, v: bool) -> Self {
        self.large_segments = v;
        self
    }

    /// Marks this map as replicated with the given identifier.
    /// The identifier is persisted in the header; registering
    /// replicators themselves is the replicated variant's concern
    /// (`replicated.rs`).
    pub fn replicated(mut self, identifier: u8) -> Self {
        self.replicated = true;
        self.replication_identifier = identifier;
        self
    }

    pub fn key_codec(mut self, codec: Arc<dyn Codec<K>>) -> Self {
        self.key_codec = Some(codec);
        self
    }

    pub fn value_codec(mut self, codec: Arc<dyn Codec<V>>) -> Self {
        self.value_codec = Some(codec);
        self
    }

    pub fn error_listener(mut self, listener: Arc<dyn ErrorListener>) -> Self {
        self.error_listener = listener;
        self
    }

    pub fn event_listener(mut self, listener: Arc<dyn EventListener<K, V>>) -> Self {
        self.event_listener = listener;
        self
    }

    fn aligned_entry_size(&self) -> usize {
        align_up(self.entry_size.max(1), alignment_bytes(self.alignment))
    }

    fn effective_min_segments(&self) -> u32 {
        self.min_segments.unwrap_or_else(|| default_min_segments(self.aligned_entry_size()))
    }

    /// `large_segments` forces 32-bit slot positions; it's also
    /// auto-enabled once `entries` alone would overflow a 31-bit
    /// position field, regardless of whether the caller opted in.
    fn effective_large_segments(&self) -> bool {
        self.large_segments || self.entries > LARGE_SEGMENTS_THRESHOLD
    }

    fn build_header(&self, sizer: &SizerOutput) -> MapHeader {
        MapHeader {
            magic: MAGIC,
            version: FORMAT_VERSION,
            segment_count: sizer.segment_count,
            chunks_per_segment: sizer.chunks_per_segment,
            chunk_size: sizer.chunk_size,
            entries_capacity: sizer.entries_per_segment,
            meta_data_bytes: self.meta_data_bytes,
            alignment: alignment_bytes(self.alignment) as u32,
            replication_identifier: self.replication_identifier,
            transactional: false,
        }
    }

    fn build_config(&self, key_codec: &Arc<dyn Codec<K>>, value_codec: &Arc<dyn Codec<V>>) -> BuilderConfig {
        BuilderConfig {
            magic: BUILDER_MAGIC,
            version: BUILDER_CONFIG_VERSION,
            entries: self.entries,
            entry_size: self.entry_size as u32,
            alignment: alignment_bytes(self.alignment) as u8,
            min_segments: self.effective_min_segments(),
            actual_segments: self.actual_segments.unwrap_or(0),
            actual_entries_per_segment: self.actual_entries_per_segment.unwrap_or(0),
            replicas: self.replicas,
            meta_data_bytes: self.meta_data_bytes,
            lock_time_out_millis: self.lock_time_out.as_millis() as u64,
            put_returns_null: self.put_returns_null,
            remove_returns_null: self.remove_returns_null,
            large_segments: self.large_segments,
            key_codec_kind: key_codec.kind() as u8,
            value_codec_kind: value_codec.kind() as u8,
        }
    }

    fn required_codecs(&self) -> Result<(Arc<dyn Codec<K>>, Arc<dyn Codec<V>>)> {
        let key_codec = self
            .key_codec
            .clone()
            .ok_or_else(|| Error::IllegalArgument("key_codec is required".to_string()))?;
        let value_codec = self
            .value_codec
            .clone()
            .ok_or_else(|| Error::IllegalArgument("value_codec is required".to_string()))?;
        Ok((key_codec, value_codec))
    }

    /// Builds an anonymous, process-local map: not file-backed, gone
    /// when the last handle drops.
    pub fn create_anonymous(self) -> Result<Map<K, V>> {
        let (key_codec, value_codec) = self.required_codecs()?;
        let sizer = Sizer::derive(&self);
        let header = self.build_header(&sizer);
        let geometry = SegmentGeometry::compute(sizer.num_slots, sizer.p_bits, sizer.chunks_per_segment as usize, sizer.chunk_size as usize);
        let total_len = geometry.total_size * sizer.segment_count as usize;

        let store = ByteStore::anonymous(total_len)?;
        let segments = build_segments(&self, &sizer, geometry, &store, 0, key_codec.clone(), value_codec.clone(), true);

        Ok(Map::from_parts(store, header, segments, key_codec, value_codec, None))
    }

    /// Creates a fresh file-backed map at `path`, or reopens an existing
    /// non-empty one after validating its persisted configuration and
    /// header match this builder's parameters byte-for-byte.
    pub fn create_or_open(self, path: impl Into<PathBuf>) -> Result<Map<K, V>> {
        let path = path.into();
        let (key_codec, value_codec) = self.required_codecs()?;
        let sizer = Sizer::derive(&self);
        let header = self.build_header(&sizer);
        let config = self.build_config(&key_codec, &value_codec);

        let config_region = header::pad_boundary(BuilderConfig::RAW_SIZE);
        let header_start = config_region;
        let data_region_offset = MapHeader::data_region_offset(header_start);
        let geometry = SegmentGeometry::compute(sizer.num_slots, sizer.p_bits, sizer.chunks_per_segment as usize, sizer.chunk_size as usize);
        let total_len = data_region_offset + geometry.total_size * sizer.segment_count as usize;

        let existing = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let store = ByteStore::file_backed(file, total_len)?;

        let segments = if existing {
            let on_disk_config = BuilderConfig::read(&store, 0)?;
            on_disk_config.validate_matches(&config)?;
            let on_disk_header = MapHeader::read(&store, header_start)?;
            on_disk_header.validate_reopen(&header)?;
            build_segments(&self, &sizer, geometry, &store, data_region_offset, key_codec.clone(), value_codec.clone(), false)
        } else {
            config.write(&store, 0);
            header.write(&store, header_start);
            let segments = build_segments(&self, &sizer, geometry, &store, data_region_offset, key_codec.clone(), value_codec.clone(), true);
            store.flush_all()?;
            segments
        };

        Ok(Map::from_parts(store, header, segments, key_codec, value_codec, Some(path)))
    }
}

#[allow(clippy::too_many_arguments)]
fn build_segments<K, V>(
    builder: &MapBuilder<K, V>,
    sizer: &SizerOutput,
    geometry: SegmentGeometry,
    store: &ByteStore,
    data_region_offset: usize,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    fresh: bool,
) -> Vec<Segment<K, V>> {
    let mut segments = Vec::with_capacity(sizer.segment_count as usize);
    for index in 0..sizer.segment_count as usize {
        let base_offset = data_region_offset + index * geometry.total_size;
        let segment = Segment::new(
            index,
            base_offset,
            geometry,
            builder.meta_data_bytes as usize,
            alignment_bytes(builder.alignment),
            builder.replicated,
            key_codec.clone(),
            value_codec.clone(),
            builder.lock_time_out,
            builder.put_returns_null,
            builder.remove_returns_null,
            builder.event_listener.clone(),
            builder.error_listener.clone(),
        );
        if fresh {
            segment.init_fresh(store);
        }
        segments.push(segment);
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Utf8Codec;
    use tempfile::tempdir;

    fn string_builder() -> MapBuilder<String, String> {
        MapBuilder::new()
            .entries(256)
            .entry_size(32)
            .actual_segments(4)
            .key_codec(Arc::new(Utf8Codec))
            .value_codec(Arc::new(Utf8Codec))
    }

    #[test]
    fn missing_codec_is_illegal_argument() {
        let builder: MapBuilder<String, String> = MapBuilder::new().entries(64);
        let err = builder.create_anonymous().unwrap_err();
        assert!(matches!(err, Error::IllegalArgument(_)));
    }

    #[test]
    fn anonymous_round_trip() {
        let map = string_builder().create_anonymous().unwrap();
        map.put("a".to_string(), "aye".to_string()).unwrap();
        assert_eq!(map.get(&"a".to_string()).unwrap(), Some("aye".to_string()));
    }

    #[test]
    fn sizer_respects_actual_segments_override() {
        let builder = string_builder();
        let sizer = Sizer::derive(&builder);
        assert_eq!(sizer.segment_count, 4);
    }

    #[test]
    fn sizer_entries_per_segment_rounds_to_64() {
        let builder: MapBuilder<String, String> = MapBuilder::new().entries(1000).actual_segments(4);
        let sizer = Sizer::derive(&builder);
        assert_eq!(sizer.entries_per_segment % 64, 0);
    }

    #[test]
    fn large_segments_auto_enabled_above_threshold() {
        let builder: MapBuilder<String, String> = MapBuilder::new().entries(LARGE_SEGMENTS_THRESHOLD + 1).actual_segments(4);
        assert!(!builder.large_segments, "caller did not opt in explicitly");
        assert!(builder.effective_large_segments());
        let sizer = Sizer::derive(&builder);
        assert!(sizer.p_bits >= 32);
    }

    #[test]
    fn large_segments_not_auto_enabled_below_threshold() {
        let builder: MapBuilder<String, String> = MapBuilder::new().entries(1000).actual_segments(4);
        assert!(!builder.effective_large_segments());
    }

    #[test]
    fn file_backed_reopen_matches_builder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.bin");
        {
            let map = string_builder().create_or_open(&path).unwrap();
            map.put("k".to_string(), "v".to_string()).unwrap();
            map.flush().unwrap();
        }
        let reopened = string_builder().create_or_open(&path).unwrap();
        assert_eq!(reopened.get(&"k".to_string()).unwrap(), Some("v".to_string()));
    }

    #[test]
    fn reopen_with_mismatched_segments_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.bin");
        {
            let _map = string_builder().create_or_open(&path).unwrap();
        }
        let mismatched: MapBuilder<String, String> = MapBuilder::new()
            .entries(256)
            .entry_size(32)
            .actual_segments(8)
            .key_codec(Arc::new(Utf8Codec))
            .value_codec(Arc::new(Utf8Codec));
        let err = mismatched.create_or_open(&path).unwrap_err();
        assert!(matches!(err, Error::CorruptHeader(_)));
    }
}
