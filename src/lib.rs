// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// An embeddable, off-heap, persistent, segmented concurrent hash map.
// The entire data region — header, per-segment hash-lookup tables,
// entry arenas, and free-bit allocators — lives in a memory-mapped (or
// anonymous) byte region; readers and writers compute offsets into it
// directly instead of allocating on the heap per operation. A map is
// optionally file-backed, so it survives process restarts and can be
// shared between processes, and optionally replicated.

pub mod error;

pub mod byte_store;
pub mod hash;

pub mod codec;
pub mod entry;
pub mod free_bits;
pub mod hash_lookup;

pub mod arena;
pub mod lock;

pub mod header;
pub mod listener;

pub mod segment;

pub mod builder;
pub mod map;

pub mod replicated;

pub use builder::{Alignment, MapBuilder};
pub use codec::{Byteable, ByteableCodec, Codec, CodecKind, SerdeCodec, Utf8Codec};
pub use error::{Error, Result};
pub use header::MapHeader;
pub use listener::{ErrorListener, EventListener, MetaBytes, NoopListener};
pub use map::Map;
pub use replicated::{
    ModificationListener, ModificationRecord, ReplicatedMap, Replicator, Subscription, SystemTimeProvider, TimeProvider,
};
