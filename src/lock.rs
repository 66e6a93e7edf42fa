// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-segment reader/writer lock. A
// single `AtomicU32` — high bit the write flag, low bits the reader
// count — with adaptive pause/yield/sleep backoff, bounded by a
// deadline instead of spinning forever: past the deadline, acquisition
// fails with `Error::LockTimeout` instead of blocking.
//
// Lock release happens in `Drop`, so every exit path — early return,
// `?`, or an unexpected panic unwind — releases the lock.

use std::time::{Duration, Instant};

use crate::byte_store::ByteStore;
use crate::error::{Error, Result};

const W_MASK: u32 = i32::MAX as u32;
const W_FLAG: u32 = W_MASK + 1;

#[inline]
fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// A view over one `u32` lock word inside a segment's `ByteStore`
/// range. Owns no memory; `offset` is this segment's `lock_word`
/// position within the segment layout.
#[derive(Debug, Clone, Copy)]
pub struct SegmentLock {
    offset: usize,
}

impl SegmentLock {
    /// Bytes occupied by one lock word.
    pub const BYTE_SIZE: usize = 4;

    pub fn new(offset: usize) -> Self {
        Self { offset }
    }

    /// Acquire the write (exclusive) lock, failing with
    /// `Error::LockTimeout` if `deadline` passes first.
    pub fn write<'a>(&self, store: &'a ByteStore, segment: usize, timeout: Duration) -> Result<WriteGuard<'a>> {
        let deadline = Instant::now() + timeout;
        let mut k = 0u32;
        loop {
            let old = store.fetch_or_u32(self.offset, W_FLAG);
            if old == 0 {
                break; // acquired, no readers present
            }
            if old & W_FLAG == 0 {
                break; // readers present but no competing writer; wait for them below
            }
            if Instant::now() >= deadline {
                // undo the fetch_or: we didn't actually change anything
                // meaningful (W_FLAG was already set), nothing to undo.
                tracing::warn!(segment, "write-lock acquisition timed out");
                return Err(Error::LockTimeout { segment });
            }
            adaptive_yield(&mut k);
        }
        let mut k = 0u32;
        while store.load_u32_acquire(self.offset) & W_MASK != 0 {
            if Instant::now() >= deadline {
                // Clear only the write flag we set above; readers may
                // still be outstanding and will decrement their own
                // count bits on drop. Resetting the whole word here
                // would discard those counts and underflow later.
                store.fetch_and_u32(self.offset, !W_FLAG);
                tracing::warn!(segment, "write-lock acquisition timed out waiting for readers");
                return Err(Error::LockTimeout { segment });
            }
            adaptive_yield(&mut k);
        }
        Ok(WriteGuard { store, offset: self.offset })
    }

    /// Acquire a shared (read) lock, failing with `Error::LockTimeout`
    /// if `deadline` passes first.
    pub fn read<'a>(&self, store: &'a ByteStore, segment: usize, timeout: Duration) -> Result<ReadGuard<'a>> {
        let deadline = Instant::now() + timeout;
        let mut old = store.load_u32_acquire(self.offset);
        let mut k = 0u32;
        loop {
            if old & W_FLAG != 0 {
                if Instant::now() >= deadline {
                    tracing::warn!(segment, "read-lock acquisition timed out");
                    return Err(Error::LockTimeout { segment });
                }
                adaptive_yield(&mut k);
                old = store.load_u32_acquire(self.offset);
                continue;
            }
            match store.compare_exchange_weak_u32(self.offset, old, old + 1) {
                Ok(_) => return Ok(ReadGuard { store, offset: self.offset }),
                Err(cur) => {
                    old = cur;
                    if Instant::now() >= deadline {
                        tracing::warn!(segment, "read-lock acquisition timed out");
                        return Err(Error::LockTimeout { segment });
                    }
                }
            }
        }
    }
}

/// Held write lock on a segment; releases on drop.
pub struct WriteGuard<'a> {
    store: &'a ByteStore,
    offset: usize,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.store.store_u32_release(self.offset, 0);
    }
}

/// Held read lock on a segment; releases on drop.
pub struct ReadGuard<'a> {
    store: &'a ByteStore,
    offset: usize,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.store.fetch_sub_u32(self.offset, 1);
    }
}

/// Initialize a fresh lock word to the unlocked state.
pub fn init_unlocked(store: &ByteStore, offset: usize) {
    store.store_u32_release(offset, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_excludes() {
        let store = ByteStore::anonymous(4).unwrap();
        let lock = SegmentLock::new(0);
        let guard = lock.write(&store, 0, Duration::from_millis(200)).unwrap();
        drop(guard);
        let _r = lock.read(&store, 0, Duration::from_millis(200)).unwrap();
    }

    #[test]
    fn concurrent_readers_allowed() {
        let store = ByteStore::anonymous(4).unwrap();
        let lock = SegmentLock::new(0);
        let r1 = lock.read(&store, 0, Duration::from_millis(200)).unwrap();
        let r2 = lock.read(&store, 0, Duration::from_millis(200)).unwrap();
        drop(r1);
        drop(r2);
    }

    #[test]
    fn write_lock_times_out_when_held() {
        let store = ByteStore::anonymous(4).unwrap();
        let lock = SegmentLock::new(0);
        let _guard = lock.write(&store, 3, Duration::from_millis(20)).unwrap();
        let err = lock.write(&store, 3, Duration::from_millis(20)).unwrap_err();
        match err {
            Error::LockTimeout { segment } => assert_eq!(segment, 3),
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[test]
    fn read_lock_times_out_while_writer_holds() {
        let store = ByteStore::anonymous(4).unwrap();
        let lock = SegmentLock::new(0);
        let _guard = lock.write(&store, 1, Duration::from_millis(200)).unwrap();
        let err = lock.read(&store, 1, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { segment: 1 }));
    }
}
