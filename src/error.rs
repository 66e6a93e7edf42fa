// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Crate-wide error type. `OutOfBounds` deliberately has no variant here:
// an out-of-range offset into the mapped region means the image is
// corrupt, and the only sane response is to panic (see byte_store.rs).

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can be surfaced from map operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A segment's write- or read-lock could not be acquired within its
    /// configured `lock_time_out`. The operation was aborted; the map
    /// remains usable.
    #[error("segment {segment} lock acquisition timed out")]
    LockTimeout {
        /// Index of the segment whose lock timed out.
        segment: usize,
    },

    /// The segment's entry arena has no free span large enough for the
    /// requested allocation. Not automatically retried or rehashed.
    #[error("segment {segment} is full, cannot allocate {chunks_needed} chunk(s)")]
    SegmentFull {
        /// Index of the segment that is full.
        segment: usize,
        /// Number of contiguous chunks that were requested.
        chunks_needed: usize,
    },

    /// I/O failure from the backing file. Fatal to the operation that
    /// triggered it; other segments remain usable.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// The mapped header does not match what the builder expected, or is
    /// not a header produced by this format at all. Fatal at open time;
    /// the map is not constructed.
    #[error("corrupt or mismatched header: {0}")]
    CorruptHeader(String),

    /// A builder parameter is invalid or combines with another in a way
    /// that cannot be honored. Detected before any allocation.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
}
