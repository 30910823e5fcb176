// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! Per-session pool: block-bumped allocation with per-size free lists.
//!
//! A session pool serves the small, short-lived allocations of one
//! session. Memory arrives in fixed-size blocks drawn from a backing
//! allocator (the [`BlockOps`] seam); requests are bumped off the
//! current block, frees go to a per-size free-list head, and freeing a
//! chunk coalesces it backward with an adjacent free predecessor.
//! Requests too large for a block bypass it and hit the backing
//! allocator directly.
//!
//! Every allocation is prefixed by an 8-byte header
//! ([`header::ChunkHeader`]) that records its size, the size of the
//! physically preceding chunk, its state, and its owning pool, which is
//! how [`free`] validates a bare pointer with no pool argument.

mod header;
mod ops;
mod pool;

pub use header::{ChunkType, HDR_SIZE};
pub use ops::{BlockOps, HeapOps, SlabOps};
pub use pool::{free, PoolClass, SessionPool};

use std::fmt;

/// Session pool error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PoolError {
    /// The backing allocator (or the pool table) is exhausted
    NoMem = 1,

    /// A new block could not be obtained from the backing allocator
    AllocBlock = 2,

    /// A free-list head could not be created
    AllocHead = 3,

    /// The request exceeds the block size and the direct fallback was
    /// refused as well
    SizeTooBig = 4,

    /// The chunk was already freed
    DoubleFree = 5,

    /// The chunk does not belong to a live pool
    WrongPool = 6,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMem => write!(f, "out of memory"),
            Self::AllocBlock => write!(f, "cannot allocate block"),
            Self::AllocHead => write!(f, "cannot allocate free-list head"),
            Self::SizeTooBig => write!(f, "request too big"),
            Self::DoubleFree => write!(f, "chunk is already free"),
            Self::WrongPool => write!(f, "chunk does not belong to this pool"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Result type for session pool operations
pub type Result<T> = std::result::Result<T, PoolError>;
