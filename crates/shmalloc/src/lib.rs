// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! # shmalloc - memory allocators for session-oriented services
//!
//! A family of collaborating allocators for a networked service that
//! manages many concurrent sessions: a page-based slab allocator living
//! in a fixed, caller-supplied memory region (typically a shared memory
//! segment mapped by every worker process), a lightweight per-session
//! pool on top of it, and a per-task registry of singleton buffers.
//!
//! ## Quick Start
//!
//! ```rust
//! use shmalloc::{HeapRegion, SlabPool};
//!
//! // A page-aligned region; in production this is a shared memory
//! // segment (see `shm::ShmSegment`).
//! let region = HeapRegion::new(64 * 4096).expect("region");
//!
//! // SAFETY: the region is page aligned, exclusive, and outlives the
//! // pool.
//! let pool = unsafe { SlabPool::init(region.as_ptr(), region.len(), 3) }.expect("init");
//!
//! let p = pool.alloc(100).expect("alloc");
//! // SAFETY: p came from this pool and is not used afterwards.
//! unsafe { pool.free(p) }.expect("free");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                       Service sessions                       |
//! |        TaskRegistry (per-task ids)   SessionPool (arena)     |
//! +--------------------------------------------------------------+
//! |                        BlockOps seam                         |
//! |              HeapOps (std::alloc) | SlabOps                  |
//! +--------------------------------------------------------------+
//! |                  SlabPool (shared region)                    |
//! |   slot lists | chunk bitmaps | page runs | futex mutex       |
//! +--------------------------------------------------------------+
//! |              ShmSegment (shm_open / mmap, libc)              |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SlabPool`] | Slab allocator over a fixed region, cross-process |
//! | [`SessionPool`] | Per-session block-bump pool with free lists |
//! | [`TaskRegistry`] | Singleton buffers keyed by `(task, id)` |
//! | [`ShmSegment`] | POSIX shared memory segment lifecycle |
//! | [`BlockOps`] | Backing allocator seam for session pools |
//!
//! ## Modules Overview
//!
//! - [`slab`] - the slab allocator (start here)
//! - [`session`] - per-session pools
//! - [`task`] - the per-task registry
//! - [`shm`] - shared memory segments, futexes, the region mutex
//! - [`config`] - every tunable constant

/// Global configuration (page geometry, magics, bucket counts).
pub mod config;
/// Per-session pool (blocks, free-list heads, backing seam).
pub mod session;
/// POSIX shared memory plumbing (segments, futex, region mutex).
pub mod shm;
/// Page-based slab allocator over a fixed region.
pub mod slab;
/// Per-task singleton-buffer registry.
pub mod task;

pub use session::{BlockOps, HeapOps, PoolClass, PoolError, SessionPool, SlabOps};
pub use shm::{ShmError, ShmSegment};
pub use slab::{HeapRegion, SlabError, SlabGuard, SlabPool, SlabStat};
pub use task::{Atom, TaskError, TaskRegistry, ThreadAtom};
