// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! Backing allocator seam for session pools.
//!
//! A pool obtains its blocks (and serves oversized requests) through a
//! [`BlockOps`] implementation. Two are provided: the process heap, and
//! an adapter over a [`SlabPool`] so sessions can draw their blocks from
//! a shared region.

use crate::config::OBJ_MIN_SIZE;
use crate::slab::SlabPool;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

/// Backing allocator used by a session pool for blocks and for
/// oversized requests.
pub trait BlockOps: Send + Sync {
    /// Allocate `size` bytes, 16-byte aligned. `None` when exhausted.
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Release an allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`BlockOps::alloc`] on the same instance
    /// with the same `size`, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

/// Process-heap backing via `std::alloc`.
pub struct HeapOps;

impl BlockOps for HeapOps {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, OBJ_MIN_SIZE).ok()?;
        // SAFETY: layout has non-zero size (pools never request zero
        // bytes); a null return maps to None.
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: caller contract — ptr/size match the original alloc.
        unsafe {
            dealloc(
                ptr.as_ptr(),
                Layout::from_size_align_unchecked(size, OBJ_MIN_SIZE),
            );
        }
    }
}

/// Slab-region backing: session blocks are slab allocations.
pub struct SlabOps {
    pool: Arc<SlabPool>,
}

impl SlabOps {
    #[must_use]
    pub fn new(pool: Arc<SlabPool>) -> Self {
        Self { pool }
    }
}

impl BlockOps for SlabOps {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.pool.alloc(size)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _size: usize) {
        // SAFETY: caller contract — ptr came from this pool's alloc.
        if let Err(e) = unsafe { self.pool.free(ptr) } {
            log::error!("[POOL] slab-backed block release failed: {e}");
        }
    }
}
