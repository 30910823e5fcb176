// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! Per-task memory context: a hash table from integer id to one
//! outstanding allocation.
//!
//! Each record is a [`MemCtl`] control block immediately followed by
//! the user payload, so a payload pointer converts back to its record
//! with one subtraction.

use super::{Result, TaskError};
use crate::config::{MEM_MASK, MEM_MAX, OBJ_MIN_SIZE};
use std::alloc::{alloc, dealloc, Layout};
use std::mem;
use std::ptr::NonNull;

/// Control block prefixing every per-task allocation.
#[repr(C)]
struct MemCtl {
    id: u64,
    /// Payload size, kept for deallocation
    size: usize,
}

const CTL_SIZE: usize = mem::size_of::<MemCtl>();

fn record_layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(CTL_SIZE + size, OBJ_MIN_SIZE).ok()
}

/// One task's id-to-allocation table.
pub(crate) struct TaskMem {
    buckets: Vec<Vec<NonNull<MemCtl>>>,
    count: usize,
}

// SAFETY: the records are owned exclusively by this context; all access
// goes through the registry bucket lock holding the context.
unsafe impl Send for TaskMem {}

impl TaskMem {
    /// Build the bucket table, reporting failure instead of aborting.
    pub(crate) fn new() -> Result<Self> {
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(MEM_MAX)
            .map_err(|_| TaskError::MemInit)?;
        buckets.resize_with(MEM_MAX, Vec::new);
        Ok(Self { buckets, count: 0 })
    }

    #[inline]
    fn bucket_of(id: u64) -> usize {
        (id & MEM_MASK) as usize
    }

    /// Payload of the record registered under `id`, if any.
    pub(crate) fn search(&self, id: u64) -> Option<NonNull<u8>> {
        self.buckets[Self::bucket_of(id)]
            .iter()
            .find(|ctl| {
                // SAFETY: bucket entries point at live records owned by
                // this context.
                unsafe { ctl.as_ref().id == id }
            })
            .map(|ctl| {
                // SAFETY: the payload follows the control block.
                unsafe { NonNull::new_unchecked(ctl.as_ptr().cast::<u8>().add(CTL_SIZE)) }
            })
    }

    /// Allocate a fresh record for `id` and return its payload.
    pub(crate) fn insert(&mut self, id: u64, size: usize) -> Option<NonNull<u8>> {
        let layout = record_layout(size)?;
        // SAFETY: layout size is at least CTL_SIZE, never zero.
        let raw = NonNull::new(unsafe { alloc(layout) })?.cast::<MemCtl>();
        // SAFETY: raw is valid for the record layout.
        unsafe { raw.as_ptr().write(MemCtl { id, size }) };
        self.buckets[Self::bucket_of(id)].push(raw);
        self.count += 1;
        // SAFETY: the payload follows the control block.
        Some(unsafe { NonNull::new_unchecked(raw.as_ptr().cast::<u8>().add(CTL_SIZE)) })
    }

    /// Unlink and release the record behind `payload`. Returns the
    /// remaining record count, or `None` when the record is unknown.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by `search`/`insert` on this
    /// context and must not be used afterwards.
    pub(crate) unsafe fn remove(&mut self, payload: NonNull<u8>) -> Option<usize> {
        // SAFETY: caller contract — a control block precedes the
        // payload.
        let ctl = unsafe { payload.as_ptr().sub(CTL_SIZE) }.cast::<MemCtl>();
        // SAFETY: as above.
        let id = unsafe { (*ctl).id };
        let bucket = &mut self.buckets[Self::bucket_of(id)];
        let pos = bucket.iter().position(|c| c.as_ptr() == ctl)?;
        bucket.swap_remove(pos);

        // SAFETY: the record was allocated by insert with this layout.
        unsafe {
            let size = (*ctl).size;
            if let Some(layout) = record_layout(size) {
                dealloc(ctl.cast::<u8>(), layout);
            }
        }
        self.count -= 1;
        Some(self.count)
    }

    /// Outstanding record count.
    pub(crate) fn count(&self) -> usize {
        self.count
    }

    /// Drain every bucket, releasing all outstanding records.
    pub(crate) fn fini(&mut self) {
        if self.count == 0 {
            return;
        }
        for bucket in &mut self.buckets {
            for ctl in bucket.drain(..) {
                // SAFETY: every bucket entry is a live record allocated
                // by insert.
                unsafe {
                    let size = (*ctl.as_ptr()).size;
                    if let Some(layout) = record_layout(size) {
                        dealloc(ctl.as_ptr().cast::<u8>(), layout);
                    }
                }
                self.count -= 1;
            }
            if self.count == 0 {
                break;
            }
        }
    }
}

impl Drop for TaskMem {
    fn drop(&mut self) {
        self.fini();
    }
}
