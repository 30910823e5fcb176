// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! Global configuration - single source of truth.
//!
//! Every tunable constant of the allocator family lives here.
//! **NEVER hardcode these values elsewhere!**
//!
//! Constants are grouped by subsystem: slab pool geometry, session pool
//! geometry, task registry sizing.

// =======================================================================
// Slab pool geometry
// =======================================================================

/// log2 of the slab page size.
///
/// All other page constants are derived from this value.
pub const PAGE_SHIFT: u32 = 12;

/// Slab page size in bytes (4 KiB). The unit of page-level allocation
/// and of subdivision into chunks.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Default minimum chunk shift: smallest chunk is `1 << 3` = 8 bytes.
///
/// Callers may pass a different `min_shift` to `SlabPool::init`; it must
/// satisfy `MIN_SHIFT_FLOOR <= min_shift < PAGE_SHIFT`.
pub const DEFAULT_MIN_SHIFT: u32 = 3;

/// Lowest accepted `min_shift`. A chunk must be able to hold one bitmap
/// byte, so anything below 3 would not leave room for in-band metadata.
pub const MIN_SHIFT_FLOOR: u32 = 3;

/// Largest request served by the chunk path. Anything above this goes
/// through whole page runs.
pub const MAX_SLAB_SIZE: usize = PAGE_SIZE / 2;

/// Bit width of one bitmap word.
pub const WORD_BITS: u32 = u64::BITS;

/// Chunk size at which one bitmap word exactly covers a page:
/// `PAGE_SIZE / 64` = 64 bytes for 4 KiB pages.
pub const EXACT_SIZE: usize = PAGE_SIZE / WORD_BITS as usize;

/// `log2(EXACT_SIZE)`.
pub const EXACT_SHIFT: u32 = EXACT_SIZE.trailing_zeros();

/// Magic word at the base of every initialized slab region.
pub const SLAB_MAGIC: u32 = 0x5348_4D41; // "SHMA"

/// Slab region layout version. Bumped whenever the in-region metadata
/// layout changes; `attach` refuses a mismatch.
pub const SLAB_VERSION: u32 = 1;

/// Byte written over freed and virgin slab memory when the `debug-fill`
/// feature is enabled.
pub const JUNK_BYTE: u8 = 0xA5;

// =======================================================================
// Session pool geometry
// =======================================================================

/// Minimum object size and alignment step of the session pool.
pub const OBJ_MIN_SIZE: usize = 16;

/// Magic carried by every live session pool; checked at free time to
/// catch frees routed to the wrong pool.
pub const POOL_MAGIC: u32 = 0x1234_ABCD;

/// Capacity of the process-wide session pool table. The owning pool of
/// a chunk is encoded in 8 bits of its header.
pub const POOL_TABLE_MAX: usize = 256;

/// Upper bound on distinct free-list head sizes per pool. Exceeding it
/// reports `AllocHead` rather than growing without bound.
pub const HEAD_MAX: usize = 4096;

/// Preset block geometries. Each class pairs a block size with the zone
/// ladder of chunk sizes its sessions most commonly request; the ladder
/// seeds the free-list head index so steady-state frees never allocate
/// a head.
pub const POOL_1K: (usize, [usize; 4]) = (1024, [16, 32, 64, 128]);
pub const POOL_4K: (usize, [usize; 4]) = (4096, [64, 128, 256, 512]);
pub const POOL_16K: (usize, [usize; 4]) = (16384, [256, 512, 1024, 2048]);
pub const POOL_64K: (usize, [usize; 4]) = (65536, [1024, 2048, 4096, 8192]);

// =======================================================================
// Task registry sizing
// =======================================================================

/// Task registry bucket mask; `hashcode(atom) & TASK_MASK` selects the
/// bucket.
pub const TASK_MASK: u32 = 0x3FF;

/// Number of task registry buckets.
pub const TASK_MAX: usize = (TASK_MASK as usize) + 1;

/// Per-task memory context bucket mask; `id & MEM_MASK` selects the
/// bucket.
pub const MEM_MASK: u64 = 0xFFFF;

/// Number of buckets in one task's memory context.
pub const MEM_MAX: usize = (MEM_MASK as usize) + 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_constants_consistent() {
        assert_eq!(PAGE_SIZE, 4096);
        assert_eq!(MAX_SLAB_SIZE, 2048);
        assert!(PAGE_SIZE.is_power_of_two());
    }

    #[test]
    fn test_exact_class_derivation() {
        assert_eq!(EXACT_SIZE, 64);
        assert_eq!(EXACT_SHIFT, 6);
        // One bitmap word covers exactly one page of EXACT_SIZE chunks.
        assert_eq!(EXACT_SIZE * WORD_BITS as usize, PAGE_SIZE);
    }

    #[test]
    fn test_bucket_masks() {
        assert_eq!(TASK_MAX, 1024);
        assert_eq!(MEM_MAX, 65536);
        assert!(TASK_MAX.is_power_of_two());
        assert!(MEM_MAX.is_power_of_two());
    }
}
