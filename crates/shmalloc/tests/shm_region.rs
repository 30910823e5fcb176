// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! A slab pool inside a real shared memory segment, driven through two
//! independent mappings of the same region - the single-process
//! equivalent of two worker processes sharing one pool.

use shmalloc::config::PAGE_SIZE;
use shmalloc::{shm, ShmSegment, SlabPool};
use std::ptr::NonNull;

fn unique_name(tag: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    shm::segment_name(&format!("test_{tag}_{ts}"))
}

#[test]
fn pool_survives_remapping_at_a_different_address() {
    let name = unique_name("remap");
    let size = 64 * PAGE_SIZE;

    let seg1 = ShmSegment::create(&name, size).expect("segment create failed");
    let base1 = NonNull::new(seg1.as_ptr()).expect("mapping is never null");
    // SAFETY: the fresh mapping is page aligned (mmap), exclusive, and
    // outlives the pool handle.
    let pool1 = unsafe { SlabPool::init(base1, size, 3) }.expect("init failed");

    // A second mapping of the same segment lands at a different
    // address, the way another process would see it.
    let seg2 = ShmSegment::open(&name, size).expect("segment open failed");
    assert_ne!(seg1.as_ptr(), seg2.as_ptr());
    let base2 = NonNull::new(seg2.as_ptr()).expect("mapping is never null");
    // SAFETY: init completed above; the mapping outlives the handle.
    let pool2 = unsafe { SlabPool::attach(base2, size) }.expect("attach failed");

    // Allocate through the first mapping, free through the second.
    let p1 = pool1.alloc(256).expect("alloc failed");
    let offset = p1.as_ptr() as usize - seg1.as_ptr() as usize;

    // SAFETY: same chunk, seen through the second mapping.
    let p2 = unsafe { NonNull::new_unchecked(seg2.as_ptr().add(offset)) };
    // SAFETY: p2 denotes the allocation made above, freed exactly once.
    unsafe { pool2.free(p2) }.expect("free through second mapping failed");

    assert_eq!(pool1.stat(), pool2.stat());
    assert_eq!(pool1.stat().free_pages, pool1.pages());

    drop(seg2);
    drop(seg1);
    ShmSegment::unlink(&name).ok();
}

#[test]
fn attach_rejects_foreign_segment() {
    let name = unique_name("foreign");
    let size = 16 * PAGE_SIZE;

    // A zeroed segment was never initialized as a pool.
    let seg = ShmSegment::create(&name, size).expect("segment create failed");
    let base = NonNull::new(seg.as_ptr()).expect("mapping is never null");
    // SAFETY: reads only; attach validates before touching anything.
    let result = unsafe { SlabPool::attach(base, size) };
    assert!(result.is_err());

    drop(seg);
    ShmSegment::unlink(&name).ok();
}

#[test]
fn pools_in_segments_are_visible_across_mappings() {
    let name = unique_name("visible");
    let size = 32 * PAGE_SIZE;

    let seg1 = ShmSegment::create(&name, size).expect("segment create failed");
    let base1 = NonNull::new(seg1.as_ptr()).expect("mapping is never null");
    // SAFETY: as above.
    let pool1 = unsafe { SlabPool::init(base1, size, 3) }.expect("init failed");

    let data = pool1.calloc(512).expect("calloc failed");
    // SAFETY: the allocation is 512 bytes.
    unsafe { std::ptr::write_bytes(data.as_ptr(), 0x5A, 512) };
    let offset = data.as_ptr() as usize - seg1.as_ptr() as usize;

    // The payload is visible verbatim through the other mapping.
    let seg2 = ShmSegment::open(&name, size).expect("segment open failed");
    // SAFETY: the same 512 live bytes, read through the second mapping.
    let view = unsafe { std::slice::from_raw_parts(seg2.as_ptr().add(offset), 512) };
    assert!(view.iter().all(|&b| b == 0x5A));

    // SAFETY: data came from pool1, freed exactly once.
    unsafe { pool1.free(data) }.expect("free failed");

    drop(seg2);
    drop(seg1);
    ShmSegment::unlink(&name).ok();
}
