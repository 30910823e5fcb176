// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! End-to-end slab pool scenarios: chunk classes, page runs,
//! coalescing, and the allocator's universal invariants.

use shmalloc::config::PAGE_SIZE;
use shmalloc::{HeapRegion, SlabPool};
use std::ptr::NonNull;

const MIN_SHIFT: u32 = 3;

fn make_pool(region_pages: usize) -> (HeapRegion, SlabPool) {
    let region = HeapRegion::new(region_pages * PAGE_SIZE).expect("region alloc failed");
    // SAFETY: the region is page aligned, exclusive, and returned
    // alongside the pool.
    let pool = unsafe { SlabPool::init(region.as_ptr(), region.len(), MIN_SHIFT) }
        .expect("pool init failed");
    (region, pool)
}

fn page_base(ptr: NonNull<u8>) -> usize {
    (ptr.as_ptr() as usize) & !(PAGE_SIZE - 1)
}

#[test]
fn small_chunk_round_trip_returns_page_to_free_run() {
    let (_region, pool) = make_pool(16);
    let initial = pool.stat();

    let p = pool.alloc(16).expect("alloc failed");
    assert_eq!(pool.stat().free_pages, initial.free_pages - 1);

    // SAFETY: p came from this pool and is not reused.
    unsafe { pool.free(p) }.expect("free failed");

    // The page is back on the free list as a single run,
    // indistinguishable from a never-used pool.
    assert_eq!(pool.stat(), initial);
    assert_eq!(pool.stat().free_runs, 1);
}

#[test]
fn small_page_fills_at_capacity_then_spills() {
    let (_region, pool) = make_pool(16);

    // A 4 KiB page of 16-byte chunks has 256 chunks, two of which hold
    // the bitmap: 254 usable.
    let mut ptrs = Vec::new();
    for _ in 0..254 {
        ptrs.push(pool.alloc(16).expect("alloc failed"));
    }

    let first_page = page_base(ptrs[0]);
    assert!(ptrs.iter().all(|p| page_base(*p) == first_page));
    assert_eq!(pool.stat().free_pages, pool.pages() - 1);

    // The page is full now; the next allocation demands a new page.
    let spill = pool.alloc(16).expect("alloc failed");
    assert_ne!(page_base(spill), first_page);
    assert_eq!(pool.stat().free_pages, pool.pages() - 2);

    // SAFETY: every pointer came from this pool, freed exactly once.
    unsafe {
        pool.free(spill).expect("free failed");
        for p in ptrs {
            pool.free(p).expect("free failed");
        }
    }
    assert_eq!(pool.stat().free_pages, pool.pages());
    assert_eq!(pool.stat().free_runs, 1);
}

#[test]
fn exact_page_recycles_into_big_page() {
    let (_region, pool) = make_pool(16);
    let initial = pool.stat();

    let exact = pool.alloc(64).expect("alloc failed");
    // SAFETY: exact came from this pool and is not reused.
    unsafe { pool.free(exact) }.expect("free failed");
    assert_eq!(pool.stat(), initial);

    // The freed page rejoined the free run; the big-class allocation
    // draws it afresh.
    let big = pool.alloc(128).expect("alloc failed");
    assert_eq!(page_base(big), page_base(exact));
    assert_eq!(big.as_ptr() as usize % 128, 0);
    // SAFETY: as above.
    unsafe { pool.free(big) }.expect("free failed");
    assert_eq!(pool.stat(), initial);
}

#[test]
fn single_page_run_is_page_aligned_and_coalesces() {
    let (_region, pool) = make_pool(16);
    let initial = pool.stat();

    let run = pool.alloc(PAGE_SIZE).expect("alloc failed");
    assert_eq!(run.as_ptr() as usize % PAGE_SIZE, 0);
    assert_eq!(pool.stat().free_pages, initial.free_pages - 1);

    // Freeing coalesces forward with the remaining run.
    // SAFETY: run came from this pool and is not reused.
    unsafe { pool.free(run) }.expect("free failed");
    let after = pool.stat();
    assert_eq!(after.free_pages, initial.free_pages);
    assert_eq!(after.free_runs, 1);
}

#[test]
fn adjacent_runs_freed_in_reverse_coalesce_fully() {
    let (_region, pool) = make_pool(16);
    let initial = pool.stat();

    // Two 2-page runs, back to back at the start of the page area.
    let a = pool.alloc(2 * PAGE_SIZE).expect("alloc failed");
    let b = pool.alloc(2 * PAGE_SIZE).expect("alloc failed");
    assert_eq!(
        b.as_ptr() as usize,
        a.as_ptr() as usize + 2 * PAGE_SIZE,
        "runs expected back to back"
    );
    assert_eq!(pool.stat().free_pages, initial.free_pages - 4);

    // Reverse order: b first (joins the tail), then a (joins b's run).
    // SAFETY: both runs came from this pool, freed exactly once.
    unsafe {
        pool.free(b).expect("free failed");
        pool.free(a).expect("free failed");
    }
    let after = pool.stat();
    assert_eq!(after.free_pages, initial.free_pages);
    assert_eq!(after.free_runs, 1, "everything must merge into one run");
}

#[test]
fn zero_size_requests_promote_to_min_chunk() {
    let (_region, pool) = make_pool(16);
    let a = pool.alloc(0).expect("alloc failed");
    let b = pool.alloc(0).expect("alloc failed");
    let min = pool.min_size();
    assert_eq!(a.as_ptr() as usize % min, 0);
    assert!((a.as_ptr() as usize).abs_diff(b.as_ptr() as usize) >= min);
    // SAFETY: both came from this pool, freed exactly once.
    unsafe {
        pool.free(a).expect("free failed");
        pool.free(b).expect("free failed");
    }
}

#[test]
fn half_page_uses_chunks_but_one_more_byte_uses_pages() {
    let (_region, pool) = make_pool(16);

    // Half-page requests share a page (big-class chunks).
    let a = pool.alloc(PAGE_SIZE / 2).expect("alloc failed");
    let b = pool.alloc(PAGE_SIZE / 2).expect("alloc failed");
    assert_eq!(page_base(a), page_base(b));

    // One byte more takes the page-run path.
    let c = pool.alloc(PAGE_SIZE / 2 + 1).expect("alloc failed");
    assert_eq!(c.as_ptr() as usize % PAGE_SIZE, 0);
    assert_ne!(page_base(c), page_base(a));

    // SAFETY: all three came from this pool, freed exactly once.
    unsafe {
        pool.free(a).expect("free failed");
        pool.free(b).expect("free failed");
        pool.free(c).expect("free failed");
    }
}

#[test]
fn exact_page_full_transition_relinks_on_free() {
    let (_region, pool) = make_pool(16);

    // 64 chunks of the exact class fill one page.
    let mut ptrs = Vec::new();
    for _ in 0..64 {
        ptrs.push(pool.alloc(64).expect("alloc failed"));
    }
    let first_page = page_base(ptrs[0]);
    assert!(ptrs.iter().all(|p| page_base(*p) == first_page));

    let spill = pool.alloc(64).expect("alloc failed");
    assert_ne!(page_base(spill), first_page);

    // Freeing one chunk relinks the full page; the next allocation of
    // the class lands back in it, on the same chunk.
    let victim = ptrs.swap_remove(10);
    // SAFETY: victim came from this pool; reallocated below.
    unsafe { pool.free(victim) }.expect("free failed");
    let reuse = pool.alloc(64).expect("alloc failed");
    assert_eq!(reuse, victim);

    // SAFETY: each pointer freed exactly once.
    unsafe {
        pool.free(reuse).expect("free failed");
        pool.free(spill).expect("free failed");
        for p in ptrs {
            pool.free(p).expect("free failed");
        }
    }
    assert_eq!(pool.stat().free_pages, pool.pages());
}

#[test]
fn big_class_free_preserves_shift_for_reuse() {
    let (_region, pool) = make_pool(16);

    // Two 1 KiB chunks share one big-class page (4 chunks of 1024).
    let a = pool.alloc(1024).expect("alloc failed");
    let b = pool.alloc(1024).expect("alloc failed");
    assert_eq!(page_base(a), page_base(b));

    // SAFETY: a came from this pool; reallocated below.
    unsafe { pool.free(a) }.expect("free failed");
    // The page still knows its chunk size: the slot is reused exactly.
    let again = pool.alloc(1024).expect("alloc failed");
    assert_eq!(again, a);

    // SAFETY: each pointer freed exactly once.
    unsafe {
        pool.free(again).expect("free failed");
        pool.free(b).expect("free failed");
    }
}

#[test]
fn mixed_classes_stay_disjoint() {
    let (_region, pool) = make_pool(64);
    let initial = pool.stat();

    // Live allocations of every class, each filled with its own byte.
    let sizes = [8usize, 16, 40, 64, 100, 256, 1024, 2048, 4096, 8192];
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
    for (i, &size) in sizes.iter().cycle().take(60).enumerate() {
        let ptr = pool.alloc(size).expect("alloc failed");
        let fill = (i % 251) as u8;
        // SAFETY: the allocation is at least `size` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), fill, size) };
        live.push((ptr, size, fill));
    }

    // Every allocation still carries its own fill: no two overlap.
    for &(ptr, size, fill) in &live {
        // SAFETY: the allocation is live and `size` bytes long.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
        assert!(
            bytes.iter().all(|&b| b == fill),
            "allocation of {size} bytes was overwritten"
        );
    }

    // SAFETY: each pointer freed exactly once.
    unsafe {
        for (ptr, _, _) in live {
            pool.free(ptr).expect("free failed");
        }
    }
    assert_eq!(pool.stat(), initial);
}

#[test]
fn guard_batches_operations_under_one_acquisition() {
    let (_region, pool) = make_pool(16);
    let guard = pool.lock();
    let a = guard.alloc(32).expect("alloc failed");
    let b = guard.calloc(32).expect("calloc failed");
    // SAFETY: b is 32 zeroed bytes.
    assert!(unsafe { std::slice::from_raw_parts(b.as_ptr(), 32) }
        .iter()
        .all(|&x| x == 0));
    // SAFETY: both came from this pool, freed exactly once.
    unsafe {
        guard.free(a).expect("free failed");
        guard.free(b).expect("free failed");
    }
    drop(guard);
    assert_eq!(pool.stat().free_pages, pool.pages());
}
