// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! The slab pool proper: region initialization, chunk and page-run
//! allocation, freeing with coalescing.
//!
//! # Locking
//!
//! One futex-backed mutex embedded in the region header serializes all
//! mutation, across every process mapping the region. [`SlabPool::lock`]
//! returns a guard exposing the same operations for callers that batch
//! several of them under one acquisition; the plain methods take the
//! mutex themselves.
//!
//! # Determinism
//!
//! Bitmaps are scanned from the lowest word up and from the least
//! significant bit up, and the free-run list is searched first-fit, so a
//! given sequence of operations always produces the same layout.

use super::page::{
    PageDesc, PageTag, DESC_SIZE, MAP_MASK, MAP_SHIFT, NIL, PAGE_BUSY, PAGE_FREE, PAGE_START,
    SHIFT_MASK,
};
use super::{Result, SlabError};
use crate::config::{
    EXACT_SHIFT, EXACT_SIZE, MAX_SLAB_SIZE, MIN_SHIFT_FLOOR, PAGE_SHIFT, PAGE_SIZE, SLAB_MAGIC,
    SLAB_VERSION, WORD_BITS,
};
use crate::shm::{ShmMutex, ShmMutexGuard};
use std::mem;
use std::ptr::NonNull;

/// Fully occupied bitmap word.
const BUSY_WORD: u64 = u64::MAX;

/// Region header, placed at the base of the region. `repr(C)` so every
/// process mapping the region agrees on the layout. All fields except
/// the mutex word and `log_nomem` are written once by `init` and read
/// only afterwards.
#[repr(C)]
struct PoolHeader {
    magic: u32,
    version: u32,
    mutex: ShmMutex,
    min_shift: u32,
    min_size: u32,
    n_slots: u32,
    pages: u32,
    log_nomem: u32,
    desc_off: u64,
    start_off: u64,
    end_off: u64,
}

/// Region geometry, cached out of the header at init/attach time.
/// Everything here is immutable for the life of the region.
#[derive(Clone, Copy)]
struct Geometry {
    min_shift: u32,
    min_size: usize,
    n_slots: u32,
    pages: u32,
    desc_off: usize,
    start_off: usize,
    end_off: usize,
}

/// Free-space snapshot of a pool, taken under the pool mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabStat {
    /// Usable pages in the region
    pub total_pages: u32,
    /// Pages currently on the free-run list
    pub free_pages: u32,
    /// Number of distinct free runs
    pub free_runs: u32,
}

/// Handle to a slab pool living in a caller-supplied region.
///
/// The handle does not own the region; the caller keeps the backing
/// (e.g. an [`crate::shm::ShmSegment`] or [`super::HeapRegion`]) alive
/// for as long as the pool is used.
pub struct SlabPool {
    base: NonNull<u8>,
    geo: Geometry,
}

// SAFETY: all mutation of the region goes through the mutex embedded in
// the region header; the handle itself is immutable after construction.
unsafe impl Send for SlabPool {}
unsafe impl Sync for SlabPool {}

#[cfg(feature = "debug-fill")]
#[inline]
unsafe fn junk(p: *mut u8, len: usize) {
    // SAFETY: caller passes a pointer range inside the pool region.
    unsafe { std::ptr::write_bytes(p, crate::config::JUNK_BYTE, len) }
}

#[cfg(not(feature = "debug-fill"))]
#[inline]
unsafe fn junk(_p: *mut u8, _len: usize) {}

#[inline]
fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Bitmap words needed by a Small page of the given chunk shift.
#[inline]
fn map_words(shift: u32) -> usize {
    (PAGE_SIZE >> shift) / WORD_BITS as usize
}

/// Chunks at the front of a Small page that hold its own bitmap.
#[inline]
fn bitmap_prefix_chunks(shift: u32) -> u32 {
    let n = (((PAGE_SIZE >> shift) / 8) >> shift) as u32;
    if n == 0 {
        1
    } else {
        n
    }
}

impl SlabPool {
    /// Initialize a pool in a fresh region.
    ///
    /// Lays out the slot sentinels, the free-run sentinel, and one page
    /// descriptor per page after the header, aligns the page area up to
    /// `PAGE_SIZE`, shrinks the page count if alignment overshot the
    /// descriptor reservation, and links every page into a single free
    /// run. With the `debug-fill` feature the whole area past the
    /// header is filled with the junk byte first.
    ///
    /// `min_shift` selects the smallest chunk class (`1 << min_shift`
    /// bytes); see [`crate::config::DEFAULT_MIN_SHIFT`].
    ///
    /// # Errors
    ///
    /// `BadRegion` when the base is not page aligned, `min_shift` is out
    /// of range, or the region cannot hold at least one page.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for the
    /// lifetime of the returned pool (and of every `attach`ed handle),
    /// and no other pool may be using the region.
    pub unsafe fn init(base: NonNull<u8>, len: usize, min_shift: u32) -> Result<Self> {
        if (base.as_ptr() as usize) & (PAGE_SIZE - 1) != 0 {
            return Err(SlabError::BadRegion("region base is not page aligned"));
        }
        if !(MIN_SHIFT_FLOOR..PAGE_SHIFT).contains(&min_shift) {
            return Err(SlabError::BadRegion("min_shift out of range"));
        }

        let n_slots = PAGE_SHIFT - min_shift;
        let hdr_size = mem::size_of::<PoolHeader>();
        let sentinel_size = (n_slots as usize + 1) * DESC_SIZE;
        if len < hdr_size + sentinel_size + DESC_SIZE + PAGE_SIZE {
            return Err(SlabError::BadRegion("region too small"));
        }

        // SAFETY (caller contract): base..base+len is writable.
        unsafe { junk(base.as_ptr().add(hdr_size), len - hdr_size) };

        let avail = len - hdr_size - sentinel_size;
        let mut pages = (avail / (PAGE_SIZE + DESC_SIZE)) as u32;

        let desc_off = hdr_size;
        let desc_end = desc_off + sentinel_size + pages as usize * DESC_SIZE;
        let start_off = align_up(desc_end, PAGE_SIZE);
        let end_off = len;

        // Alignment may have pushed the page area past what the
        // descriptor estimate reserved for.
        let fit = ((end_off - start_off) / PAGE_SIZE) as u32;
        if fit < pages {
            pages = fit;
        }
        if pages == 0 {
            return Err(SlabError::BadRegion("region too small"));
        }

        let header = PoolHeader {
            magic: SLAB_MAGIC,
            version: SLAB_VERSION,
            mutex: ShmMutex::new(),
            min_shift,
            min_size: 1 << min_shift,
            n_slots,
            pages,
            log_nomem: 1,
            desc_off: desc_off as u64,
            start_off: start_off as u64,
            end_off: end_off as u64,
        };
        // SAFETY: base is valid for at least the header size (checked
        // above) and suitably aligned (page alignment >= header align).
        unsafe { base.as_ptr().cast::<PoolHeader>().write(header) };

        let pool = Self {
            base,
            geo: Geometry {
                min_shift,
                min_size: 1 << min_shift,
                n_slots,
                pages,
                desc_off,
                start_off,
                end_off,
            },
        };

        // Slot sentinels and the free sentinel start as empty circular
        // lists pointing at themselves.
        for i in 0..=n_slots {
            pool.set_slab(i, 0);
            pool.set_next(i, i);
            pool.set_prev(i, i);
            pool.set_tag(i, PageTag::Page);
        }

        for d in pool.first_page()..pool.first_page() + pages {
            pool.set_slab(d, PAGE_FREE);
            pool.set_next(d, NIL);
            pool.set_prev(d, NIL);
            pool.set_tag(d, PageTag::Page);
        }

        // All pages form one free run.
        let head = pool.first_page();
        pool.set_slab(head, u64::from(pages));
        pool.push_front(pool.free_sentinel(), head);

        log::debug!(
            "[SLAB] init: {pages} pages, min chunk {} bytes",
            1usize << min_shift
        );

        Ok(pool)
    }

    /// Attach to a region another process (or an earlier handle) has
    /// already initialized.
    ///
    /// # Errors
    ///
    /// `BadRegion` on magic/version mismatch or when the mapping is
    /// shorter than the region recorded at init time.
    ///
    /// # Safety
    ///
    /// `base` must be a mapping of a region on which `init` has
    /// completed, valid for `len` bytes for the lifetime of the handle.
    pub unsafe fn attach(base: NonNull<u8>, len: usize) -> Result<Self> {
        if (base.as_ptr() as usize) & (PAGE_SIZE - 1) != 0 {
            return Err(SlabError::BadRegion("region base is not page aligned"));
        }
        if len < mem::size_of::<PoolHeader>() {
            return Err(SlabError::BadRegion("region too small"));
        }
        // SAFETY (caller contract): init completed, so the immutable
        // header fields are readable without synchronization.
        let hdr = unsafe { &*base.as_ptr().cast::<PoolHeader>() };
        if hdr.magic != SLAB_MAGIC {
            return Err(SlabError::BadRegion("bad magic"));
        }
        if hdr.version != SLAB_VERSION {
            return Err(SlabError::BadRegion("layout version mismatch"));
        }
        if hdr.end_off as usize > len || hdr.pages == 0 {
            return Err(SlabError::BadRegion("inconsistent header"));
        }

        Ok(Self {
            base,
            geo: Geometry {
                min_shift: hdr.min_shift,
                min_size: hdr.min_size as usize,
                n_slots: hdr.n_slots,
                pages: hdr.pages,
                desc_off: hdr.desc_off as usize,
                start_off: hdr.start_off as usize,
                end_off: hdr.end_off as usize,
            },
        })
    }

    /// Acquire the pool mutex, returning a guard that exposes the
    /// allocation operations without re-locking.
    pub fn lock(&self) -> SlabGuard<'_> {
        SlabGuard {
            pool: self,
            _lock: self.mutex().lock(),
        }
    }

    /// Allocate `size` bytes. Requests up to [`MAX_SLAB_SIZE`] come from
    /// a chunk page of the next power-of-two class (zero-size requests
    /// are promoted to the minimum chunk); larger requests take a run of
    /// whole pages.
    ///
    /// Returns `None` when the region is exhausted (logged at error
    /// level unless suppressed via [`SlabPool::set_log_nomem`]).
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.lock().alloc(size)
    }

    /// [`SlabPool::alloc`] followed by zeroing of `size` bytes.
    pub fn calloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.lock().calloc(size)
    }

    /// Return an allocation to the pool.
    ///
    /// # Errors
    ///
    /// Rejects pointers outside the page area, misaligned pointers,
    /// double frees, and pointers into the middle of a page run; every
    /// rejection is logged and leaves the pool unmodified.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc`/`calloc` on a handle to this region
    /// and must not be used after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.lock().free(ptr) }
    }

    /// Free-space snapshot.
    #[must_use]
    pub fn stat(&self) -> SlabStat {
        self.lock().stat()
    }

    /// Enable or disable the critical "no memory" log on exhaustion.
    pub fn set_log_nomem(&self, enabled: bool) {
        let _lock = self.mutex().lock();
        // SAFETY: header is valid for the pool's lifetime; the field is
        // only touched under the pool mutex.
        unsafe { (*self.header()).log_nomem = u32::from(enabled) };
    }

    /// Smallest chunk size served by this pool.
    #[inline]
    #[must_use]
    pub fn min_size(&self) -> usize {
        self.geo.min_size
    }

    /// Usable page count.
    #[inline]
    #[must_use]
    pub fn pages(&self) -> u32 {
        self.geo.pages
    }

    // ------------------------------------------------------------------
    // Region access. The pool owns no memory; everything below reads and
    // writes the caller's region through raw pointers. Descriptor
    // indices are bounds-checked in debug builds; list invariants keep
    // them in range in release builds.
    // ------------------------------------------------------------------

    #[inline]
    fn header(&self) -> *mut PoolHeader {
        self.base.as_ptr().cast()
    }

    #[inline]
    fn mutex(&self) -> &ShmMutex {
        // SAFETY: the header outlives the handle (init/attach contract)
        // and the mutex word is only accessed atomically.
        unsafe { &(*self.header()).mutex }
    }

    #[inline]
    fn desc(&self, i: u32) -> *mut PageDesc {
        debug_assert!(i < self.geo.n_slots + 1 + self.geo.pages);
        // SAFETY: the descriptor table spans indices
        // 0..n_slots+1+pages inside the region (established by init).
        unsafe {
            self.base
                .as_ptr()
                .add(self.geo.desc_off)
                .cast::<PageDesc>()
                .add(i as usize)
        }
    }

    #[inline]
    fn slab(&self, i: u32) -> u64 {
        // SAFETY: desc(i) is in bounds; mutation is serialized by the
        // pool mutex.
        unsafe { (*self.desc(i)).slab }
    }

    #[inline]
    fn set_slab(&self, i: u32, v: u64) {
        // SAFETY: as above.
        unsafe { (*self.desc(i)).slab = v }
    }

    #[inline]
    fn next(&self, i: u32) -> u32 {
        // SAFETY: as above.
        unsafe { (*self.desc(i)).next }
    }

    #[inline]
    fn set_next(&self, i: u32, v: u32) {
        // SAFETY: as above.
        unsafe { (*self.desc(i)).next = v }
    }

    #[inline]
    fn prev(&self, i: u32) -> u32 {
        // SAFETY: as above.
        unsafe { (*self.desc(i)).prev }
    }

    #[inline]
    fn set_prev(&self, i: u32, v: u32) {
        // SAFETY: as above.
        unsafe { (*self.desc(i)).prev = v }
    }

    #[inline]
    fn tag(&self, i: u32) -> PageTag {
        // SAFETY: as above.
        PageTag::from_raw(unsafe { (*self.desc(i)).tag })
    }

    #[inline]
    fn set_tag(&self, i: u32, t: PageTag) {
        // SAFETY: as above.
        unsafe { (*self.desc(i)).tag = t as u32 }
    }

    /// Index of the free-run list sentinel (right after the slot
    /// sentinels).
    #[inline]
    fn free_sentinel(&self) -> u32 {
        self.geo.n_slots
    }

    /// Descriptor index of page 0.
    #[inline]
    fn first_page(&self) -> u32 {
        self.geo.n_slots + 1
    }

    /// Base address of the page behind descriptor `d`.
    #[inline]
    fn page_data(&self, d: u32) -> *mut u8 {
        let idx = (d - self.first_page()) as usize;
        debug_assert!(idx < self.geo.pages as usize);
        // SAFETY: the page area spans start_off..start_off+pages*PAGE_SIZE
        // inside the region.
        unsafe { self.base.as_ptr().add(self.geo.start_off + idx * PAGE_SIZE) }
    }

    /// Remove `d` from whatever circular list it is on.
    fn unlink(&self, d: u32) {
        let p = self.prev(d);
        let n = self.next(d);
        self.set_next(p, n);
        self.set_prev(n, p);
    }

    /// Link `d` as the first element after `sentinel`.
    fn push_front(&self, sentinel: u32, d: u32) {
        let n = self.next(sentinel);
        self.set_next(d, n);
        self.set_prev(d, sentinel);
        self.set_prev(n, d);
        self.set_next(sentinel, d);
    }

    // ------------------------------------------------------------------
    // Allocation. All methods below run under the pool mutex.
    // ------------------------------------------------------------------

    fn alloc_in(&self, size: usize) -> Option<NonNull<u8>> {
        let raw = if size > MAX_SLAB_SIZE {
            let count = (size >> PAGE_SHIFT) + usize::from(size & (PAGE_SIZE - 1) != 0);
            if count > self.geo.pages as usize {
                self.report_nomem();
                return None;
            }
            let d = self.alloc_pages(count as u32)?;
            self.page_data(d)
        } else {
            let (shift, slot) = self.chunk_class(size);
            self.alloc_chunk(shift, slot)?
        };
        log::debug!("[SLAB] alloc {size}: {raw:p}");
        NonNull::new(raw)
    }

    /// Promote the request to its chunk class: `(shift, slot)`.
    fn chunk_class(&self, size: usize) -> (u32, u32) {
        if size > self.geo.min_size {
            let shift = usize::BITS - (size - 1).leading_zeros();
            (shift, shift - self.geo.min_shift)
        } else {
            (self.geo.min_shift, 0)
        }
    }

    fn alloc_chunk(&self, shift: u32, slot: u32) -> Option<*mut u8> {
        // The slot sentinel heads the circular list of partial pages of
        // this class; by invariant the first page has a free chunk.
        let sentinel = slot;
        let mut d = self.next(sentinel);
        while d != sentinel {
            let found = if shift < EXACT_SHIFT {
                self.scan_small(d, shift)
            } else if shift == EXACT_SHIFT {
                self.scan_exact(d)
            } else {
                self.scan_big(d, shift)
            };
            if found.is_some() {
                return found;
            }
            d = self.next(d);
        }
        self.grow_slot(shift, slot)
    }

    /// Take the lowest free chunk of a Small page, unlinking the page
    /// when it fills up.
    fn scan_small(&self, d: u32, shift: u32) -> Option<*mut u8> {
        let data = self.page_data(d);
        let bitmap = data.cast::<u64>();
        let words = map_words(shift);
        for n in 0..words {
            // SAFETY: the first `words` u64 of the page are its bitmap,
            // reserved at page initialization in grow_slot.
            let w = unsafe { bitmap.add(n).read() };
            if w != BUSY_WORD {
                let bit = (!w).trailing_zeros();
                let updated = w | (1u64 << bit);
                // SAFETY: as above.
                unsafe { bitmap.add(n).write(updated) };

                if updated == BUSY_WORD && self.small_rest_full(bitmap, n + 1, words) {
                    self.unlink(d);
                    self.set_next(d, NIL);
                    self.set_prev(d, NIL);
                    self.set_tag(d, PageTag::Small);
                }

                let chunk = n as u32 * WORD_BITS + bit;
                // SAFETY: chunk < PAGE_SIZE >> shift, so the offset
                // stays inside this page.
                return Some(unsafe { data.add((chunk as usize) << shift) });
            }
        }
        None
    }

    fn small_rest_full(&self, bitmap: *const u64, from: usize, words: usize) -> bool {
        for n in from..words {
            // SAFETY: n < words, within the page's bitmap.
            if unsafe { bitmap.add(n).read() } != BUSY_WORD {
                return false;
            }
        }
        true
    }

    fn scan_exact(&self, d: u32) -> Option<*mut u8> {
        let s = self.slab(d);
        if s == BUSY_WORD {
            return None;
        }
        let bit = (!s).trailing_zeros();
        let updated = s | (1u64 << bit);
        self.set_slab(d, updated);
        if updated == BUSY_WORD {
            self.unlink(d);
            self.set_next(d, NIL);
            self.set_prev(d, NIL);
            self.set_tag(d, PageTag::Exact);
        }
        // SAFETY: bit < 64 and 64 << EXACT_SHIFT == PAGE_SIZE.
        Some(unsafe { self.page_data(d).add((bit as usize) << EXACT_SHIFT) })
    }

    fn scan_big(&self, d: u32, shift: u32) -> Option<*mut u8> {
        let chunks = (PAGE_SIZE >> shift) as u32;
        let mask = ((1u64 << chunks) - 1) << MAP_SHIFT;
        let s = self.slab(d);
        if s & mask == mask {
            return None;
        }
        let bit = (!s & mask).trailing_zeros();
        let updated = s | (1u64 << bit);
        self.set_slab(d, updated);
        if updated & mask == mask {
            self.unlink(d);
            self.set_next(d, NIL);
            self.set_prev(d, NIL);
            self.set_tag(d, PageTag::Big);
        }
        let chunk = bit - MAP_SHIFT;
        // SAFETY: chunk < chunks, inside this page.
        Some(unsafe { self.page_data(d).add((chunk as usize) << shift) })
    }

    /// Take a fresh page for the class, reserve its metadata, link it as
    /// the sole partial page of the slot, and hand out the first usable
    /// chunk.
    fn grow_slot(&self, shift: u32, slot: u32) -> Option<*mut u8> {
        let d = self.alloc_pages(1)?;
        let data = self.page_data(d);

        if shift < EXACT_SHIFT {
            let bitmap = data.cast::<u64>();
            let prefix = bitmap_prefix_chunks(shift);
            // The prefix chunks hold the bitmap itself; one more bit
            // marks the chunk handed out right now.
            // SAFETY: the bitmap words lie at the front of the page.
            unsafe { bitmap.write((2u64 << prefix) - 1) };
            for n in 1..map_words(shift) {
                // SAFETY: as above.
                unsafe { bitmap.add(n).write(0) };
            }
            self.set_slab(d, u64::from(shift));
            self.set_tag(d, PageTag::Small);
            self.push_front(slot, d);
            // SAFETY: prefix chunks fit in the page by construction.
            Some(unsafe { data.add((prefix as usize) << shift) })
        } else if shift == EXACT_SHIFT {
            self.set_slab(d, 1);
            self.set_tag(d, PageTag::Exact);
            self.push_front(slot, d);
            Some(data)
        } else {
            self.set_slab(d, (1u64 << MAP_SHIFT) | u64::from(shift));
            self.set_tag(d, PageTag::Big);
            self.push_front(slot, d);
            Some(data)
        }
    }

    /// First-fit search of the free-run list for `count` contiguous
    /// pages. A longer run is split; the leading pages become the
    /// allocated run, the tail stays free.
    fn alloc_pages(&self, count: u32) -> Option<u32> {
        let free = self.free_sentinel();
        let mut d = self.next(free);
        while d != free {
            let run = self.slab(d) as u32;
            if run >= count {
                if run > count {
                    // Tail backreference of the shortened run, then the
                    // new head takes over the list links.
                    self.set_prev(d + run - 1, d + count);
                    self.set_slab(d + count, u64::from(run - count));
                    self.set_next(d + count, self.next(d));
                    self.set_prev(d + count, self.prev(d));
                    self.set_tag(d + count, PageTag::Page);
                    let p = self.prev(d);
                    self.set_next(p, d + count);
                    self.set_prev(self.next(d), d + count);
                } else {
                    self.unlink(d);
                }

                self.set_slab(d, u64::from(count) | PAGE_START);
                self.set_next(d, NIL);
                self.set_prev(d, NIL);
                self.set_tag(d, PageTag::Page);
                for t in d + 1..d + count {
                    self.set_slab(t, PAGE_BUSY);
                    self.set_next(t, NIL);
                    self.set_prev(t, NIL);
                    self.set_tag(t, PageTag::Page);
                }
                return Some(d);
            }
            d = self.next(d);
        }

        self.report_nomem();
        None
    }

    fn report_nomem(&self) {
        // SAFETY: header is valid; the field is read under the mutex.
        if unsafe { (*self.header()).log_nomem } != 0 {
            log::error!("[SLAB] alloc failed: no memory");
        }
    }

    /// Return a run of `count` pages headed by `d` to the free list,
    /// coalescing with the adjacent runs.
    fn free_pages(&self, d: u32, count: u32) {
        self.set_slab(d, u64::from(count));
        for t in d + 1..d + count {
            self.set_slab(t, PAGE_FREE);
            self.set_next(t, NIL);
            self.set_prev(t, NIL);
            self.set_tag(t, PageTag::Page);
        }
        if self.next(d) != NIL {
            self.unlink(d);
        }
        self.set_tag(d, PageTag::Page);

        let mut head = d;
        let last = self.first_page() + self.geo.pages;

        // Forward: the descriptor just past the run is a free-run head
        // iff it is linked.
        let join = d + count;
        if join < last && self.tag(join) == PageTag::Page && self.next(join) != NIL {
            self.set_slab(head, self.slab(head) + self.slab(join));
            self.unlink(join);
            self.set_slab(join, PAGE_FREE);
            self.set_next(join, NIL);
            self.set_prev(join, NIL);
        }

        // Backward: the descriptor just before is either a free run's
        // head, or its tail carrying the head's index.
        if head > self.first_page() {
            let mut join = head - 1;
            if self.tag(join) == PageTag::Page && self.slab(join) != PAGE_BUSY {
                if self.slab(join) == PAGE_FREE {
                    join = self.prev(join);
                }
                if join != NIL && self.next(join) != NIL {
                    self.set_slab(join, self.slab(join) + self.slab(head));
                    self.unlink(join);
                    self.set_slab(head, PAGE_FREE);
                    self.set_next(head, NIL);
                    self.set_prev(head, NIL);
                    head = join;
                }
            }
        }

        // The run's last page remembers its head for later backward
        // coalescing.
        let total = self.slab(head) as u32;
        if total > 1 {
            self.set_prev(head + total - 1, head);
        }
        self.push_front(self.free_sentinel(), head);
    }

    // ------------------------------------------------------------------
    // Freeing
    // ------------------------------------------------------------------

    unsafe fn free_in(&self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let start = self.base.as_ptr() as usize + self.geo.start_off;
        let end = self.base.as_ptr() as usize + self.geo.end_off;
        if addr < start || addr >= end {
            return Err(self.reject(SlabError::OutsideRegion));
        }
        let page_idx = ((addr - start) >> PAGE_SHIFT) as u32;
        if page_idx >= self.geo.pages {
            return Err(self.reject(SlabError::OutsideRegion));
        }
        let d = self.first_page() + page_idx;

        log::debug!("[SLAB] free: {ptr:p}");

        let result = match self.tag(d) {
            PageTag::Small => self.free_small(d, addr),
            PageTag::Exact => self.free_exact(d, addr),
            PageTag::Big => self.free_big(d, addr),
            PageTag::Page => self.free_run(d, addr),
        };
        result.map_err(|e| self.reject(e))
    }

    fn reject(&self, e: SlabError) -> SlabError {
        log::error!("[SLAB] free: {e}");
        e
    }

    fn free_small(&self, d: u32, addr: usize) -> Result<()> {
        let shift = (self.slab(d) & SHIFT_MASK) as u32;
        let size = 1usize << shift;
        if addr & (size - 1) != 0 {
            return Err(SlabError::WrongChunk);
        }

        let chunk = (addr & (PAGE_SIZE - 1)) >> shift;
        let word = chunk / WORD_BITS as usize;
        let mask = 1u64 << (chunk % WORD_BITS as usize);
        let bitmap = self.page_data(d).cast::<u64>();

        // SAFETY: word < map_words(shift), within the page's bitmap.
        let w = unsafe { bitmap.add(word).read() };
        if w & mask == 0 {
            return Err(SlabError::AlreadyFree);
        }

        // A full page re-enters its slot list on the first free.
        if self.next(d) == NIL {
            let slot = shift - self.geo.min_shift;
            self.push_front(slot, d);
            self.set_tag(d, PageTag::Small);
        }

        // SAFETY: as above.
        unsafe { bitmap.add(word).write(w & !mask) };
        // SAFETY: the chunk lies inside the page and is no longer live.
        unsafe { junk(addr as *mut u8, size) };

        // Page is empty when no data bit beyond the bitmap prefix is
        // set in any word.
        let prefix = bitmap_prefix_chunks(shift);
        // SAFETY: word 0 of the bitmap.
        if unsafe { bitmap.read() } & !((1u64 << prefix) - 1) != 0 {
            return Ok(());
        }
        for n in 1..map_words(shift) {
            // SAFETY: n < map_words(shift).
            if unsafe { bitmap.add(n).read() } != 0 {
                return Ok(());
            }
        }
        self.free_pages(d, 1);
        Ok(())
    }

    fn free_exact(&self, d: u32, addr: usize) -> Result<()> {
        if addr & (EXACT_SIZE - 1) != 0 {
            return Err(SlabError::WrongChunk);
        }
        let mask = 1u64 << ((addr & (PAGE_SIZE - 1)) >> EXACT_SHIFT);
        let s = self.slab(d);
        if s & mask == 0 {
            return Err(SlabError::AlreadyFree);
        }

        if s == BUSY_WORD {
            let slot = EXACT_SHIFT - self.geo.min_shift;
            self.push_front(slot, d);
            self.set_tag(d, PageTag::Exact);
        }

        let updated = s & !mask;
        self.set_slab(d, updated);
        // SAFETY: the chunk lies inside the page and is no longer live.
        unsafe { junk(addr as *mut u8, EXACT_SIZE) };

        if updated != 0 {
            return Ok(());
        }
        self.free_pages(d, 1);
        Ok(())
    }

    fn free_big(&self, d: u32, addr: usize) -> Result<()> {
        let s = self.slab(d);
        let shift = (s & SHIFT_MASK) as u32;
        let size = 1usize << shift;
        if addr & (size - 1) != 0 {
            return Err(SlabError::WrongChunk);
        }

        let mask = 1u64 << ((((addr & (PAGE_SIZE - 1)) >> shift) as u32) + MAP_SHIFT);
        if s & mask == 0 {
            return Err(SlabError::AlreadyFree);
        }

        if self.next(d) == NIL {
            let slot = shift - self.geo.min_shift;
            self.push_front(slot, d);
            self.set_tag(d, PageTag::Big);
        }

        let updated = s & !mask;
        self.set_slab(d, updated);
        // SAFETY: the chunk lies inside the page and is no longer live.
        unsafe { junk(addr as *mut u8, size) };

        // Only high-half bits count; the low bits keep the shift.
        if updated & MAP_MASK != 0 {
            return Ok(());
        }
        self.free_pages(d, 1);
        Ok(())
    }

    fn free_run(&self, d: u32, addr: usize) -> Result<()> {
        if addr & (PAGE_SIZE - 1) != 0 {
            return Err(SlabError::WrongChunk);
        }
        let s = self.slab(d);
        if s == PAGE_FREE {
            return Err(SlabError::AlreadyFree);
        }
        if s == PAGE_BUSY {
            return Err(SlabError::WrongPage);
        }
        if s & PAGE_START == 0 {
            // A linked free-run head: freeing it again is a double free.
            return Err(SlabError::AlreadyFree);
        }

        let count = (s & !PAGE_START) as u32;
        self.free_pages(d, count);
        // SAFETY: the whole run lies inside the page area and is no
        // longer live.
        unsafe { junk(addr as *mut u8, (count as usize) << PAGE_SHIFT) };
        Ok(())
    }

    fn stat_in(&self) -> SlabStat {
        let free = self.free_sentinel();
        let mut free_pages = 0u32;
        let mut free_runs = 0u32;
        let mut d = self.next(free);
        while d != free {
            free_runs += 1;
            free_pages += self.slab(d) as u32;
            d = self.next(d);
        }
        SlabStat {
            total_pages: self.geo.pages,
            free_pages,
            free_runs,
        }
    }
}

/// The pool with its mutex held. Created by [`SlabPool::lock`]; the
/// mutex is released on drop.
pub struct SlabGuard<'a> {
    pool: &'a SlabPool,
    _lock: ShmMutexGuard<'a>,
}

impl SlabGuard<'_> {
    /// As [`SlabPool::alloc`], without re-taking the mutex.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.pool.alloc_in(size)
    }

    /// As [`SlabPool::calloc`], without re-taking the mutex.
    pub fn calloc(&self, size: usize) -> Option<NonNull<u8>> {
        let p = self.pool.alloc_in(size)?;
        // SAFETY: p points at an allocation of at least `size` bytes.
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0, size) };
        Some(p)
    }

    /// As [`SlabPool::free`], without re-taking the mutex.
    ///
    /// # Errors
    ///
    /// See [`SlabPool::free`].
    ///
    /// # Safety
    ///
    /// See [`SlabPool::free`].
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.pool.free_in(ptr) }
    }

    /// As [`SlabPool::stat`], without re-taking the mutex.
    #[must_use]
    pub fn stat(&self) -> SlabStat {
        self.pool.stat_in()
    }
}

#[cfg(test)]
mod tests {
    use super::super::HeapRegion;
    use super::*;
    use crate::config::DEFAULT_MIN_SHIFT;

    fn pool(pages: usize) -> (HeapRegion, SlabPool) {
        // Header + descriptors consume part of the region, so size it
        // with slack.
        let region = HeapRegion::new((pages + 2) * PAGE_SIZE).expect("region alloc failed");
        // SAFETY: the region is page aligned, exclusive, and outlives
        // the pool (both are returned together).
        let pool =
            unsafe { SlabPool::init(region.as_ptr(), region.len(), DEFAULT_MIN_SHIFT) }
                .expect("init failed");
        (region, pool)
    }

    #[test]
    fn test_init_geometry() {
        let (_r, p) = pool(8);
        assert!(p.pages() >= 8);
        let stat = p.stat();
        assert_eq!(stat.free_pages, p.pages());
        assert_eq!(stat.free_runs, 1);
    }

    #[test]
    fn test_init_rejects_unaligned_base() {
        let region = HeapRegion::new(8 * PAGE_SIZE).expect("region alloc failed");
        let off = unsafe { NonNull::new_unchecked(region.as_ptr().as_ptr().add(8)) };
        // SAFETY: the pointer is valid; init must reject it before any
        // write.
        let err = unsafe { SlabPool::init(off, region.len() - 8, DEFAULT_MIN_SHIFT) };
        assert!(matches!(err, Err(SlabError::BadRegion(_))));
    }

    #[test]
    fn test_chunk_class_promotion() {
        let (_r, p) = pool(8);
        // Zero and tiny requests promote to the minimum class.
        assert_eq!(p.chunk_class(0), (DEFAULT_MIN_SHIFT, 0));
        assert_eq!(p.chunk_class(8), (DEFAULT_MIN_SHIFT, 0));
        assert_eq!(p.chunk_class(9), (4, 1));
        assert_eq!(p.chunk_class(2048), (11, 8));
    }

    #[test]
    fn test_alloc_alignment() {
        let (_r, p) = pool(8);
        for size in [1usize, 8, 16, 64, 100, 128, 2048] {
            let ptr = p.alloc(size).expect("alloc failed");
            let class = size.next_power_of_two().max(p.min_size());
            assert_eq!(
                ptr.as_ptr() as usize % class,
                0,
                "allocation of {size} not aligned to {class}"
            );
        }
    }

    #[test]
    fn test_alloc_free_round_trip() {
        let (_r, p) = pool(8);
        let before = p.stat();
        let ptr = p.alloc(100).expect("alloc failed");
        // SAFETY: ptr came from this pool and is not reused.
        unsafe { p.free(ptr) }.expect("free failed");
        assert_eq!(p.stat(), before);
    }

    #[test]
    fn test_distinct_chunks_disjoint() {
        let (_r, p) = pool(8);
        let a = p.alloc(64).expect("alloc failed").as_ptr() as usize;
        let b = p.alloc(64).expect("alloc failed").as_ptr() as usize;
        let c = p.alloc(64).expect("alloc failed").as_ptr() as usize;
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(a.abs_diff(b) >= 64 && b.abs_diff(c) >= 64);
    }

    #[test]
    fn test_free_rejects_foreign_pointer() {
        let (_r, p) = pool(8);
        let outside = NonNull::<u8>::dangling();
        // SAFETY: the pointer is rejected before any region write.
        let err = unsafe { p.free(outside) };
        assert_eq!(err, Err(SlabError::OutsideRegion));
    }

    #[test]
    fn test_free_rejects_misaligned_chunk() {
        let (_r, p) = pool(8);
        let ptr = p.alloc(64).expect("alloc failed");
        let off = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(1)) };
        // SAFETY: the pointer is rejected before any region write.
        let err = unsafe { p.free(off) };
        assert_eq!(err, Err(SlabError::WrongChunk));
        // The original pointer is still valid to free.
        unsafe { p.free(ptr) }.expect("free failed");
    }

    #[test]
    fn test_double_free_detected() {
        let (_r, p) = pool(8);
        let ptr = p.alloc(64).expect("alloc failed");
        unsafe { p.free(ptr) }.expect("free failed");
        let err = unsafe { p.free(ptr) };
        assert!(matches!(err, Err(SlabError::AlreadyFree)));
    }

    #[test]
    fn test_page_run_free_of_tail_rejected() {
        let (_r, p) = pool(8);
        let ptr = p.alloc(2 * PAGE_SIZE).expect("alloc failed");
        let tail = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(PAGE_SIZE)) };
        // SAFETY: the pointer is rejected before any region write.
        let err = unsafe { p.free(tail) };
        assert_eq!(err, Err(SlabError::WrongPage));
        unsafe { p.free(ptr) }.expect("free failed");
    }

    #[test]
    fn test_calloc_zeroes() {
        let (_r, p) = pool(8);
        let ptr = p.alloc(64).expect("alloc failed");
        // Dirty the chunk, free it, then calloc the same class.
        // SAFETY: the chunk is 64 bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xEE, 64) };
        unsafe { p.free(ptr) }.expect("free failed");
        let ptr2 = p.calloc(64).expect("calloc failed");
        let slice = unsafe { std::slice::from_raw_parts(ptr2.as_ptr(), 64) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let (_r, p) = pool(4);
        p.set_log_nomem(false);
        let total = p.pages() as usize;
        let mut runs = Vec::new();
        for _ in 0..total {
            runs.push(p.alloc(PAGE_SIZE).expect("alloc failed"));
        }
        assert!(p.alloc(PAGE_SIZE).is_none());
        for ptr in runs {
            unsafe { p.free(ptr) }.expect("free failed");
        }
        assert_eq!(p.stat().free_pages, p.pages());
    }

    #[test]
    fn test_attach_sees_same_pool() {
        let (r, p) = pool(8);
        // SAFETY: the region stays alive and init has completed.
        let other = unsafe { SlabPool::attach(r.as_ptr(), r.len()) }.expect("attach failed");
        let ptr = p.alloc(128).expect("alloc failed");
        // The attached handle can free what the first handle allocated.
        unsafe { other.free(ptr) }.expect("free failed");
        assert_eq!(other.stat(), p.stat());
    }

    #[test]
    fn test_attach_rejects_uninitialized() {
        let region = HeapRegion::new(8 * PAGE_SIZE).expect("region alloc failed");
        // SAFETY: reads only.
        let err = unsafe { SlabPool::attach(region.as_ptr(), region.len()) };
        assert!(matches!(err, Err(SlabError::BadRegion(_))));
    }
}
