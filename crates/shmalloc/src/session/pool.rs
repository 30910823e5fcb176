// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! The session pool proper: block table, bump allocation, per-size
//! free-list heads, backward coalescing, and the process-wide pool
//! table that lets [`free`] route a bare pointer to its owner.
//!
//! # Locking
//!
//! Locks are fine-grained: the block table and the head index are each
//! behind a `RwLock`, and every block and every head carries its own
//! mutex. Head locks are only ever taken while holding a block lock
//! (the coalescing path), never the other way around, so the order is
//! acyclic. A pool serves one session, so chunk-level lifecycle races
//! are excluded by construction; the locks make the bookkeeping itself
//! safe to share.

use super::header::{chunk_span, ChunkHeader, ChunkType, HDR_SIZE, PSIZE_LIMIT};
use super::ops::BlockOps;
use super::{PoolError, Result};
use crate::config::{HEAD_MAX, OBJ_MIN_SIZE, POOL_MAGIC, POOL_TABLE_MAX, POOL_16K, POOL_1K, POOL_4K, POOL_64K};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock, Weak};

/// `pos` value of a block that has been emptied and is on its way out.
const RETIRED: usize = usize::MAX;

/// Preset pool geometries, one per session weight class. The zone
/// ladder seeds the free-list head index so steady-state frees of the
/// common sizes never have to create a head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolClass {
    /// 1 KiB blocks, zones 16/32/64/128 (lightweight sessions, many of
    /// them)
    K1,
    /// 4 KiB blocks, zones 64/128/256/512
    K4,
    /// 16 KiB blocks, zones 256/512/1024/2048
    K16,
    /// 64 KiB blocks, zones 1024/2048/4096/8192
    K64,
}

impl PoolClass {
    /// `(block_size, zone ladder)` for the class.
    #[must_use]
    pub fn geometry(self) -> (usize, [usize; 4]) {
        match self {
            Self::K1 => POOL_1K,
            Self::K4 => POOL_4K,
            Self::K16 => POOL_16K,
            Self::K64 => POOL_64K,
        }
    }
}

/// Intrusive free-list links, written into the payload of a freed
/// chunk. The 24-byte payload floor guarantees they fit.
#[repr(C)]
struct FreeNode {
    next: Option<NonNull<FreeNode>>,
    prev: Option<NonNull<FreeNode>>,
}

/// Doubly-linked list of freed chunks of one size.
struct FreeList {
    first: Option<NonNull<FreeNode>>,
}

impl FreeList {
    const fn new() -> Self {
        Self { first: None }
    }

    fn push_front(&mut self, node: NonNull<FreeNode>) {
        // SAFETY: node points into the payload of a freed chunk owned
        // by this list's pool; list surgery happens under the head lock.
        unsafe {
            (*node.as_ptr()).next = self.first;
            (*node.as_ptr()).prev = None;
            if let Some(f) = self.first {
                (*f.as_ptr()).prev = Some(node);
            }
        }
        self.first = Some(node);
    }

    fn pop_front(&mut self) -> Option<NonNull<FreeNode>> {
        let node = self.first?;
        // SAFETY: as in push_front.
        unsafe {
            self.first = (*node.as_ptr()).next;
            if let Some(f) = self.first {
                (*f.as_ptr()).prev = None;
            }
        }
        Some(node)
    }

    /// # Safety
    ///
    /// `node` must currently be linked in this list.
    unsafe fn remove(&mut self, node: NonNull<FreeNode>) {
        // SAFETY: caller contract plus the head lock.
        unsafe {
            let FreeNode { next, prev } = node.as_ptr().read();
            match prev {
                Some(p) => (*p.as_ptr()).next = next,
                None => self.first = next,
            }
            if let Some(n) = next {
                (*n.as_ptr()).prev = prev;
            }
        }
    }
}

/// Free-list head for one chunk size.
struct Head {
    size: usize,
    list: Mutex<FreeList>,
}

impl Head {
    fn new(size: usize) -> Self {
        Self {
            size,
            list: Mutex::new(FreeList::new()),
        }
    }
}

// SAFETY: the raw links point into block memory owned by the pool; all
// access goes through the head mutex.
unsafe impl Send for Head {}
unsafe impl Sync for Head {}

struct BlockState {
    /// Bump offset of the next chunk; RETIRED once the block is emptied
    pos: usize,
    /// Payload span of the most recently bumped chunk (0 in a fresh
    /// block), recorded as the next chunk's `psize`
    prev_span: u32,
}

struct Block {
    base: NonNull<u8>,
    size: usize,
    ops: Arc<dyn BlockOps>,
    state: Mutex<BlockState>,
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: base/size are exactly what ops.alloc returned for
        // this block.
        unsafe { self.ops.free(self.base, self.size) };
    }
}

// SAFETY: block memory is owned by the pool; the bump state is behind
// the block mutex.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

struct BlockTable {
    slots: Vec<Option<Arc<Block>>>,
    cur: Option<usize>,
}

/// Per-session allocator. Construct with [`SessionPool::new`] or
/// [`SessionPool::with_class`]; free through the module-level [`free`],
/// which recovers the owning pool from the chunk header.
pub struct SessionPool {
    magic: u32,
    idx: u8,
    block_size: usize,
    ops: Arc<dyn BlockOps>,
    blocks: RwLock<BlockTable>,
    root: RwLock<BTreeMap<usize, Arc<Head>>>,
    /// Header addresses of live oversized chunks served directly by
    /// `ops`
    externals: Mutex<Vec<usize>>,
}

/// Process-wide pool table; the 8-bit `pool` field of every chunk
/// header indexes into it.
fn pool_table() -> &'static RwLock<Vec<Weak<SessionPool>>> {
    static POOLS: OnceLock<RwLock<Vec<Weak<SessionPool>>>> = OnceLock::new();
    POOLS.get_or_init(|| RwLock::new(Vec::new()))
}

fn lookup(idx: u8) -> Option<Arc<SessionPool>> {
    pool_table().read().get(idx as usize)?.upgrade()
}

impl SessionPool {
    /// Create a pool drawing `block_size`-byte blocks from `ops`.
    ///
    /// # Panics
    ///
    /// Panics when `block_size` is not a multiple of 16 in
    /// `[64, 4 MiB]` (the header's `psize` field bounds the block
    /// size).
    ///
    /// # Errors
    ///
    /// `NoMem` when the process-wide pool table is full.
    pub fn new(block_size: usize, ops: Arc<dyn BlockOps>) -> Result<Arc<Self>> {
        assert!(
            block_size >= 4 * OBJ_MIN_SIZE
                && block_size <= PSIZE_LIMIT + 1
                && block_size % OBJ_MIN_SIZE == 0,
            "invalid block size {block_size}"
        );

        let mut table = pool_table().write();
        let idx = table
            .iter()
            .position(|w| w.strong_count() == 0)
            .unwrap_or(table.len());
        if idx >= POOL_TABLE_MAX {
            return Err(PoolError::NoMem);
        }

        let pool = Arc::new(Self {
            magic: POOL_MAGIC,
            idx: idx as u8,
            block_size,
            ops,
            blocks: RwLock::new(BlockTable {
                slots: Vec::new(),
                cur: None,
            }),
            root: RwLock::new(BTreeMap::new()),
            externals: Mutex::new(Vec::new()),
        });

        if idx == table.len() {
            table.push(Arc::downgrade(&pool));
        } else {
            table[idx] = Arc::downgrade(&pool);
        }

        Ok(pool)
    }

    /// Create a pool with a preset geometry, seeding the head index
    /// with the class's zone ladder.
    ///
    /// # Errors
    ///
    /// As [`SessionPool::new`].
    pub fn with_class(class: PoolClass, ops: Arc<dyn BlockOps>) -> Result<Arc<Self>> {
        let (block_size, zones) = class.geometry();
        let pool = Self::new(block_size, ops)?;
        {
            let mut root = pool.root.write();
            for zone in zones {
                let payload = chunk_span(zone) - HDR_SIZE;
                root.entry(payload)
                    .or_insert_with(|| Arc::new(Head::new(payload)));
            }
        }
        Ok(pool)
    }

    /// Block size this pool was created with.
    #[inline]
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocate `size` bytes.
    ///
    /// A matching free-list head is popped in O(1); otherwise the
    /// request is bumped off the current block (adding a block when
    /// needed). Requests too large for a block go straight to the
    /// backing allocator.
    ///
    /// # Errors
    ///
    /// `AllocBlock` when a new block cannot be obtained, `SizeTooBig`
    /// when an oversized request is refused by the backing allocator
    /// too.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        if size > i32::MAX as usize / 2 {
            return Err(PoolError::SizeTooBig);
        }
        let payload = chunk_span(size) - HDR_SIZE;

        if let Some(ptr) = self.pop_head(payload) {
            return Ok(ptr);
        }

        // A chunk must fit in a block alongside the block's own header.
        if payload + 2 * HDR_SIZE > self.block_size {
            return self.alloc_external(payload);
        }

        self.alloc_from_block(payload)
    }

    /// Release every block and external chunk. Heads and free chunks go
    /// away with their blocks. Runs automatically when the last `Arc`
    /// drops.
    pub fn fini(&self) {
        self.root.write().clear();

        let blocks: Vec<Arc<Block>> = {
            let mut table = self.blocks.write();
            table.cur = None;
            table.slots.drain(..).flatten().collect()
        };
        drop(blocks);

        let externals: Vec<usize> = self.externals.lock().drain(..).collect();
        for addr in externals {
            // SAFETY: each entry was recorded in alloc_external with a
            // header carrying the payload span.
            unsafe {
                let hdr = (addr as *const ChunkHeader).read();
                let total = HDR_SIZE + hdr.size().unsigned_abs() as usize;
                self.ops
                    .free(NonNull::new_unchecked(addr as *mut u8), total);
            }
        }
    }

    // ------------------------------------------------------------------
    // Allocation paths
    // ------------------------------------------------------------------

    fn pop_head(&self, payload: usize) -> Option<NonNull<u8>> {
        let head = self.root.read().get(&payload).cloned()?;
        if head.size != payload {
            log::error!("[POOL] head index corrupted for size {payload}");
            return None;
        }
        let node = head.list.lock().pop_front()?;

        let hdr_ptr = unsafe { node.as_ptr().cast::<u8>().sub(HDR_SIZE) }.cast::<ChunkHeader>();
        // SAFETY: the node sits in the payload of a freed chunk; its
        // header precedes it and stays valid while the block lives.
        unsafe {
            (*hdr_ptr).set_size(payload as i32);
            (*hdr_ptr).set_type(ChunkType::Allocated);
        }
        Some(node.cast::<u8>())
    }

    fn alloc_external(&self, payload: usize) -> Result<NonNull<u8>> {
        let total = HDR_SIZE + payload;
        let raw = self.ops.alloc(total).ok_or(PoolError::SizeTooBig)?;
        let hdr = ChunkHeader::new(payload as i32, 0, ChunkType::Allocated, self.idx);
        // SAFETY: raw is valid for `total` >= HDR_SIZE bytes.
        unsafe { raw.as_ptr().cast::<ChunkHeader>().write(hdr) };
        self.externals.lock().push(raw.as_ptr() as usize);
        log::debug!("[POOL] oversized alloc {payload}: direct from backing");
        // SAFETY: HDR_SIZE < total.
        Ok(unsafe { NonNull::new_unchecked(raw.as_ptr().add(HDR_SIZE)) })
    }

    fn alloc_from_block(&self, payload: usize) -> Result<NonNull<u8>> {
        loop {
            let cur = {
                let table = self.blocks.read();
                table.cur.and_then(|i| table.slots[i].clone())
            };
            if let Some(block) = cur {
                if let Some(ptr) = self.try_bump(&block, payload) {
                    return Ok(ptr);
                }
            }
            self.add_block()?;
        }
    }

    fn try_bump(&self, block: &Block, payload: usize) -> Option<NonNull<u8>> {
        let span = HDR_SIZE + payload;
        let mut state = block.state.lock();
        if state.pos == RETIRED || state.pos + span > self.block_size {
            return None;
        }

        // SAFETY: pos + span <= block_size, so the header and payload
        // lie inside the block.
        let hdr_addr = unsafe { block.base.as_ptr().add(state.pos) };
        let hdr = ChunkHeader::new(payload as i32, state.prev_span, ChunkType::Allocated, self.idx);
        // SAFETY: as above; bump positions are 16-aligned, satisfying
        // the header's alignment.
        unsafe { hdr_addr.cast::<ChunkHeader>().write(hdr) };

        state.prev_span = payload as u32;
        state.pos += span;

        // SAFETY: as above.
        Some(unsafe { NonNull::new_unchecked(hdr_addr.add(HDR_SIZE)) })
    }

    fn add_block(&self) -> Result<()> {
        let raw = self.ops.alloc(self.block_size).ok_or(PoolError::AllocBlock)?;

        let mut table = self.blocks.write();
        let idx = table
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(table.slots.len());

        // The block leads with a Block-typed header whose size field
        // remembers the table slot.
        let hdr = ChunkHeader::new(idx as i32, 0, ChunkType::Block, self.idx);
        // SAFETY: raw is valid for block_size >= HDR_SIZE bytes.
        unsafe { raw.as_ptr().cast::<ChunkHeader>().write(hdr) };

        let block = Arc::new(Block {
            base: raw,
            size: self.block_size,
            ops: Arc::clone(&self.ops),
            state: Mutex::new(BlockState {
                pos: HDR_SIZE,
                prev_span: 0,
            }),
        });

        if idx == table.slots.len() {
            table.slots.push(Some(block));
        } else {
            table.slots[idx] = Some(block);
        }
        table.cur = Some(idx);
        log::debug!("[POOL] added block {idx} ({} bytes)", self.block_size);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Free paths
    // ------------------------------------------------------------------

    unsafe fn free_in(&self, hdr_ptr: *mut ChunkHeader) -> Result<()> {
        // SAFETY: caller validated the header (non-negative size,
        // Allocated type, this pool's index).
        let payload = unsafe { (*hdr_ptr).size() } as usize;

        if payload + 2 * HDR_SIZE > self.block_size {
            return self.free_external(hdr_ptr, payload);
        }

        let addr = hdr_ptr as usize;
        let (block_idx, block) = self.find_block(addr).ok_or(PoolError::WrongPool)?;
        let base = block.base.as_ptr() as usize;

        let mut state = block.state.lock();
        if state.pos == RETIRED {
            return Err(PoolError::WrongPool);
        }

        // Coalesce backward while the physically preceding chunk is
        // free, unlinking each absorbed chunk from its head.
        let mut hdr_addr = addr;
        let mut span = payload;
        loop {
            // SAFETY: hdr_addr always points at a chunk header in this
            // block (start chunk or a predecessor reached via psize).
            let h = unsafe { (hdr_addr as *const ChunkHeader).read() };
            let psize = h.psize() as usize;
            if psize == 0 {
                break;
            }
            let pred_addr = hdr_addr - psize - HDR_SIZE;
            // SAFETY: psize chains stay inside the block by
            // construction of the bump path.
            let pred = unsafe { (pred_addr as *const ChunkHeader).read() };
            if pred.chunk_type() != Some(ChunkType::Head) {
                break;
            }
            debug_assert_eq!(pred.size(), -(psize as i32));
            self.unlink_free(pred_addr + HDR_SIZE, psize);
            span += psize + HDR_SIZE;
            hdr_addr = pred_addr;
        }

        // SAFETY: as above.
        let mut merged = unsafe { (hdr_addr as *const ChunkHeader).read() };
        let end = hdr_addr + HDR_SIZE + span;

        // Merging back to the block's first chunk and forward to the
        // bump position means the block is empty: release it.
        if merged.psize() == 0 && end == base + state.pos {
            state.pos = RETIRED;
            drop(state);
            self.release_block(block_idx);
            return Ok(());
        }

        // The successor's back-reference must see the merged span.
        if end < base + state.pos {
            // SAFETY: end < pos means another chunk header starts at
            // end.
            unsafe { (*(end as *mut ChunkHeader)).set_psize(span as u32) };
        }

        merged.set_size(-(span as i32));
        merged.set_type(ChunkType::Head);
        // SAFETY: as above.
        unsafe { (hdr_addr as *mut ChunkHeader).write(merged) };
        drop(state);

        self.push_free(hdr_addr + HDR_SIZE, span)
    }

    fn free_external(&self, hdr_ptr: *mut ChunkHeader, payload: usize) -> Result<()> {
        let addr = hdr_ptr as usize;
        let mut externals = self.externals.lock();
        let Some(i) = externals.iter().position(|&a| a == addr) else {
            return Err(PoolError::WrongPool);
        };
        externals.swap_remove(i);
        drop(externals);

        // SAFETY: the entry was recorded by alloc_external with exactly
        // this total.
        unsafe {
            self.ops
                .free(NonNull::new_unchecked(hdr_ptr.cast::<u8>()), HDR_SIZE + payload);
        }
        Ok(())
    }

    fn find_block(&self, addr: usize) -> Option<(usize, Arc<Block>)> {
        let table = self.blocks.read();
        for (i, slot) in table.slots.iter().enumerate() {
            if let Some(block) = slot {
                let base = block.base.as_ptr() as usize;
                if addr >= base && addr < base + self.block_size {
                    return Some((i, Arc::clone(block)));
                }
            }
        }
        None
    }

    fn release_block(&self, idx: usize) {
        let block = {
            let mut table = self.blocks.write();
            if table.cur == Some(idx) {
                table.cur = None;
            }
            table.slots.get_mut(idx).and_then(Option::take)
        };
        drop(block);
        log::debug!("[POOL] released empty block {idx}");
    }

    fn unlink_free(&self, node_addr: usize, payload: usize) {
        let Some(head) = self.root.read().get(&payload).cloned() else {
            log::error!("[POOL] no head for free chunk of size {payload}");
            return;
        };
        // SAFETY: a Head-typed chunk of this size is linked in this
        // head's list; node_addr is its payload.
        unsafe {
            head.list
                .lock()
                .remove(NonNull::new_unchecked(node_addr as *mut FreeNode));
        }
    }

    fn push_free(&self, node_addr: usize, payload: usize) -> Result<()> {
        let head = {
            let existing = self.root.read().get(&payload).cloned();
            match existing {
                Some(h) => h,
                None => {
                    let mut root = self.root.write();
                    if root.len() >= HEAD_MAX && !root.contains_key(&payload) {
                        return Err(PoolError::AllocHead);
                    }
                    Arc::clone(
                        root.entry(payload)
                            .or_insert_with(|| Arc::new(Head::new(payload))),
                    )
                }
            }
        };
        if head.size != payload {
            log::error!("[POOL] head index corrupted for size {payload}");
            return Err(PoolError::AllocHead);
        }
        // SAFETY: the chunk's payload spans at least 24 bytes; the
        // links fit.
        head.list
            .lock()
            .push_front(unsafe { NonNull::new_unchecked(node_addr as *mut FreeNode) });
        Ok(())
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.fini();
    }
}

// SAFETY: raw block/chunk pointers are owned by the pool; every piece
// of shared state sits behind its own lock (see module docs).
unsafe impl Send for SessionPool {}
unsafe impl Sync for SessionPool {}

/// Return a chunk to its owning pool, recovered from the chunk header.
///
/// # Errors
///
/// `DoubleFree` when the chunk's size has already been negated,
/// `WrongPool` when the header does not name a live pool (or the chunk
/// is unknown to it). Every rejection is logged and mutates nothing.
///
/// # Safety
///
/// `ptr` must come from [`SessionPool::alloc`] on a live pool and must
/// not be used after this call.
pub unsafe fn free(ptr: NonNull<u8>) -> Result<()> {
    let hdr_ptr = unsafe { ptr.as_ptr().sub(HDR_SIZE) }.cast::<ChunkHeader>();
    // SAFETY: every session allocation is prefixed by its header.
    let hdr = unsafe { hdr_ptr.read() };

    let result = (|| {
        if hdr.size() < 0 {
            return Err(PoolError::DoubleFree);
        }
        if hdr.chunk_type() != Some(ChunkType::Allocated) {
            return Err(PoolError::WrongPool);
        }
        let pool = lookup(hdr.pool_idx()).ok_or(PoolError::WrongPool)?;
        if pool.magic != POOL_MAGIC {
            return Err(PoolError::WrongPool);
        }
        // SAFETY: header validated; forwarded caller contract.
        unsafe { pool.free_in(hdr_ptr) }
    })();

    if let Err(e) = result {
        log::error!("[POOL] free: {e}");
    }
    result
}
