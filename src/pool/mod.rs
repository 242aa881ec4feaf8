//! # Buffer Pool
//!
//! A fixed array of 16 KiB frames with page identities, ordered states,
//! fix counts, and per-page rw-latches. The pool plays two roles for the
//! hash index:
//!
//! - It owns the leaf pages whose records hash nodes point into. A record
//!   pointer ([`RecPtr`]) is a block number plus a frame offset, so
//!   resolving a node back to its block is O(1) and "does this record lie
//!   on that page" is block-number equality.
//! - It lends out page-sized frames ([`Frame`]) to back the hash-node
//!   slab. Ownership moves pool -> slab -> pool and the pool keeps the
//!   accounting, so hash memory is bounded by the same budget as pages.
//!
//! ## States and eviction
//!
//! Block states are ordered: `RemoveHash < Unfixed < ReadFix < WriteFix`.
//! The fast-path lookup refuses any block below `Unfixed`. Eviction takes
//! the page-hash chain lock, verifies the block is unfixed and its latch
//! free, flips the state to `RemoveHash`, unmaps the page, and only then
//! lets the caller drop the page's hash entries - the same ordering the
//! fast path relies on when it probes under the chain lock.
//!
//! ## Frame access
//!
//! `Block::frame()` returns `&[u8]` and `Block::frame_mut()` is `unsafe`:
//! the pool cannot prove latch ownership in the type system, so writers
//! assert the protocol in comments the way the page-latch contract is
//! stated by each caller. Pages are only ever mutated under the exclusive
//! page latch.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use eyre::{ensure, eyre, Result};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{CHAIN_LOCK_COUNT, PAGE_SIZE};
use crate::dict::{IndexDef, IndexId};
use crate::page::{PageMut, PageView};
use crate::records::RecordFormat;

/// Identity of a buffered page: tablespace and page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub space: u32,
    pub page_no: u32,
}

impl PageId {
    pub fn new(space: u32, page_no: u32) -> Self {
        PageId { space, page_no }
    }

    #[inline]
    fn fold(&self) -> usize {
        (self.space as usize)
            .wrapping_mul(31)
            .wrapping_add(self.page_no as usize)
    }

    #[inline]
    fn to_u64(self) -> u64 {
        (u64::from(self.space) << 32) | u64::from(self.page_no)
    }

    #[inline]
    fn from_u64(v: u64) -> Self {
        PageId { space: (v >> 32) as u32, page_no: v as u32 }
    }
}

const PAGE_ID_NONE: u64 = u64::MAX;

/// Pointer to a record origin inside a buffered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecPtr {
    pub block_no: u32,
    pub offset: u16,
}

/// One page-sized frame. Backs leaf pages inside the pool and, boxed and
/// borrowed, the hash-node slab outside it.
#[repr(C)]
pub struct Frame {
    bytes: [u8; PAGE_SIZE],
}

impl Frame {
    fn zeroed() -> Frame {
        Frame { bytes: [0; PAGE_SIZE] }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Ordered block state. Everything below `Unfixed` is invisible to the
/// hash fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum PageState {
    /// Being detached from the page map; hash entries are on their way out.
    RemoveHash = 0,
    /// Buffered, not undergoing I/O.
    Unfixed = 1,
    /// Read I/O in progress.
    ReadFix = 2,
    /// Write I/O in progress.
    WriteFix = 3,
}

impl PageState {
    fn from_u32(v: u32) -> PageState {
        match v {
            0 => PageState::RemoveHash,
            1 => PageState::Unfixed,
            2 => PageState::ReadFix,
            _ => PageState::WriteFix,
        }
    }
}

/// Hash-index metadata carried on every buffered block.
#[derive(Debug, Default)]
struct BlockAhi {
    /// Index whose hash entries reference this page; `None` = no hash.
    /// Written only under the owning partition's exclusive latch.
    index: Mutex<Option<Arc<IndexDef>>>,
    /// Prefix actually indexed, packed with the side flag.
    curr_left_bytes_fields: AtomicU32,
    /// Candidate prefix proposed by recent accesses.
    next_left_bytes_fields: AtomicU32,
    /// Consecutive accesses consistent with the candidate prefix.
    n_hash_helps: AtomicU16,
    /// Number of hash nodes pointing into this frame. Diagnostic only;
    /// the validator cross-checks it against the chains.
    n_pointers: AtomicU16,
}

/// One buffered frame with its identity, state, and latch.
pub struct Block {
    block_no: u32,
    page_id: AtomicU64,
    state: AtomicU32,
    fix_count: AtomicU32,
    pub(crate) latch: RwLock<()>,
    frame: UnsafeCell<Frame>,
    ahi: BlockAhi,
}

// SAFETY: the frame is the only field needing interior mutability, and all
// mutation goes through `frame_mut`, whose callers hold the exclusive page
// latch (or are initializing an unmapped block). Everything else is atomic
// or lock-protected.
unsafe impl Sync for Block {}

impl Block {
    fn new(block_no: u32) -> Block {
        Block {
            block_no,
            page_id: AtomicU64::new(PAGE_ID_NONE),
            state: AtomicU32::new(PageState::RemoveHash as u32),
            fix_count: AtomicU32::new(0),
            latch: RwLock::new(()),
            frame: UnsafeCell::new(Frame::zeroed()),
            ahi: BlockAhi::default(),
        }
    }

    #[inline]
    pub fn block_no(&self) -> u32 {
        self.block_no
    }

    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        match self.page_id.load(Ordering::Acquire) {
            PAGE_ID_NONE => None,
            v => Some(PageId::from_u64(v)),
        }
    }

    fn set_page_id(&self, id: Option<PageId>) {
        let v = id.map_or(PAGE_ID_NONE, PageId::to_u64);
        debug_assert!(id.is_none() || v != PAGE_ID_NONE);
        self.page_id.store(v, Ordering::Release);
    }

    #[inline]
    pub fn state(&self) -> PageState {
        PageState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: PageState) {
        self.state.store(s as u32, Ordering::Release);
    }

    #[inline]
    pub fn fix_count(&self) -> u32 {
        self.fix_count.load(Ordering::Acquire)
    }

    /// Pins the page against eviction.
    #[inline]
    pub fn fix(&self) {
        self.fix_count.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn unfix(&self) {
        let prev = self.fix_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unfix of an unfixed page");
    }

    /// Frame contents. Readers hold the page latch in some mode, or hold
    /// the partition latch and only dereference record prefixes that the
    /// hash consistency protocol keeps stable.
    #[inline]
    pub fn frame(&self) -> &[u8] {
        // SAFETY: see the method contract above; writers are excluded by
        // the exclusive page latch held around every `frame_mut` call.
        unsafe { &(*self.frame.get()).bytes }
    }

    /// Mutable frame contents.
    ///
    /// # Safety
    /// The caller must hold this block's exclusive page latch (or the
    /// block must be unmapped and private to the caller, as during page
    /// creation).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_mut(&self) -> &mut [u8] {
        &mut (*self.frame.get()).bytes
    }

    #[inline]
    pub fn page(&self) -> PageView<'_> {
        PageView::new(self.frame())
    }

    /// Runs `f` on the mutable page; the guard parameter ties the call to
    /// a held exclusive latch.
    pub fn with_page_mut<R>(
        &self,
        _latch: &mut RwLockWriteGuard<'_, ()>,
        f: impl FnOnce(PageMut<'_>) -> R,
    ) -> R {
        // SAFETY: the caller passes an exclusive page-latch guard.
        let frame = unsafe { self.frame_mut() };
        f(PageMut::new(frame))
    }

    #[inline]
    pub fn s_latch(&self) -> RwLockReadGuard<'_, ()> {
        self.latch.read()
    }

    #[inline]
    pub fn x_latch(&self) -> RwLockWriteGuard<'_, ()> {
        self.latch.write()
    }

    #[inline]
    pub fn try_s_latch(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.latch.try_read()
    }

    #[inline]
    pub fn try_x_latch(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.latch.try_write()
    }

    // --- hash-index metadata -------------------------------------------

    /// Index this page is hashed for, if any. The value may be stale the
    /// moment the call returns unless the owning partition latch is held.
    pub fn ahi_index(&self) -> Option<Arc<IndexDef>> {
        self.ahi.index.lock().clone()
    }

    /// Set only under the owning partition's exclusive latch.
    pub(crate) fn set_ahi_index(&self, index: Option<Arc<IndexDef>>) {
        *self.ahi.index.lock() = index;
    }

    pub(crate) fn take_ahi_index(&self) -> Option<Arc<IndexDef>> {
        self.ahi.index.lock().take()
    }

    #[inline]
    pub(crate) fn curr_params_raw(&self) -> u32 {
        self.ahi.curr_left_bytes_fields.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_curr_params_raw(&self, v: u32) {
        self.ahi.curr_left_bytes_fields.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn next_params_raw(&self) -> u32 {
        self.ahi.next_left_bytes_fields.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_next_params_raw(&self, v: u32) {
        self.ahi.next_left_bytes_fields.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn n_hash_helps(&self) -> u16 {
        self.ahi.n_hash_helps.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_n_hash_helps(&self, v: u16) {
        self.ahi.n_hash_helps.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn n_pointers(&self) -> u16 {
        self.ahi.n_pointers.load(Ordering::Relaxed)
    }

    pub(crate) fn n_pointers_inc(&self) {
        self.ahi.n_pointers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn n_pointers_dec(&self) {
        let prev = self.ahi.n_pointers.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "hash pointer count underflow");
    }

    /// Metadata wipe used by global disable, which empties the chains
    /// wholesale: pointer counts are zeroed without the usual underflow
    /// checks.
    pub(crate) fn clear_ahi_on_disable(&self) {
        debug_assert!(self.ahi.index.lock().is_none());
        self.ahi.n_hash_helps.store(0, Ordering::Relaxed);
        self.ahi.n_pointers.store(0, Ordering::Relaxed);
    }

    pub(crate) fn reset_ahi(&self) {
        debug_assert!(self.ahi.index.lock().is_none());
        debug_assert_eq!(self.n_pointers(), 0);
        self.ahi.curr_left_bytes_fields.store(0, Ordering::Relaxed);
        self.ahi.next_left_bytes_fields.store(0, Ordering::Relaxed);
        self.ahi.n_hash_helps.store(0, Ordering::Relaxed);
        self.ahi.n_pointers.store(0, Ordering::Relaxed);
    }
}

/// Fixed-size pool of buffered frames.
pub struct BufferPool {
    blocks: Vec<Block>,
    page_map: RwLock<HashMap<PageId, u32>>,
    free: Mutex<Vec<u32>>,
    chain_locks: Vec<Mutex<()>>,
    slab_frames: AtomicUsize,
    resize_pending: AtomicBool,
}

impl BufferPool {
    pub fn new(n_blocks: usize) -> Result<Self> {
        ensure!(n_blocks >= 2, "buffer pool needs at least 2 frames");
        ensure!(
            n_blocks <= u32::MAX as usize,
            "blocks are addressed by a 32-bit number"
        );
        let blocks: Vec<_> = (0..n_blocks as u32).map(Block::new).collect();
        let free: Vec<u32> = (0..n_blocks as u32).rev().collect();
        Ok(BufferPool {
            blocks,
            page_map: RwLock::new(HashMap::new()),
            free: Mutex::new(free),
            chain_locks: (0..CHAIN_LOCK_COUNT).map(|_| Mutex::new(())).collect(),
            slab_frames: AtomicUsize::new(0),
            resize_pending: AtomicBool::new(false),
        })
    }

    /// Pool sized to 25% of available system RAM, with a small floor.
    pub fn auto_sized() -> Result<Self> {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let target = sys.available_memory() as usize / 4;
        Self::new((target / PAGE_SIZE).max(64))
    }

    #[inline]
    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.blocks.len() * PAGE_SIZE
    }

    #[inline]
    pub fn block(&self, block_no: u32) -> &Block {
        &self.blocks[block_no as usize]
    }

    pub fn lookup(&self, page_id: PageId) -> Option<u32> {
        self.page_map.read().get(&page_id).copied()
    }

    /// The lock stabilizing a page's identity: held while attempting the
    /// fast-path page latch, and by eviction while unmapping.
    #[inline]
    pub fn chain_lock_for(&self, page_id: PageId) -> &Mutex<()> {
        &self.chain_locks[page_id.fold() % CHAIN_LOCK_COUNT]
    }

    pub fn for_each_block(&self, mut f: impl FnMut(&Block)) {
        for block in &self.blocks {
            f(block);
        }
    }

    #[inline]
    pub fn resize_pending(&self) -> bool {
        self.resize_pending.load(Ordering::Acquire)
    }

    pub fn set_resize_pending(&self, v: bool) {
        self.resize_pending.store(v, Ordering::Release);
    }

    /// Formats a fresh leaf page on a free frame.
    pub fn create_page(
        &self,
        page_id: PageId,
        index_id: IndexId,
        format: RecordFormat,
    ) -> Result<u32> {
        ensure!(
            self.lookup(page_id).is_none(),
            "page {page_id:?} is already buffered"
        );
        let block_no = self
            .free
            .lock()
            .pop()
            .ok_or_else(|| eyre!("buffer pool exhausted"))?;
        let block = self.block(block_no);
        {
            let _x = block.latch.write();
            // SAFETY: the block came off the free list and we hold its
            // exclusive latch; no one else can reference the frame.
            let frame = unsafe { block.frame_mut() };
            PageMut::new(frame).init(index_id, format);
        }
        block.set_page_id(Some(page_id));
        block.set_state(PageState::Unfixed);
        self.page_map.write().insert(page_id, block_no);
        Ok(block_no)
    }

    /// Evicts an unfixed, unlatched page. `drop_hash` runs after the page
    /// is unmapped and must remove any hash entries still pointing at it.
    /// Returns false if the page is absent, fixed, or latched.
    pub fn evict_page(&self, page_id: PageId, drop_hash: impl FnOnce(u32)) -> bool {
        let block_no = {
            let _chain = self.chain_lock_for(page_id).lock();
            let Some(block_no) = self.lookup(page_id) else {
                return false;
            };
            let block = self.block(block_no);
            if block.fix_count() != 0 {
                return false;
            }
            let Some(_latch) = block.try_x_latch() else {
                return false;
            };
            block.set_state(PageState::RemoveHash);
            self.page_map.write().remove(&page_id);
            block_no
        };

        drop_hash(block_no);

        let block = self.block(block_no);
        debug_assert!(
            block.ahi_index().is_none(),
            "page evicted with live hash entries"
        );
        block.reset_ahi();
        block.set_page_id(None);
        self.free.lock().push(block_no);
        true
    }

    /// Borrows a page-sized frame for the hash-node slab. Fails when the
    /// borrowed frames would exceed the pool's own capacity, so hash
    /// memory stays within the pool budget.
    pub fn alloc_frame(&self) -> Option<Box<Frame>> {
        let cap = self.blocks.len();
        self.slab_frames
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < cap).then_some(n + 1)
            })
            .ok()?;
        Some(Box::new(Frame::zeroed()))
    }

    /// Returns a borrowed slab frame.
    pub fn free_frame(&self, frame: Box<Frame>) {
        drop(frame);
        let prev = self.slab_frames.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "slab frame accounting underflow");
    }

    /// Number of frames currently lent to the slab.
    pub fn slab_frames_outstanding(&self) -> usize {
        self.slab_frames.load(Ordering::Acquire)
    }

    /// Number of free (unbuffered) frames.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}
