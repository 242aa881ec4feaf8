//! # Hash Table Partition
//!
//! One shard of the adaptive hash index: an array of bucket heads plus the
//! slab arena that owns every chain node. Nodes are addressed by
//! [`NodeRef`]-packed indices, never by pointer, so the partition is the
//! sole owner of all node memory and nothing else can keep a node alive.
//!
//! ## Slab arena
//!
//! Nodes live in page-sized frames borrowed from the buffer pool. Each
//! frame is a bump allocator: slots fill from the bottom, only the tail
//! frame is ever partially full. Freeing swaps the arena's top node into
//! the hole (repointing the one link that referenced it) and shrinks the
//! tail, so allocation stays O(1), freeing stays O(chain), and an emptied
//! tail frame goes back to the pool - or becomes the spare.
//!
//! ## The spare frame
//!
//! Inserting while holding the partition latch must not block on the
//! buffer pool. [`Partition::prepare_insert`] pre-stages one empty frame
//! under a dedicated mutex *before* the latch is taken; `alloc_node`
//! consumes it when the tail fills. If no spare is available the insert
//! silently does nothing - the hash index is best-effort by contract.
//!
//! Lock order: partition latch, then spare mutex. Never the reverse.

use parking_lot::{Mutex, RwLock};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{NODES_PER_FRAME, NODE_SIZE};
use crate::pool::{BufferPool, Frame, RecPtr};

/// Sentinel for "no node".
pub(crate) const NIL: u32 = u32::MAX;

/// One hash-chain node: fold, chain link, record pointer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct Node {
    /// CRC-32C of the record prefix.
    pub fold: u32,
    /// Next node in the bucket chain, or `NIL`.
    pub next: u32,
    /// Buffer block holding the record.
    pub rec_block: u32,
    /// Record origin within the frame.
    pub rec_offset: u16,
    pub reserved: u16,
}

const _: () = assert!(core::mem::size_of::<Node>() == NODE_SIZE);

impl Node {
    #[inline]
    pub(crate) fn rec(&self) -> RecPtr {
        RecPtr { block_no: self.rec_block, offset: self.rec_offset }
    }
}

/// Packed node index: slab frame in the high half, slot in the low half.
#[inline]
fn node_ref(block_idx: usize, slot: u16) -> u32 {
    debug_assert!(block_idx < 0xffff);
    ((block_idx as u32) << 16) | u32::from(slot)
}

#[inline]
fn ref_block(r: u32) -> usize {
    (r >> 16) as usize
}

#[inline]
fn ref_slot(r: u32) -> u16 {
    r as u16
}

/// A borrowed frame acting as a bump arena of node slots.
struct SlabBlock {
    frame: Box<Frame>,
    n_used: u16,
}

impl SlabBlock {
    fn node(&self, slot: u16) -> Node {
        let off = slot as usize * NODE_SIZE;
        // INVARIANT: the slice is exactly NODE_SIZE bytes and Node reads
        // are unaligned copies, so the cast cannot fail.
        Node::read_from_bytes(&self.frame.as_bytes()[off..off + NODE_SIZE])
            .expect("node slot cast")
    }

    fn set_node(&mut self, slot: u16, node: &Node) {
        let off = slot as usize * NODE_SIZE;
        // INVARIANT: see `node`.
        node.write_to(&mut self.frame.as_bytes_mut()[off..off + NODE_SIZE])
            .expect("node slot cast")
    }
}

/// Bucket array plus slab, protected together by the partition latch.
pub(crate) struct PartitionInner {
    buckets: Vec<u32>,
    blocks: Vec<SlabBlock>,
}

impl PartitionInner {
    fn new() -> Self {
        PartitionInner { buckets: Vec::new(), blocks: Vec::new() }
    }

    /// Whether `enable()` has sized the bucket array.
    #[inline]
    pub(crate) fn is_allocated(&self) -> bool {
        !self.buckets.is_empty()
    }

    pub(crate) fn alloc_buckets(&mut self, n_cells: usize) {
        debug_assert!(self.buckets.is_empty() && self.blocks.is_empty());
        self.buckets = vec![NIL; n_cells.max(1)];
    }

    #[inline]
    pub(crate) fn n_cells(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub(crate) fn bucket_of(&self, fold: u32) -> usize {
        fold as usize % self.buckets.len()
    }

    #[inline]
    pub(crate) fn bucket_head(&self, cell: usize) -> u32 {
        self.buckets[cell]
    }

    pub(crate) fn node(&self, r: u32) -> Node {
        self.blocks[ref_block(r)].node(ref_slot(r))
    }

    fn set_node(&mut self, r: u32, node: &Node) {
        self.blocks[ref_block(r)].set_node(ref_slot(r), node);
    }

    fn set_next(&mut self, r: u32, next: u32) {
        let mut node = self.node(r);
        node.next = next;
        self.set_node(r, &node);
    }

    /// Total live nodes across the slab.
    pub(crate) fn n_nodes(&self) -> usize {
        self.blocks.iter().map(|b| b.n_used as usize).sum()
    }

    /// Number of slab frames currently held.
    pub(crate) fn n_slab_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Whether every slab frame except possibly the tail is full.
    pub(crate) fn slab_is_compact(&self) -> bool {
        self.blocks
            .iter()
            .rev()
            .skip(1)
            .all(|b| b.n_used as usize == NODES_PER_FRAME)
    }

    /// Takes a fresh node slot from the tail frame, or from the spare.
    /// `None` when both are exhausted; the caller gives up silently.
    fn alloc_node(&mut self, spare: &Mutex<Option<Box<Frame>>>) -> Option<u32> {
        if let Some(tail) = self.blocks.last_mut() {
            if (tail.n_used as usize) < NODES_PER_FRAME {
                let slot = tail.n_used;
                tail.n_used += 1;
                return Some(node_ref(self.blocks.len() - 1, slot));
            }
        }
        let frame = spare.lock().take()?;
        self.blocks.push(SlabBlock { frame, n_used: 1 });
        Some(node_ref(self.blocks.len() - 1, 0))
    }

    /// Releases a node slot: the arena's top node moves into the hole and
    /// the single link referencing it is repointed. An emptied tail frame
    /// is promoted to spare, or returned to the pool if a spare exists.
    ///
    /// The caller has already unlinked `r` from its chain.
    fn free_node(&mut self, r: u32, spare: &Mutex<Option<Box<Frame>>>, pool: &BufferPool) {
        let tail_idx = self.blocks.len() - 1;
        let top = node_ref(tail_idx, self.blocks[tail_idx].n_used - 1);

        if r != top {
            let top_node = self.node(top);
            self.set_node(r, &top_node);
            let cell = self.bucket_of(top_node.fold);
            if self.buckets[cell] == top {
                self.buckets[cell] = r;
            } else {
                let mut cur = self.buckets[cell];
                loop {
                    debug_assert!(cur != NIL, "moved node not reachable from its bucket");
                    let n = self.node(cur);
                    if n.next == top {
                        self.set_next(cur, r);
                        break;
                    }
                    cur = n.next;
                }
            }
        }

        let tail = &mut self.blocks[tail_idx];
        tail.n_used -= 1;
        if tail.n_used == 0 {
            // INVARIANT: blocks is non-empty, we just indexed its tail.
            let frame = self.blocks.pop().expect("slab tail present").frame;
            let mut sp = spare.lock();
            if sp.is_none() {
                *sp = Some(frame);
            } else {
                drop(sp);
                pool.free_frame(frame);
            }
        }
    }

    /// Inserts `(fold, rec)`, overwriting the record pointer of an
    /// existing node with the same fold. Does nothing when no node slot
    /// can be had.
    pub(crate) fn insert(
        &mut self,
        fold: u32,
        rec: RecPtr,
        spare: &Mutex<Option<Box<Frame>>>,
        pool: &BufferPool,
    ) {
        debug_assert!(self.is_allocated());
        let cell = self.bucket_of(fold);

        let mut last = NIL;
        let mut cur = self.buckets[cell];
        while cur != NIL {
            let n = self.node(cur);
            if n.fold == fold {
                pool.block(n.rec_block).n_pointers_dec();
                pool.block(rec.block_no).n_pointers_inc();
                let updated = Node {
                    rec_block: rec.block_no,
                    rec_offset: rec.offset,
                    ..n
                };
                self.set_node(cur, &updated);
                return;
            }
            last = cur;
            cur = n.next;
        }

        let Some(r) = self.alloc_node(spare) else {
            return;
        };
        pool.block(rec.block_no).n_pointers_inc();
        self.set_node(
            r,
            &Node {
                fold,
                next: NIL,
                rec_block: rec.block_no,
                rec_offset: rec.offset,
                reserved: 0,
            },
        );
        if last == NIL {
            self.buckets[cell] = r;
        } else {
            self.set_next(last, r);
        }
    }

    /// Erases the node for `rec` if present.
    pub(crate) fn erase(
        &mut self,
        fold: u32,
        rec: RecPtr,
        spare: &Mutex<Option<Box<Frame>>>,
        pool: &BufferPool,
    ) -> bool {
        debug_assert!(self.is_allocated());
        let cell = self.bucket_of(fold);
        let mut prev = NIL;
        let mut cur = self.buckets[cell];
        while cur != NIL {
            let n = self.node(cur);
            if n.rec() == rec {
                if prev == NIL {
                    self.buckets[cell] = n.next;
                } else {
                    self.set_next(prev, n.next);
                }
                pool.block(n.rec_block).n_pointers_dec();
                self.free_node(cur, spare, pool);
                return true;
            }
            prev = cur;
            cur = n.next;
        }
        false
    }

    /// Removes every node under `fold` whose record lies on the given
    /// buffer block. The walk restarts after each removal because the
    /// swap-with-top compaction may move nodes of the same chain.
    pub(crate) fn erase_all_on_page(
        &mut self,
        fold: u32,
        page_block_no: u32,
        spare: &Mutex<Option<Box<Frame>>>,
        pool: &BufferPool,
    ) -> usize {
        debug_assert!(self.is_allocated());
        let cell = self.bucket_of(fold);
        let mut removed = 0;
        'rewind: loop {
            let mut prev = NIL;
            let mut cur = self.buckets[cell];
            while cur != NIL {
                let n = self.node(cur);
                if n.rec_block == page_block_no {
                    if prev == NIL {
                        self.buckets[cell] = n.next;
                    } else {
                        self.set_next(prev, n.next);
                    }
                    pool.block(n.rec_block).n_pointers_dec();
                    self.free_node(cur, spare, pool);
                    removed += 1;
                    continue 'rewind;
                }
                prev = cur;
                cur = n.next;
            }
            break;
        }
        removed
    }

    /// Repoints the node for `old` at `new`, if it exists.
    pub(crate) fn update_if_found(
        &mut self,
        fold: u32,
        old: RecPtr,
        new: RecPtr,
        pool: &BufferPool,
    ) -> bool {
        debug_assert!(self.is_allocated());
        let mut cur = self.buckets[self.bucket_of(fold)];
        while cur != NIL {
            let n = self.node(cur);
            if n.rec() == old {
                pool.block(n.rec_block).n_pointers_dec();
                pool.block(new.block_no).n_pointers_inc();
                let updated = Node {
                    rec_block: new.block_no,
                    rec_offset: new.offset,
                    ..n
                };
                self.set_node(cur, &updated);
                return true;
            }
            cur = n.next;
        }
        false
    }

    /// First node with the given fold, by copy.
    pub(crate) fn lookup(&self, fold: u32) -> Option<Node> {
        if !self.is_allocated() {
            return None;
        }
        let mut cur = self.buckets[self.bucket_of(fold)];
        while cur != NIL {
            let n = self.node(cur);
            if n.fold == fold {
                return Some(n);
            }
            cur = n.next;
        }
        None
    }

    /// Tears everything down: frames go back to the pool, the bucket
    /// array is dropped. Used by disable.
    pub(crate) fn clear(&mut self, pool: &BufferPool) {
        for block in self.blocks.drain(..) {
            pool.free_frame(block.frame);
        }
        self.buckets = Vec::new();
    }
}

/// One latch-protected shard of the hash index.
pub(crate) struct Partition {
    pub(crate) latch: RwLock<PartitionInner>,
    spare: Mutex<Option<Box<Frame>>>,
}

impl Partition {
    pub(crate) fn new() -> Self {
        Partition {
            latch: RwLock::new(PartitionInner::new()),
            spare: Mutex::new(None),
        }
    }

    pub(crate) fn spare(&self) -> &Mutex<Option<Box<Frame>>> {
        &self.spare
    }

    /// Stages one empty frame so a following insert under the latch
    /// cannot be starved by the allocator. Idempotent; silently does
    /// nothing when the pool has no frame to lend.
    pub(crate) fn prepare_insert(&self, pool: &BufferPool, enabled: bool) {
        if !enabled || self.spare.lock().is_some() {
            return;
        }
        let Some(frame) = pool.alloc_frame() else {
            return;
        };
        let mut sp = self.spare.lock();
        if sp.is_none() && enabled {
            *sp = Some(frame);
        } else {
            drop(sp);
            pool.free_frame(frame);
        }
    }

    /// Returns the spare frame, if any, to the pool.
    pub(crate) fn clear_spare(&self, pool: &BufferPool) {
        if let Some(frame) = self.spare.lock().take() {
            pool.free_frame(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn part_with_buckets(n_cells: usize) -> Partition {
        let part = Partition::new();
        part.latch.write().alloc_buckets(n_cells);
        part
    }

    fn rec(offset: u16) -> RecPtr {
        RecPtr { block_no: 0, offset }
    }

    fn insert_one(part: &Partition, pool: &BufferPool, fold: u32, r: RecPtr) {
        part.prepare_insert(pool, true);
        part.latch.write().insert(fold, r, part.spare(), pool);
    }

    fn check_bucket_invariant(inner: &PartitionInner) {
        for cell in 0..inner.n_cells() {
            let mut cur = inner.bucket_head(cell);
            while cur != NIL {
                let n = inner.node(cur);
                assert_eq!(inner.bucket_of(n.fold), cell, "node in wrong bucket");
                cur = n.next;
            }
        }
    }

    #[test]
    fn test_insert_lookup_erase() {
        let pool = BufferPool::new(4).unwrap();
        let part = part_with_buckets(8);

        insert_one(&part, &pool, 42, rec(100));
        insert_one(&part, &pool, 50, rec(200)); // same bucket as 42 (mod 8)

        let inner = part.latch.read();
        assert_eq!(inner.lookup(42).unwrap().rec(), rec(100));
        assert_eq!(inner.lookup(50).unwrap().rec(), rec(200));
        assert!(inner.lookup(43).is_none());
        check_bucket_invariant(&inner);
        drop(inner);

        let mut inner = part.latch.write();
        assert!(inner.erase(42, rec(100), part.spare(), &pool));
        assert!(!inner.erase(42, rec(100), part.spare(), &pool));
        assert_eq!(inner.lookup(50).unwrap().rec(), rec(200));
        assert_eq!(inner.n_nodes(), 1);
        check_bucket_invariant(&inner);
    }

    #[test]
    fn test_insert_overwrites_equal_fold() {
        let pool = BufferPool::new(4).unwrap();
        let part = part_with_buckets(8);

        insert_one(&part, &pool, 7, rec(10));
        insert_one(&part, &pool, 7, rec(20));

        let inner = part.latch.read();
        assert_eq!(inner.n_nodes(), 1);
        assert_eq!(inner.lookup(7).unwrap().rec(), rec(20));
    }

    #[test]
    fn test_erase_all_on_page_restarts_walk() {
        let pool = BufferPool::new(4).unwrap();
        let part = part_with_buckets(1); // everything in one chain

        // Interleave records of two blocks under distinct folds.
        for i in 0..8u32 {
            let block_no = i % 2;
            part.prepare_insert(&pool, true);
            part.latch.write().insert(
                i,
                RecPtr { block_no, offset: i as u16 },
                part.spare(),
                &pool,
            );
        }

        let mut inner = part.latch.write();
        let mut removed = 0;
        for fold in 0..8u32 {
            removed += inner.erase_all_on_page(fold, 0, part.spare(), &pool);
        }
        assert_eq!(removed, 4);
        assert_eq!(inner.n_nodes(), 4);
        for fold in [1u32, 3, 5, 7] {
            assert_eq!(inner.lookup(fold).unwrap().rec_block, 1);
        }
        check_bucket_invariant(&inner);
    }

    #[test]
    fn test_update_if_found() {
        let pool = BufferPool::new(4).unwrap();
        let part = part_with_buckets(8);
        insert_one(&part, &pool, 9, rec(30));

        let mut inner = part.latch.write();
        assert!(inner.update_if_found(9, rec(30), rec(40), &pool));
        assert_eq!(inner.lookup(9).unwrap().rec(), rec(40));
        assert!(!inner.update_if_found(9, rec(30), rec(50), &pool));
    }

    #[test]
    fn test_slab_compaction_random_erase() {
        let pool = BufferPool::new(64).unwrap();
        let part = part_with_buckets(1024);
        const N: usize = 10_000;
        const KEEP: usize = 5_000;

        for i in 0..N {
            insert_one(&part, &pool, i as u32, rec(i as u16));
        }
        assert_eq!(part.latch.read().n_nodes(), N);

        let mut order: Vec<usize> = (0..N).collect();
        order.shuffle(&mut rand::rngs::StdRng::seed_from_u64(0x5eed));
        {
            let mut inner = part.latch.write();
            for &i in order.iter().take(N - KEEP) {
                assert!(inner.erase(i as u32, rec(i as u16), part.spare(), &pool));
            }
        }

        let inner = part.latch.read();
        assert_eq!(inner.n_nodes(), KEEP);
        // Exactly ceil(KEEP * node / page) frames survive, all full but
        // the tail; the emptied rest went back to the pool or the spare.
        let expect_blocks = (KEEP * NODE_SIZE).div_ceil(PAGE_SIZE);
        assert_eq!(inner.n_slab_blocks(), expect_blocks);
        assert!(inner.slab_is_compact());
        check_bucket_invariant(&inner);

        // Every surviving fold is still reachable.
        for &i in order.iter().skip(N - KEEP) {
            assert_eq!(inner.lookup(i as u32).unwrap().rec(), rec(i as u16));
        }
    }

    #[test]
    fn test_spare_recycled_on_shrink() {
        let pool = BufferPool::new(8).unwrap();
        let part = part_with_buckets(16);

        insert_one(&part, &pool, 1, rec(1));
        assert_eq!(part.latch.read().n_slab_blocks(), 1);

        let mut inner = part.latch.write();
        assert!(inner.erase(1, rec(1), part.spare(), &pool));
        assert_eq!(inner.n_slab_blocks(), 0);
        drop(inner);
        // The emptied frame became the spare rather than a pool round trip.
        assert!(part.spare().lock().is_some());
        part.clear_spare(&pool);
        assert_eq!(pool.slab_frames_outstanding(), 0);
    }
}
