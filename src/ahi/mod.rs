//! # The Adaptive Hash Index
//!
//! [`SearchSys`] is the subsystem handle: an owned object constructed at
//! engine startup and passed wherever the B-tree needs it - there are no
//! globals. It owns the partitioned hash table, shares the buffer pool
//! and dictionary with the rest of the engine, and exposes the operations
//! the surrounding system calls:
//!
//! | operation | when |
//! |---|---|
//! | `search_info_update` | after every B-tree positioning |
//! | `guess_on_hash` | before a B-tree descent |
//! | `update_hash_on_insert` / `update_hash_on_delete` | leaf DML |
//! | `move_or_delete_hash_entries` | page split / merge |
//! | `drop_page_hash_index` / `drop_page_hash_when_freed` | eviction, drop |
//! | `enable` / `disable` / `validate` | lifecycle and CHECK |
//!
//! ## Latching
//!
//! Lock order, outermost first: dictionary, all partition latches,
//! page-hash chain lock, page latch, partition spare mutex. The fast path
//! acquires the page latch with a non-blocking try while holding the
//! chain lock, which is what lets it run against concurrent eviction
//! without ever waiting on a page.
//!
//! The `enabled` flag is re-checked after every latch acquisition;
//! flipping it requires every partition latch exclusively, so no in-flight
//! mutator can straddle a transition.

mod build;
mod guess;
mod heuristic;
mod partition;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::RwLockWriteGuard;

use crate::config::{DEFAULT_N_PARTS, VALIDATE_CHUNK};
use crate::cursor::{Cursor, CursorFlag};
use crate::dict::{Dict, IndexDef, IndexId};
use crate::fold::rec_fold_dyn;
use crate::monitor::{SearchStats, SearchStatsSnapshot};
use crate::page::{PageView, SUPREMUM_OFFSET};
use crate::pool::{BufferPool, PageId, PageState};
use crate::records::PrefixParams;

use partition::{Partition, PartitionInner, NIL};

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct AhiConfig {
    /// Start with the index enabled.
    pub enabled: bool,
    /// Number of hash table partitions; an index maps to
    /// `index_id % n_parts`.
    pub n_parts: usize,
}

impl Default for AhiConfig {
    fn default() -> Self {
        AhiConfig { enabled: true, n_parts: DEFAULT_N_PARTS }
    }
}

/// The adaptive hash index subsystem.
pub struct SearchSys {
    enabled: AtomicBool,
    parts: Box<[Partition]>,
    pool: Arc<BufferPool>,
    dict: Arc<Dict>,
    pub(crate) stats: SearchStats,
}

impl SearchSys {
    pub fn new(cfg: AhiConfig, pool: Arc<BufferPool>, dict: Arc<Dict>) -> Result<Self> {
        ensure!(cfg.n_parts >= 1, "at least one hash partition is required");
        let parts: Box<[Partition]> =
            (0..cfg.n_parts).map(|_| Partition::new()).collect();
        let sys = SearchSys {
            enabled: AtomicBool::new(false),
            parts,
            pool,
            dict,
            stats: SearchStats::default(),
        };
        if cfg.enabled {
            sys.enable(false);
        }
        Ok(sys)
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    #[inline]
    pub fn dict(&self) -> &Arc<Dict> {
        &self.dict
    }

    pub fn stats(&self) -> SearchStatsSnapshot {
        self.stats.snapshot()
    }

    #[inline]
    pub(crate) fn part_for(&self, id: IndexId) -> &Partition {
        &self.parts[(id.0 % self.parts.len() as u64) as usize]
    }

    /// Total live hash nodes, for observability and tests.
    pub fn n_nodes(&self) -> usize {
        self.parts
            .iter()
            .map(|p| p.latch.read().n_nodes())
            .sum()
    }

    /// Slab frames held across all partitions (spares excluded).
    pub fn n_slab_blocks(&self) -> usize {
        self.parts
            .iter()
            .map(|p| p.latch.read().n_slab_blocks())
            .sum()
    }

    fn x_lock_all(&self) -> Vec<RwLockWriteGuard<'_, PartitionInner>> {
        self.parts.iter().map(|p| p.latch.write()).collect()
    }

    /// Turns the hash index on, sizing the bucket arrays from the buffer
    /// pool. Refused while a pool resize is pending, unless the resize
    /// itself is the caller.
    pub fn enable(&self, resize: bool) {
        if !resize && self.pool.resize_pending() {
            return;
        }

        let mut guards = self.x_lock_all();
        if guards[0].is_allocated() {
            debug_assert!(self.is_enabled());
            return;
        }

        let hash_size =
            self.pool.size_bytes() / core::mem::size_of::<*const u8>() / 64;
        let per_part = (hash_size / self.parts.len()).max(1);
        for guard in guards.iter_mut() {
            guard.alloc_buckets(per_part);
        }
        self.enabled.store(true, Ordering::Release);
        tracing::debug!(
            n_parts = self.parts.len(),
            cells_per_partition = per_part,
            "adaptive hash index enabled"
        );
    }

    /// Turns the hash index off and empties it: every per-index reference
    /// count is zeroed, every buffered page forgets its hash, and all
    /// slab frames and bucket arrays go back to the pool.
    pub fn disable(&self) {
        let freeze = self.dict.freeze();
        let mut guards = self.x_lock_all();

        if !self.is_enabled() {
            return;
        }
        self.enabled.store(false, Ordering::Release);

        self.dict
            .for_each_index_frozen(&freeze, |index| index.search_info().set_ref_count(0));
        drop(freeze);

        // Clear block metadata pool-wide; collect freed indexes whose last
        // reference just went away.
        let mut garbage: Vec<Arc<IndexDef>> = Vec::new();
        self.pool.for_each_block(|block| {
            if let Some(index) = block.take_ahi_index() {
                block.clear_ahi_on_disable();
                if index.is_freed() && !garbage.iter().any(|g| Arc::ptr_eq(g, &index)) {
                    garbage.push(index);
                }
            }
        });
        for index in &garbage {
            self.dict.lazy_free(index);
        }

        for (guard, part) in guards.iter_mut().zip(self.parts.iter()) {
            guard.clear(&self.pool);
            part.clear_spare(&self.pool);
        }
        tracing::debug!("adaptive hash index disabled");
    }

    /// Called after every B-tree positioning: feeds the heuristics,
    /// repairs one stale entry after a failed guess, and builds the
    /// page hash when the statistics say so. The caller holds the page
    /// latch it searched under.
    pub fn search_info_update(&self, cursor: &mut Cursor) {
        if !self.is_enabled() {
            return;
        }
        let index = cursor.index().clone();
        if !index.search_info().hash_analysis_useful() {
            return;
        }
        debug_assert!(
            cursor.flag != CursorFlag::Hash,
            "no statistics update after a successful guess"
        );
        let Some(block_no) = cursor.block_no() else {
            return;
        };

        heuristic::info_update(&index, cursor);
        let block = self.pool.block(block_no);
        let build =
            heuristic::update_block_info(index.search_info(), block, &block.page());

        if cursor.flag == CursorFlag::HashFail {
            self.update_hash_ref(cursor);
        }

        if build {
            let params = PrefixParams::from_raw(block.next_params_raw());
            self.build_page_hash_index(&index, block_no, params);
        }
    }

    /// Drops the hash of a page that is being freed in the file, if the
    /// page is still buffered.
    pub fn drop_page_hash_when_freed(&self, page_id: PageId) {
        let Some(block_no) = self.pool.lookup(page_id) else {
            return;
        };
        let block = self.pool.block(block_no);
        let _latch = block.x_latch();
        // The page may have been evicted and the frame reused while we
        // waited for the latch.
        if self.pool.lookup(page_id) != Some(block_no) {
            return;
        }
        if block.ahi_index().is_some() {
            self.drop_page_hash_index(block_no, false);
        }
    }

    pub(crate) fn lazy_free(&self, index: &Arc<IndexDef>) {
        tracing::debug!(index_id = index.id().0, "freeing detached index metadata");
        self.dict.lazy_free(index);
    }

    /// Offline consistency check. Walks every partition in chunks,
    /// releasing all latches between chunks; `kill` aborts early.
    /// Verifies bucket placement, node-to-page consistency, and (when a
    /// partition fits in one chunk) the per-block pointer accounting.
    pub fn validate(&self, kill: &AtomicBool) -> bool {
        for part_idx in 0..self.parts.len() {
            if !self.validate_partition(part_idx, kill) {
                return false;
            }
        }
        true
    }

    fn validate_partition(&self, part_idx: usize, kill: &AtomicBool) -> bool {
        let mut ok = true;
        let mut guards = self.x_lock_all();
        if !self.is_enabled() || kill.load(Ordering::Relaxed) {
            return ok;
        }

        let mut cell_count = guards[part_idx].n_cells();
        let single_chunk = cell_count <= VALIDATE_CHUNK;
        let mut pointer_counts: HashMap<u32, u32> = HashMap::new();

        let mut cell = 0usize;
        while cell < cell_count {
            if cell != 0 && cell % VALIDATE_CHUNK == 0 {
                // Give other threads a chance to run.
                drop(guards);
                std::thread::yield_now();
                guards = self.x_lock_all();
                if !self.is_enabled() || kill.load(Ordering::Relaxed) {
                    return ok;
                }
                cell_count = guards[part_idx].n_cells();
                if cell >= cell_count {
                    break;
                }
            }

            let inner = &guards[part_idx];
            let mut r = inner.bucket_head(cell);
            while r != NIL {
                let node = inner.node(r);
                if inner.bucket_of(node.fold) != cell {
                    tracing::error!(
                        fold = node.fold,
                        cell,
                        "hash node fold does not match its cell"
                    );
                    ok = false;
                }
                if !self.validate_node(node.fold, node.rec_block, node.rec_offset) {
                    ok = false;
                }
                if single_chunk {
                    *pointer_counts.entry(node.rec_block).or_insert(0) += 1;
                }
                r = node.next;
            }
            cell += 1;
        }

        if single_chunk {
            self.pool.for_each_block(|block| {
                let Some(index) = block.ahi_index() else {
                    return;
                };
                if !std::ptr::eq(self.part_for(index.id()), &self.parts[part_idx]) {
                    return;
                }
                let counted = pointer_counts
                    .get(&block.block_no())
                    .copied()
                    .unwrap_or(0);
                if u32::from(block.n_pointers()) != counted {
                    tracing::error!(
                        block = block.block_no(),
                        recorded = block.n_pointers(),
                        counted,
                        "hash pointer accounting mismatch"
                    );
                    ok = false;
                }
            });
        }

        ok
    }

    fn validate_node(&self, node_fold: u32, rec_block: u32, rec_offset: u16) -> bool {
        let block = self.pool.block(rec_block);
        let Some(index) = block.ahi_index() else {
            tracing::error!(block = rec_block, "hash node points at an unhashed page");
            return false;
        };
        // A block being freed keeps its entries only until the pending
        // drop finishes; anything else must still be mapped.
        debug_assert!(
            block.state() == PageState::RemoveHash || block.page_id().is_some(),
            "hashed block has no page identity"
        );

        let probe = PrefixParams::from_raw(block.curr_params_raw()).without_side();
        let page = block.page();
        let rec = rec_offset as usize;
        if probe.is_empty() || !page.is_user_rec(rec) || page.rec_is_metadata(rec) {
            tracing::error!(
                block = rec_block,
                rec,
                "hash node points at a non-user record"
            );
            return false;
        }
        let fold = rec_fold_dyn(&page, rec, &index, probe);
        if fold != node_fold {
            tracing::error!(
                page = ?block.page_id(),
                node_fold,
                rec_fold = fold,
                "adaptive hash index entry is stale"
            );
            return false;
        }
        true
    }
}

/// Next user record after `rec`, stopping at the supremum.
pub(crate) fn next_user_rec(page: &PageView<'_>, rec: usize) -> Option<usize> {
    match page.next_rec(rec) {
        Some(SUPREMUM_OFFSET) | None => None,
        Some(next) => Some(next),
    }
}
