//! # Building, Dropping, and Maintaining Per-Page Hashes
//!
//! A page hash is built and dropped in batches: records are fingerprinted
//! into a fixed staging array *without* the partition latch, then flushed
//! into (or out of) the chains under a short exclusive-latch window, and
//! the scan resumes. A page therefore never holds the latch for its full
//! record count, and a drop re-fingerprints under the latch so concurrent
//! splits cannot leak nodes.
//!
//! Single-record maintenance (insert/delete) fingerprints the affected
//! neighborhood - the record before the insert, the inserted record, and
//! its successor - and applies the side policy to decide which of them
//! now owns a hash entry.

use std::sync::Arc;

use parking_lot::RwLockWriteGuard;

use crate::config::{BUILD_BATCH, DROP_BATCH};
use crate::cursor::{Cursor, CursorFlag};
use crate::dict::IndexDef;
use crate::fold::rec_fold_dyn;
use crate::monitor::SearchStats;
use crate::pool::{Block, RecPtr};
use crate::records::PrefixParams;

use super::next_user_rec;
use super::partition::{Partition, PartitionInner};
use super::SearchSys;

impl SearchSys {
    /// Builds a hash for every record of the page under the given prefix
    /// parameters. An existing hash with different parameters (or for a
    /// different index instance) is dropped first. The caller holds the
    /// page latch in some mode.
    pub fn build_page_hash_index(
        &self,
        index: &Arc<IndexDef>,
        block_no: u32,
        params: PrefixParams,
    ) {
        if !self.is_enabled() {
            return;
        }
        let pool = &*self.pool;
        let block = pool.block(block_no);
        debug_assert!(block.latch.is_locked());
        debug_assert!(!index.is_ibuf());

        let part = self.part_for(index.id());
        let rebuild = {
            let _rd = part.latch.read();
            if !self.is_enabled() {
                return;
            }
            match block.ahi_index() {
                Some(block_index) => {
                    !Arc::ptr_eq(&block_index, index)
                        || block.curr_params_raw() != params.raw()
                }
                None => false,
            }
        };
        if rebuild {
            self.drop_page_hash_index(block_no, false);
        }

        let probe = params.without_side();
        if probe.is_empty() {
            return;
        }
        if (index.n_uniq_in_tree() as usize) < probe.n_probe_fields() {
            // The prefix would not pin down a unique record; hashing on
            // it cannot help.
            return;
        }

        let page = block.page();
        debug_assert_eq!(page.index_id(), index.id());
        let left_side = params.left_side();

        let mut staged = [(0u32, 0u16); BUILD_BATCH];
        let mut n_staged = 0usize;
        let mut rec = page.first_user_rec();

        loop {
            while let Some(r) = rec {
                let fold = rec_fold_dyn(&page, r, index, probe);
                rec = next_user_rec(&page, r);
                if n_staged > 0 && staged[n_staged - 1].0 == fold {
                    // Fingerprint collision between neighbors: the side
                    // policy picks which record owns the entry.
                    if !left_side {
                        staged[n_staged - 1].1 = r0_u16(r);
                    }
                    continue;
                }
                staged[n_staged] = (fold, r0_u16(r));
                n_staged += 1;
                if n_staged == BUILD_BATCH {
                    break;
                }
            }

            part.prepare_insert(pool, self.is_enabled());
            let mut inner = part.latch.write();
            if !self.is_enabled() {
                return;
            }
            match block.ahi_index() {
                None => {
                    debug_assert_eq!(block.n_pointers(), 0);
                    index.search_info().ref_count_inc();
                    block.set_ahi_index(Some(index.clone()));
                }
                Some(block_index) => {
                    if !Arc::ptr_eq(&block_index, index)
                        || block.curr_params_raw() != params.raw()
                    {
                        // A competing build with other parameters won.
                        return;
                    }
                }
            }
            block.set_n_hash_helps(0);
            block.set_curr_params_raw(params.raw());

            for &(fold, offset) in staged[..n_staged].iter() {
                inner.insert(fold, RecPtr { block_no, offset }, part.spare(), pool);
            }
            SearchStats::add(&self.stats.row_added, n_staged as u64);
            n_staged = 0;

            if rec.is_none() {
                SearchStats::inc(&self.stats.page_added);
                return;
            }
            drop(inner);
        }
    }

    /// Removes every hash entry pointing into the page. With
    /// `garbage_collect` set, only pages of freed indexes are touched.
    /// The caller holds a page latch, or the block is unreferenced
    /// (eviction).
    pub fn drop_page_hash_index(&self, block_no: u32, garbage_collect: bool) {
        let pool = &*self.pool;
        'retry: loop {
            let block = pool.block(block_no);
            if block.ahi_index().is_none() {
                return;
            }
            let page = block.page();
            let part = self.part_for(page.index_id());

            // Freed indexes are handled entirely under the exclusive
            // latch: nothing else updates their pages anymore, and the
            // re-fingerprint scan must not race a lazy free.
            let index: Arc<IndexDef>;
            let left_raw: u32;
            let mut held: Option<RwLockWriteGuard<'_, PartitionInner>> = None;
            {
                let rd = part.latch.read();
                if !self.is_enabled() {
                    return;
                }
                match block.ahi_index() {
                    Some(i) => index = i,
                    None => return,
                }
                if index.is_freed() {
                    drop(rd);
                    let wr = part.latch.write();
                    let same = matches!(block.ahi_index(),
                                        Some(cur) if Arc::ptr_eq(&cur, &index));
                    if !same {
                        continue 'retry;
                    }
                    left_raw = block.curr_params_raw();
                    held = Some(wr);
                } else if garbage_collect {
                    return;
                } else {
                    left_raw = block.curr_params_raw();
                }
            }
            let is_freed = held.is_some();
            let probe = PrefixParams::from_raw(left_raw).without_side();
            debug_assert!(!probe.is_empty());
            debug_assert_eq!(page.index_id(), index.id());

            let mut folds = [0u32; DROP_BATCH];
            let mut n_folds = 0usize;
            let mut rec = page.first_user_rec();

            loop {
                while let Some(r) = rec {
                    let fold = rec_fold_dyn(&page, r, &index, probe);
                    rec = next_user_rec(&page, r);
                    if n_folds > 0 && folds[n_folds - 1] == fold {
                        continue;
                    }
                    folds[n_folds] = fold;
                    n_folds += 1;
                    if n_folds == DROP_BATCH {
                        break;
                    }
                }

                let mut inner = match held.take() {
                    Some(guard) => guard,
                    None => part.latch.write(),
                };
                if block.ahi_index().is_none() {
                    // Someone else dropped the hash meanwhile.
                    return;
                }
                if (block.curr_params_raw() ^ left_raw) & !PrefixParams::LEFT_SIDE != 0 {
                    // Someone rebuilt with different parameters; the folds
                    // staged so far are useless.
                    drop(inner);
                    continue 'retry;
                }

                let mut removed = 0usize;
                for &fold in folds[..n_folds].iter() {
                    removed += inner.erase_all_on_page(fold, block_no, part.spare(), pool);
                }
                SearchStats::add(&self.stats.row_removed, removed as u64);
                n_folds = 0;

                if rec.is_some() {
                    if is_freed {
                        held = Some(inner);
                    } else {
                        drop(inner);
                    }
                    continue;
                }

                if index.search_info().ref_count_dec() == 1 && index.is_freed() {
                    self.lazy_free(&index);
                }
                block.set_ahi_index(None);
                SearchStats::inc(&self.stats.page_removed);
                return;
            }
        }
    }

    /// Page split/merge maintenance. If the destination already has a
    /// hash, the source hash is dropped; otherwise the source's
    /// parameters are carried over and the destination is built.
    pub fn move_or_delete_hash_entries(&self, new_block_no: u32, block_no: u32) {
        if !self.is_enabled() {
            return;
        }
        let pool = &*self.pool;
        let block = pool.block(block_no);
        let new_block = pool.block(new_block_no);
        debug_assert!(block.latch.is_locked_exclusive());
        debug_assert!(new_block.latch.is_locked_exclusive());

        if new_block.ahi_index().is_some() {
            self.drop_page_hash_index(block_no, false);
            return;
        }
        let Some(index) = block.ahi_index() else {
            return;
        };

        let part = self.part_for(index.id());
        let carried = {
            let _rd = part.latch.read();
            if index.is_freed() {
                None
            } else if block.ahi_index().is_some() {
                let raw = block.curr_params_raw();
                new_block.set_next_params_raw(raw);
                Some(raw)
            } else {
                return;
            }
        };

        match carried {
            None => self.drop_page_hash_index(block_no, false),
            Some(raw) => {
                let params = PrefixParams::from_raw(raw);
                debug_assert!(!params.without_side().is_empty());
                self.build_page_hash_index(&index, new_block_no, params);
            }
        }
    }

    /// Maintains the page hash after one record was inserted. The cursor
    /// is positioned on the record *before* the insert; the caller holds
    /// the page exclusively. `reorg` disables the node-patch shortcut
    /// after a page reorganization moved records around.
    pub fn update_hash_on_insert(&self, cursor: &Cursor, reorg: bool) {
        if !self.is_enabled() {
            return;
        }
        let pool = &*self.pool;
        let Some(cursor_rec) = cursor.rec_ptr() else {
            return;
        };
        let block_no = cursor_rec.block_no;
        let block = pool.block(block_no);
        debug_assert!(block.latch.is_locked_exclusive());

        let Some(index) = block.ahi_index() else {
            return;
        };
        if !Arc::ptr_eq(&index, cursor.index()) {
            debug_assert_eq!(index.id(), cursor.index().id());
            self.drop_page_hash_index(block_no, false);
            return;
        }

        let part = self.part_for(index.id());
        let left = PrefixParams::from_raw(block.curr_params_raw());
        let page = block.page();
        let rec_off = cursor_rec.offset as usize;

        // The insert landed exactly where a successful hash guess with the
        // page's own parameters pointed: the guessed node just needs to be
        // repointed at the new record.
        if !reorg && cursor.flag == CursorFlag::Hash && left.without_side() == cursor.probe()
        {
            let mut inner = part.latch.write();
            if !self.is_enabled() || block.ahi_index().is_none() {
                return;
            }
            match page.next_rec(rec_off).filter(|&r| page.is_user_rec(r)) {
                Some(ins) => {
                    let found = inner.update_if_found(
                        cursor.fold(),
                        cursor_rec,
                        RecPtr { block_no, offset: ins as u16 },
                        pool,
                    );
                    debug_assert!(found, "guessed node vanished before the insert");
                    if found {
                        SearchStats::inc(&self.stats.row_updated);
                    }
                }
                None => debug_assert!(false, "inserted record is not on the page"),
            }
            return;
        }

        let probe = left.without_side();
        let Some(ins_off) = page.next_rec(rec_off).filter(|&r| page.is_user_rec(r)) else {
            // The chain is not what the cursor promised.
            self.drop_page_hash_index(block_no, false);
            return;
        };
        let Some(next_off) = page.next_rec(ins_off) else {
            self.drop_page_hash_index(block_no, false);
            return;
        };

        let ins_ptr = RecPtr { block_no, offset: ins_off as u16 };
        let ins_fold = rec_fold_dyn(&page, ins_off, &index, probe);
        let next_is_supremum = page.is_supremum(next_off);
        let next_fold = if next_is_supremum {
            0
        } else {
            rec_fold_dyn(&page, next_off, &index, probe)
        };
        let rec_valid = page.is_user_rec(rec_off) && !page.rec_is_metadata(rec_off);
        let rec_fold_val = if rec_valid {
            rec_fold_dyn(&page, rec_off, &index, probe)
        } else {
            0
        };

        part.prepare_insert(pool, self.is_enabled());
        let mut locked: Option<RwLockWriteGuard<'_, PartitionInner>> = None;

        // Boundary between the predecessor and the insert.
        if !rec_valid {
            // Inserted at the start of the page: under the LEFT policy the
            // first record of a run owns the entry.
            if left.left_side() {
                if !lock_for_update(&mut locked, part, self, block) {
                    return;
                }
                if let Some(inner) = locked.as_mut() {
                    inner.insert(ins_fold, ins_ptr, part.spare(), pool);
                    SearchStats::inc(&self.stats.row_added);
                }
            }
        } else if rec_fold_val != ins_fold {
            if !lock_for_update(&mut locked, part, self, block) {
                return;
            }
            let (fold, ptr) = if left.left_side() {
                (ins_fold, ins_ptr)
            } else {
                (rec_fold_val, cursor_rec)
            };
            if let Some(inner) = locked.as_mut() {
                inner.insert(fold, ptr, part.spare(), pool);
                SearchStats::inc(&self.stats.row_added);
            }
        }

        // Boundary between the insert and its successor.
        if next_is_supremum {
            // The new last record of the page owns its run under RIGHT.
            if !left.left_side() {
                if !lock_for_update(&mut locked, part, self, block) {
                    return;
                }
                if let Some(inner) = locked.as_mut() {
                    inner.insert(ins_fold, ins_ptr, part.spare(), pool);
                    SearchStats::inc(&self.stats.row_added);
                }
            }
        } else if ins_fold != next_fold {
            if !lock_for_update(&mut locked, part, self, block) {
                return;
            }
            let (fold, ptr) = if left.left_side() {
                (next_fold, RecPtr { block_no, offset: next_off as u16 })
            } else {
                (ins_fold, ins_ptr)
            };
            if let Some(inner) = locked.as_mut() {
                inner.insert(fold, ptr, part.spare(), pool);
                SearchStats::inc(&self.stats.row_added);
            }
        }
    }

    /// Removes the doomed record's hash entry before it is deleted. The
    /// cursor is positioned on the record; the caller holds the page
    /// exclusively.
    pub fn update_hash_on_delete(&self, cursor: &Cursor) {
        if !self.is_enabled() {
            return;
        }
        let pool = &*self.pool;
        let Some(rec) = cursor.rec_ptr() else {
            return;
        };
        let block = pool.block(rec.block_no);
        debug_assert!(block.latch.is_locked_exclusive());

        let Some(index) = block.ahi_index() else {
            return;
        };
        if !Arc::ptr_eq(&index, cursor.index()) {
            debug_assert_eq!(index.id(), cursor.index().id());
            self.drop_page_hash_index(rec.block_no, false);
            return;
        }

        let probe = PrefixParams::from_raw(block.curr_params_raw()).without_side();
        debug_assert!(!probe.is_empty());
        let page = block.page();
        let fold = rec_fold_dyn(&page, rec.offset as usize, &index, probe);

        let part = self.part_for(index.id());
        let mut inner = part.latch.write();
        if block.ahi_index().is_some() && self.is_enabled() {
            if inner.erase(fold, rec, part.spare(), pool) {
                SearchStats::inc(&self.stats.row_removed);
            } else {
                SearchStats::inc(&self.stats.row_remove_not_found);
            }
        }
    }
}

#[inline]
fn r0_u16(origin: usize) -> u16 {
    debug_assert!(origin <= u16::MAX as usize);
    origin as u16
}

/// Takes the partition latch once across the insert branches, re-checking
/// the enable flag and the page's hash under it. Returns false when the
/// whole maintenance operation should be abandoned.
fn lock_for_update<'a>(
    locked: &mut Option<RwLockWriteGuard<'a, PartitionInner>>,
    part: &'a Partition,
    sys: &SearchSys,
    block: &Block,
) -> bool {
    if locked.is_some() {
        return true;
    }
    let guard = part.latch.write();
    if !sys.is_enabled() || block.ahi_index().is_none() {
        return false;
    }
    *locked = Some(guard);
    true
}
