//! # Guess-on-Hash Fast Path
//!
//! The fast path turns an equality probe into a direct jump onto a leaf
//! record, skipping the B-tree descent. Its life is validation: the guess
//! is only trusted after the page's identity, state, and the record's
//! relationship to the probe tuple have all been re-checked against live
//! data, because the hash may be stale in every way that matters.
//!
//! A failed guess flags the cursor `HashFail`; the B-tree fallback then
//! runs `search_info_update`, whose repair step inserts the correct entry
//! for the record the real search found. Collision- and boundary-induced
//! misses heal themselves this way - repair is part of the lookup
//! protocol, not an optimization.

use std::sync::Arc;

use crate::cursor::{Cursor, CursorFlag, LatchMode, Mtr, PageGuard, SearchMode};
use crate::dict::{IndexDef, SearchInfo};
use crate::fold::{rec_fold_dyn, tuple_fold};
use crate::monitor::SearchStats;
use crate::pool::PageState;
use crate::records::{PrefixParams, Tuple};

use super::SearchSys;

impl SearchSys {
    /// Attempts to position `cursor` straight onto the record matching
    /// `tuple`, using the index's recommended prefix. On success the page
    /// is pinned and latched into `mtr` and the cursor is positioned; on
    /// failure the caller falls back to the B-tree.
    ///
    /// The search info reads here are unlatched on purpose: a torn read
    /// can only cause a wasted probe, and the probe re-validates
    /// everything it touches.
    pub fn guess_on_hash<'p>(
        &self,
        index: &Arc<IndexDef>,
        tuple: &Tuple,
        mode: SearchMode,
        latch_mode: LatchMode,
        cursor: &mut Cursor,
        mtr: &mut Mtr<'p>,
    ) -> bool {
        debug_assert!(Arc::ptr_eq(index, cursor.index()));
        let pool = mtr.pool();
        debug_assert!(std::ptr::eq(pool, &**self.pool()));

        let info = index.search_info();
        if !info.last_hash_succ() || info.n_hash_potential() == 0 || tuple.is_metadata() {
            return false;
        }

        let probe = info.left_bytes_fields().without_side();
        cursor.probe = probe;
        if probe.is_empty() || tuple.n_fields() < probe.n_probe_fields() {
            return false;
        }

        let index_id = index.id();
        let fold = tuple_fold(tuple, index, probe);
        cursor.fold = fold;
        cursor.flag = CursorFlag::Hash;

        let part = self.part_for(index_id);
        let hit = {
            let inner = part.latch.read();
            (|| {
                if !self.is_enabled() {
                    return None;
                }
                let node = inner.lookup(fold)?;
                let rec = node.rec();
                let block = pool.block(rec.block_no);

                // The chain lock pins the block's identity while we try
                // the page latch; eviction takes the same lock before it
                // invalidates the frame.
                let page_id = block.page_id()?;
                let guard = {
                    let _chain = pool.chain_lock_for(page_id).lock();
                    match latch_mode {
                        LatchMode::Shared => block.try_s_latch().map(PageGuard::S),
                        LatchMode::Exclusive => block.try_x_latch().map(PageGuard::X),
                    }
                }?;

                if block.state() < PageState::Unfixed {
                    return None;
                }
                let block_index = block.ahi_index()?;
                if !Arc::ptr_eq(&block_index, index) && block_index.id() == index_id {
                    // Same id, different instance: only a dropped-and-
                    // detached index can look like this.
                    debug_assert!(block_index.is_freed());
                    return None;
                }

                block.fix();
                Some((rec, guard))
            })()
            // The partition latch drops here; the page is already fixed
            // and latched, so the node may die without taking the record
            // away from us.
        };

        let Some((rec, guard)) = hit else {
            return self.guess_fail(cursor, info);
        };
        mtr.memo_push(rec.block_no, guard);

        // Validate against the live page.
        let block = pool.block(rec.block_no);
        let page = block.page();
        let off = rec.offset as usize;
        if page.index_id() != index_id
            || !page.is_user_rec(off)
            || page.rec_is_metadata(off)
        {
            mtr.release_last_page();
            return self.guess_fail(cursor, info);
        }
        cursor.position(rec.block_no, off);
        if cursor.check_mismatch(pool, tuple, mode) {
            mtr.release_last_page();
            return self.guess_fail(cursor, info);
        }

        info.bump_potential();
        info.set_last_hash_succ(true);
        SearchStats::inc(&self.stats.n_succ);
        true
    }

    fn guess_fail(&self, cursor: &mut Cursor, info: &SearchInfo) -> bool {
        cursor.flag = CursorFlag::HashFail;
        info.set_last_hash_succ(false);
        SearchStats::inc(&self.stats.n_fail);
        false
    }

    /// Repairs one stale or missing hash entry after a failed guess: the
    /// record the B-tree fallback actually found is (re-)inserted under
    /// the page's current parameters, provided they still match the
    /// recommendation the probe used. The caller holds the page latch.
    pub(crate) fn update_hash_ref(&self, cursor: &Cursor) {
        debug_assert_eq!(cursor.flag, CursorFlag::HashFail);
        let pool = &*self.pool;
        let Some(rec) = cursor.rec_ptr() else {
            return;
        };
        let block = pool.block(rec.block_no);
        debug_assert!(block.latch.is_locked());

        let Some(index) = block.ahi_index() else {
            return;
        };
        if index.search_info().n_hash_potential() == 0 {
            return;
        }
        if !Arc::ptr_eq(&index, cursor.index()) {
            debug_assert_eq!(index.id(), cursor.index().id());
            self.drop_page_hash_index(rec.block_no, false);
            return;
        }

        let part = self.part_for(index.id());
        part.prepare_insert(pool, self.is_enabled());
        let mut inner = part.latch.write();

        let curr = block.curr_params_raw();
        if block.ahi_index().is_none()
            || curr != index.search_info().left_raw()
            || !self.is_enabled()
        {
            return;
        }

        let page = block.page();
        let off = rec.offset as usize;
        if !page.is_user_rec(off) || page.rec_is_metadata(off) {
            return;
        }
        let probe = PrefixParams::from_raw(curr).without_side();
        let fold = rec_fold_dyn(&page, off, &index, probe);
        inner.insert(fold, rec, part.spare(), pool);
        SearchStats::inc(&self.stats.row_added);
    }
}
