//! # Self-Tuning Heuristics
//!
//! Two layers of statistics decide when a page earns a hash:
//!
//! 1. **Per index** ([`info_update`]): every positioning compares the
//!    current prefix recommendation against the cursor's low/up match
//!    state. A recommendation that keeps "working" grows a success streak
//!    (`n_hash_potential`); one on the wrong side of the landing point is
//!    re-derived from whichever neighbor matched tighter, and the streak
//!    restarts.
//! 2. **Per page** ([`update_block_info`]): a page counts accesses
//!    consistent with the recommendation (`n_hash_helps`). Once the index
//!    streak passes `BUILD_LIMIT` and the page counter passes the page's
//!    own record count thresholds, a build is recommended.
//!
//! All reads and writes here are relaxed and unlatched. Racing updates can
//! clobber each other; the only cost is slower convergence.

use crate::config::{BUILD_LIMIT, PAGE_BUILD_LIMIT};
use crate::cursor::Cursor;
use crate::dict::{IndexDef, SearchInfo};
use crate::page::PageView;
use crate::pool::Block;
use crate::records::PrefixParams;

/// Updates the per-index prefix recommendation from a just-finished
/// positioning. Completely unsynchronized by design.
pub(crate) fn info_update(index: &IndexDef, cursor: &Cursor) {
    if index.is_ibuf() {
        // Change-buffer trees see too many deletes to be worth hashing.
        return;
    }

    let n_unique = index.n_uniq_in_tree();
    let info = index.search_info();

    let n_potential = info.n_hash_potential();
    if n_potential == 0 {
        // First sighting: recommend hashing on the full first field.
        info.set_left_bytes_fields(PrefixParams::new(1, 0, true));
        info.hash_analysis_reset();
        info.bump_potential();
        return;
    }

    let rec = info.left_bytes_fields();

    // The recommendation already pins down a unique record and so did the
    // search: it would have succeeded through the hash.
    if rec.n_fields() >= n_unique && cursor.up_match >= n_unique {
        info.bump_potential();
        return;
    }

    // Compare the recommendation's position against both neighbors of the
    // landing point, packed as fields << 16 | bytes.
    let info_cmp = (i32::from(rec.n_fields()) << 16) | i32::from(rec.n_bytes());
    let low_cmp = (i32::from(cursor.low_match) << 16) | i32::from(cursor.low_bytes);
    let up_cmp = (i32::from(cursor.up_match) << 16) | i32::from(cursor.up_bytes);
    let left_side = rec.left_side();

    if left_side == (info_cmp <= low_cmp) {
        // Wrong side of the low neighbor: fall through and re-derive.
    } else if left_side == (info_cmp <= up_cmp) {
        info.bump_potential();
        return;
    }

    // Derive a fresh recommendation from the tighter neighbor.
    let cmp = up_cmp - low_cmp;
    let new_left = cmp >= 0;
    let (n_fields, n_bytes) = if new_left {
        if cursor.up_match >= n_unique {
            (n_unique, 0)
        } else if cursor.low_match < cursor.up_match {
            (cursor.low_match + 1, 0)
        } else {
            (cursor.low_match, cursor.low_bytes + 1)
        }
    } else if cursor.low_match >= n_unique {
        (n_unique, 0)
    } else if cursor.low_match > cursor.up_match {
        (cursor.up_match + 1, 0)
    } else {
        (cursor.up_match, cursor.up_bytes + 1)
    };

    // A new recommendation: skip analysis for a while, there is no chance
    // of success until accesses stabilize around it.
    info.hash_analysis_reset();
    info.set_left_bytes_fields(PrefixParams::new(n_fields, n_bytes, new_left));
    info.set_n_hash_potential(u8::from(cmp != 0));
}

/// Updates the page's usefulness counters and reports whether building
/// (or rebuilding) a hash for the page is recommended. The caller holds
/// the page latch in some mode.
pub(crate) fn update_block_info(info: &SearchInfo, block: &Block, page: &PageView<'_>) -> bool {
    debug_assert!(block.latch.is_locked());

    let n_hash_helps = block.n_hash_helps();
    let n_potential = info.n_hash_potential();
    let info_left = info.left_raw();

    if n_hash_helps > 0 && n_potential > 0 && block.next_params_raw() == info_left {
        let index = block.ahi_index();
        let curr_left = block.curr_params_raw();

        info.set_last_hash_succ(index.is_some() && curr_left == info_left);

        if n_potential >= BUILD_LIMIT {
            let n_recs = page.n_recs();
            if n_hash_helps / 2 > n_recs {
                return true;
            }
            if n_hash_helps >= n_recs / PAGE_BUILD_LIMIT
                && (index.is_none() || info_left != curr_left)
            {
                return true;
            }
        }

        // Saturate rather than wrap back to "never helped".
        if let Some(bumped) = n_hash_helps.checked_add(1) {
            block.set_n_hash_helps(bumped);
        }
    } else {
        info.set_last_hash_succ(false);
        block.set_n_hash_helps(1);
        block.set_next_params_raw(info_left);
    }

    false
}
