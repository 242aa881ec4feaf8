//! # Adaptive Hash Index Integration Tests
//!
//! End-to-end scenarios against the public surface:
//!
//! 1. Build through the heuristic, then a successful fast-path lookup.
//! 2. Fingerprint collision policy (LEFT keeps the earlier record, RIGHT
//!    the later).
//! 3. Repair of a missing entry after a failed guess.
//! 4. Concurrent drop vs. global disable.
//! 5. Page split choreography: move entries, then drop the source hash.
//! 6. Single-record insert/delete maintenance.
//! 7. Reference counting, lazy free, disable draining, and validation.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use ahindex::page::INFIMUM_OFFSET;
use ahindex::{
    AhiConfig, BufferPool, Cursor, CursorFlag, Dict, FieldDef, IndexDef, IndexId, LatchMode,
    Mtr, PageId, PrefixParams, RecordFormat, SearchMode, SearchSys, Tuple,
};

fn setup(n_parts: usize) -> (Arc<BufferPool>, Arc<Dict>, Arc<SearchSys>) {
    let pool = Arc::new(BufferPool::new(64).unwrap());
    let dict = Arc::new(Dict::new());
    let sys = SearchSys::new(
        AhiConfig { enabled: true, n_parts },
        pool.clone(),
        dict.clone(),
    )
    .unwrap();
    (pool, dict, Arc::new(sys))
}

fn make_index(dict: &Dict, id: u64) -> Arc<IndexDef> {
    let index = IndexDef::new(
        IndexId(id),
        RecordFormat::Compact,
        vec![FieldDef::variable().big()],
        1,
    )
    .unwrap();
    dict.register(index.clone());
    index
}

fn fill_page(pool: &BufferPool, index: &IndexDef, page_no: u32, values: &[&[u8]]) -> u32 {
    let block_no = pool
        .create_page(PageId::new(0, page_no), index.id(), index.format())
        .unwrap();
    let block = pool.block(block_no);
    let mut latch = block.x_latch();
    block.with_page_mut(&mut latch, |mut page| {
        let mut prev = INFIMUM_OFFSET;
        for v in values {
            prev = page
                .insert_after(index, prev, &Tuple::from_values([*v]))
                .unwrap();
        }
    });
    block_no
}

fn find_rec(pool: &BufferPool, index: &IndexDef, block_no: u32, value: &[u8]) -> usize {
    let page = pool.block(block_no).page();
    let mut rec = page.first_user_rec();
    while let Some(r) = rec {
        if page.rec_field(index, r, 0) == Some(value) {
            return r;
        }
        rec = page.next_rec(r).filter(|&n| !page.is_supremum(n));
    }
    panic!("record {value:?} not on page");
}

/// One B-tree positioning plus the statistics update that follows it.
fn search_and_update(
    sys: &SearchSys,
    pool: &BufferPool,
    index: &Arc<IndexDef>,
    block_no: u32,
    key: &[u8],
    mode: SearchMode,
) -> Cursor {
    let mut cursor = Cursor::new(index.clone());
    let block = pool.block(block_no);
    let _s = block.s_latch();
    cursor.search_leaf(pool, block_no, &Tuple::from_values([key]), mode);
    sys.search_info_update(&mut cursor);
    cursor
}

/// Drives repeated successful positionings until the heuristic builds the
/// page hash.
fn warm_until_built(
    sys: &SearchSys,
    pool: &BufferPool,
    index: &Arc<IndexDef>,
    block_no: u32,
    key: &[u8],
) {
    for _ in 0..150 {
        search_and_update(sys, pool, index, block_no, key, SearchMode::Ge);
    }
    assert!(
        pool.block(block_no).ahi_index().is_some(),
        "heuristic never built the page hash"
    );
}

fn guess(
    sys: &SearchSys,
    pool: &BufferPool,
    index: &Arc<IndexDef>,
    key: &[u8],
    mode: SearchMode,
) -> (bool, Cursor) {
    let mut mtr = Mtr::new(pool);
    let mut cursor = Cursor::new(index.clone());
    let ok = sys.guess_on_hash(
        index,
        &Tuple::from_values([key]),
        mode,
        LatchMode::Shared,
        &mut cursor,
        &mut mtr,
    );
    mtr.commit();
    (ok, cursor)
}

// ============================================================================
// Scenario: build through usage, then a fast-path hit
// ============================================================================

#[test]
fn test_build_then_lookup() {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let block_no = fill_page(&pool, &index, 1, &[b"ant", b"bee", b"cat"]);

    warm_until_built(&sys, &pool, &index, block_no, b"bee");
    assert_eq!(sys.n_nodes(), 3);

    let (ok, cursor) = guess(&sys, &pool, &index, b"bee", SearchMode::Ge);
    assert!(ok, "guess on a freshly built page must hit");
    assert_eq!(cursor.flag, CursorFlag::Hash);
    assert_eq!(cursor.block_no(), Some(block_no));
    let page = pool.block(block_no).page();
    assert_eq!(
        page.rec_field(&index, cursor.rec_off(), 0),
        Some(&b"bee"[..])
    );

    let stats = sys.stats();
    assert!(stats.page_added >= 1);
    assert!(stats.n_succ >= 1);

    let kill = AtomicBool::new(false);
    assert!(sys.validate(&kill));
}

#[test]
fn test_guess_miss_flags_hash_fail() {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let block_no = fill_page(&pool, &index, 1, &[b"ant", b"bee"]);
    warm_until_built(&sys, &pool, &index, block_no, b"ant");

    let (ok, cursor) = guess(&sys, &pool, &index, b"owl", SearchMode::Ge);
    assert!(!ok);
    assert_eq!(cursor.flag, CursorFlag::HashFail);
    assert!(sys.stats().n_fail >= 1);
}

// ============================================================================
// Scenario: collision policy on a shared prefix
// ============================================================================

fn collision_setup(left: bool) -> (Arc<BufferPool>, Arc<SearchSys>, Arc<IndexDef>, u32) {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let block_no = fill_page(&pool, &index, 1, &[b"aa1", b"aa2"]);
    {
        let _s = pool.block(block_no).s_latch();
        // Fingerprint on the first two bytes only: both records collide.
        sys.build_page_hash_index(&index, block_no, PrefixParams::new(0, 2, left));
    }
    (pool, sys, index, block_no)
}

fn erase_through_delete(
    sys: &SearchSys,
    pool: &BufferPool,
    index: &Arc<IndexDef>,
    block_no: u32,
    key: &[u8],
) -> bool {
    let before = sys.stats().row_removed;
    let mut cursor = Cursor::new(index.clone());
    let block = pool.block(block_no);
    let _x = block.x_latch();
    cursor.search_leaf(pool, block_no, &Tuple::from_values([key]), SearchMode::Ge);
    sys.update_hash_on_delete(&cursor);
    sys.stats().row_removed > before
}

#[test]
fn test_collision_policy_left_keeps_first() {
    let (pool, sys, index, block_no) = collision_setup(true);
    assert_eq!(sys.n_nodes(), 1);
    // The single entry points at "aa1": erasing via "aa1" finds it.
    assert!(erase_through_delete(&sys, &pool, &index, block_no, b"aa1"));
}

#[test]
fn test_collision_policy_right_keeps_last() {
    let (pool, sys, index, block_no) = collision_setup(false);
    assert_eq!(sys.n_nodes(), 1);
    assert!(!erase_through_delete(&sys, &pool, &index, block_no, b"aa1"));
    assert!(erase_through_delete(&sys, &pool, &index, block_no, b"aa2"));
}

// ============================================================================
// Scenario: repair after a failed guess
// ============================================================================

#[test]
fn test_repair_after_hash_fail() {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let block_no = fill_page(&pool, &index, 1, &[b"ant", b"bee"]);
    warm_until_built(&sys, &pool, &index, block_no, b"ant");

    // A record arrives without hash maintenance, as after a lost entry.
    {
        let block = pool.block(block_no);
        let ant = find_rec(&pool, &index, block_no, b"ant");
        let mut latch = block.x_latch();
        block.with_page_mut(&mut latch, |mut page| {
            page.insert_after(&index, ant, &Tuple::from_values([&b"bay"[..]]))
                .unwrap();
        });
    }

    let (ok, _) = guess(&sys, &pool, &index, b"bay", SearchMode::Ge);
    assert!(!ok, "the new record has no entry yet");

    // The B-tree fallback positions on "bay" and the statistics update
    // repairs the entry.
    let mut cursor = Cursor::new(index.clone());
    {
        let block = pool.block(block_no);
        let _s = block.s_latch();
        cursor.flag = CursorFlag::HashFail;
        cursor.search_leaf(
            &pool,
            block_no,
            &Tuple::from_values([&b"bay"[..]]),
            SearchMode::Ge,
        );
        sys.search_info_update(&mut cursor);
    }

    let (ok, cursor) = guess(&sys, &pool, &index, b"bay", SearchMode::Ge);
    assert!(ok, "repair must make the next guess succeed");
    let page = pool.block(block_no).page();
    assert_eq!(
        page.rec_field(&index, cursor.rec_off(), 0),
        Some(&b"bay"[..])
    );
}

// ============================================================================
// Scenario: drop racing a global disable
// ============================================================================

#[test]
fn test_drop_races_disable() {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let block_no = fill_page(&pool, &index, 1, &[b"ant", b"bee", b"cat"]);
    warm_until_built(&sys, &pool, &index, block_no, b"bee");
    assert_eq!(index.search_info().ref_count(), 1);

    std::thread::scope(|scope| {
        let dropper = {
            let pool = &pool;
            let sys = &sys;
            scope.spawn(move || {
                let block = pool.block(block_no);
                let _s = block.s_latch();
                sys.drop_page_hash_index(block_no, false);
            })
        };
        let disabler = {
            let sys = &sys;
            scope.spawn(move || sys.disable())
        };
        dropper.join().unwrap();
        disabler.join().unwrap();
    });

    assert!(!sys.is_enabled());
    assert_eq!(index.search_info().ref_count(), 0);
    assert_eq!(sys.n_nodes(), 0);
    assert!(pool.block(block_no).ahi_index().is_none());
}

// ============================================================================
// Scenario: page split
// ============================================================================

#[test]
fn test_move_hash_entries_on_split() {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let src = fill_page(&pool, &index, 1, &[b"a", b"b", b"c", b"d"]);
    warm_until_built(&sys, &pool, &index, src, b"a");
    assert_eq!(sys.n_nodes(), 4);

    let dst = pool
        .create_page(PageId::new(0, 2), index.id(), index.format())
        .unwrap();

    {
        let src_block = pool.block(src);
        let dst_block = pool.block(dst);
        let mut src_latch = src_block.x_latch();
        let mut dst_latch = dst_block.x_latch();

        // Copy the upper half to the new page.
        dst_block.with_page_mut(&mut dst_latch, |mut page| {
            let mut prev = INFIMUM_OFFSET;
            for v in [&b"c"[..], b"d"] {
                prev = page
                    .insert_after(&index, prev, &Tuple::from_values([v]))
                    .unwrap();
            }
        });

        sys.move_or_delete_hash_entries(dst, src);

        // The split then empties and frees the source page: its whole
        // hash goes first, then the records.
        sys.drop_page_hash_index(src, false);
        let c = find_rec(&pool, &index, src, b"c");
        let d = find_rec(&pool, &index, src, b"d");
        src_block.with_page_mut(&mut src_latch, |mut page| {
            page.delete_rec(c);
            page.delete_rec(d);
        });
    }

    assert!(pool.block(src).ahi_index().is_none());
    let dst_index = pool.block(dst).ahi_index().expect("destination hashed");
    assert!(Arc::ptr_eq(&dst_index, &index));
    assert_eq!(sys.n_nodes(), 2);
    assert_eq!(index.search_info().ref_count(), 1);

    // The carried-over parameters serve lookups on the new page.
    let (ok, cursor) = guess(&sys, &pool, &index, b"d", SearchMode::Ge);
    assert!(ok);
    assert_eq!(cursor.block_no(), Some(dst));

    let kill = AtomicBool::new(false);
    assert!(sys.validate(&kill));
}

// ============================================================================
// Scenario: single-record maintenance
// ============================================================================

#[test]
fn test_hash_follows_delete_and_insert() {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let block_no = fill_page(&pool, &index, 1, &[b"ant", b"bee", b"cat"]);
    warm_until_built(&sys, &pool, &index, block_no, b"ant");

    // Delete "bee": hash maintenance first, then the record.
    {
        let block = pool.block(block_no);
        let mut latch = block.x_latch();
        let mut cursor = Cursor::new(index.clone());
        cursor.search_leaf(
            &pool,
            block_no,
            &Tuple::from_values([&b"bee"[..]]),
            SearchMode::Ge,
        );
        sys.update_hash_on_delete(&cursor);
        let bee = cursor.rec_off();
        block.with_page_mut(&mut latch, |mut page| page.delete_rec(bee));
    }
    assert_eq!(sys.n_nodes(), 2);

    // Insert "big" at its position with maintenance.
    {
        let block = pool.block(block_no);
        let mut latch = block.x_latch();
        let mut cursor = Cursor::new(index.clone());
        cursor.search_leaf(
            &pool,
            block_no,
            &Tuple::from_values([&b"big"[..]]),
            SearchMode::Le,
        );
        let prev = cursor.rec_off();
        block.with_page_mut(&mut latch, |mut page| {
            page.insert_after(&index, prev, &Tuple::from_values([&b"big"[..]]))
                .unwrap();
        });
        sys.update_hash_on_insert(&cursor, false);
    }
    assert_eq!(sys.n_nodes(), 3);

    let (ok, _) = guess(&sys, &pool, &index, b"big", SearchMode::Ge);
    assert!(ok, "maintained entry must serve lookups");
    let (ok, _) = guess(&sys, &pool, &index, b"bee", SearchMode::Ge);
    assert!(!ok, "deleted record must not be found");

    let kill = AtomicBool::new(false);
    assert!(sys.validate(&kill));
}

// ============================================================================
// Reference accounting, lazy free, lifecycle
// ============================================================================

#[test]
fn test_ref_count_tracks_hashed_pages() {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let p1 = fill_page(&pool, &index, 1, &[b"a", b"b"]);
    let p2 = fill_page(&pool, &index, 2, &[b"x", b"y"]);

    for block_no in [p1, p2] {
        let block = pool.block(block_no);
        let _s = block.s_latch();
        sys.build_page_hash_index(&index, block_no, PrefixParams::new(1, 0, true));
    }
    assert_eq!(index.search_info().ref_count(), 2);

    {
        let _s = pool.block(p1).s_latch();
        sys.drop_page_hash_index(p1, false);
    }
    assert_eq!(index.search_info().ref_count(), 1);

    sys.disable();
    assert_eq!(index.search_info().ref_count(), 0);
}

#[test]
fn test_lazy_free_on_last_page_drop() {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let block_no = fill_page(&pool, &index, 1, &[b"a", b"b"]);
    {
        let _s = pool.block(block_no).s_latch();
        sys.build_page_hash_index(&index, block_no, PrefixParams::new(1, 0, true));
    }

    dict.drop_index(IndexId(7));
    assert!(index.is_freed());
    assert_eq!(dict.n_freed(), 1, "still referenced by one hashed page");

    {
        let _s = pool.block(block_no).s_latch();
        sys.drop_page_hash_index(block_no, false);
    }
    assert_eq!(dict.n_freed(), 0, "last reference triggers the lazy free");
    assert_eq!(sys.n_nodes(), 0);
}

#[test]
fn test_garbage_collect_only_touches_freed_indexes() {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let block_no = fill_page(&pool, &index, 1, &[b"a", b"b"]);
    {
        let _s = pool.block(block_no).s_latch();
        sys.build_page_hash_index(&index, block_no, PrefixParams::new(1, 0, true));
    }

    {
        let _s = pool.block(block_no).s_latch();
        sys.drop_page_hash_index(block_no, true);
    }
    assert!(
        pool.block(block_no).ahi_index().is_some(),
        "a live index is not garbage"
    );

    dict.drop_index(IndexId(7));
    {
        let _s = pool.block(block_no).s_latch();
        sys.drop_page_hash_index(block_no, true);
    }
    assert!(pool.block(block_no).ahi_index().is_none());
}

#[test]
fn test_disable_drains_everything() {
    let (pool, dict, sys) = setup(4);
    let mut pages = Vec::new();
    for id in 0..4u64 {
        let index = make_index(&dict, 10 + id);
        let block_no = fill_page(&pool, &index, 10 + id as u32, &[b"k1", b"k2", b"k3"]);
        let block = pool.block(block_no);
        let _s = block.s_latch();
        sys.build_page_hash_index(&index, block_no, PrefixParams::new(1, 0, true));
        pages.push(block_no);
    }
    assert!(sys.n_nodes() > 0);

    sys.disable();

    assert_eq!(sys.n_nodes(), 0);
    assert_eq!(sys.n_slab_blocks(), 0);
    assert_eq!(pool.slab_frames_outstanding(), 0, "spares returned too");
    pool.for_each_block(|block| assert!(block.ahi_index().is_none()));

    // Re-enable starts empty and functional.
    sys.enable(false);
    assert!(sys.is_enabled());
    assert_eq!(sys.n_nodes(), 0);
}

#[test]
fn test_enable_respects_pending_resize() {
    let (pool, dict, sys) = setup(1);
    let _ = dict;
    sys.disable();
    pool.set_resize_pending(true);
    sys.enable(false);
    assert!(!sys.is_enabled(), "enable defers to a pending pool resize");
    sys.enable(true);
    assert!(sys.is_enabled(), "the resize path itself may enable");
    pool.set_resize_pending(false);
}

#[test]
fn test_eviction_drops_page_hash() {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let page_id = PageId::new(0, 1);
    let block_no = fill_page(&pool, &index, 1, &[b"a", b"b"]);
    {
        let _s = pool.block(block_no).s_latch();
        sys.build_page_hash_index(&index, block_no, PrefixParams::new(1, 0, true));
    }
    assert_eq!(sys.n_nodes(), 2);

    assert!(pool.evict_page(page_id, |b| sys.drop_page_hash_index(b, false)));
    assert_eq!(sys.n_nodes(), 0);
    assert_eq!(index.search_info().ref_count(), 0);
}

#[test]
fn test_drop_page_hash_when_freed() {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let page_id = PageId::new(0, 1);
    let block_no = fill_page(&pool, &index, 1, &[b"a", b"b"]);
    {
        let _s = pool.block(block_no).s_latch();
        sys.build_page_hash_index(&index, block_no, PrefixParams::new(1, 0, true));
    }

    sys.drop_page_hash_when_freed(page_id);
    assert!(pool.block(block_no).ahi_index().is_none());
    assert_eq!(sys.n_nodes(), 0);

    // A page that is not buffered is a no-op.
    sys.drop_page_hash_when_freed(PageId::new(0, 99));
}

#[test]
fn test_validate_honors_kill_flag() {
    let (pool, dict, sys) = setup(2);
    let index = make_index(&dict, 7);
    let block_no = fill_page(&pool, &index, 1, &[b"a", b"b"]);
    {
        let _s = pool.block(block_no).s_latch();
        sys.build_page_hash_index(&index, block_no, PrefixParams::new(1, 0, true));
    }

    let kill = AtomicBool::new(true);
    assert!(sys.validate(&kill), "a killed check reports no corruption");
    let kill = AtomicBool::new(false);
    assert!(sys.validate(&kill));
}

#[test]
fn test_guess_respects_latch_contention() {
    let (pool, dict, sys) = setup(1);
    let index = make_index(&dict, 7);
    let block_no = fill_page(&pool, &index, 1, &[b"ant", b"bee"]);
    warm_until_built(&sys, &pool, &index, block_no, b"ant");

    // Make sure a guess would otherwise succeed.
    let (ok, _) = guess(&sys, &pool, &index, b"ant", SearchMode::Ge);
    assert!(ok);

    // With the page exclusively latched elsewhere, the non-blocking try
    // fails and the guess turns into a clean miss.
    let block = pool.block(block_no);
    let _x = block.x_latch();
    let mut mtr = Mtr::new(&pool);
    let mut cursor = Cursor::new(index.clone());
    let ok = sys.guess_on_hash(
        &index,
        &Tuple::from_values([&b"ant"[..]]),
        SearchMode::Ge,
        LatchMode::Shared,
        &mut cursor,
        &mut mtr,
    );
    assert!(!ok);
    assert_eq!(cursor.flag, CursorFlag::HashFail);
    assert_eq!(mtr.n_pages(), 0);
}
