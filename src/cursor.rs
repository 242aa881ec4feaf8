//! # Positioning Cursor and Mini-Transaction
//!
//! The cursor is the contract between the B-tree and the hash index. A
//! leaf positioning fills in where the search landed and how many leading
//! fields and bytes matched the neighbors on either side of the landing
//! point; the adaptive heuristic reads exactly those numbers. A fast-path
//! hash lookup fills the same cursor and validates its guess with
//! [`Cursor::check_mismatch`] before anyone trusts it.
//!
//! [`Mtr`] is the mini-transaction: an RAII bag of pinned, latched pages.
//! A successful hash guess hands its page latch to the caller's `Mtr`, so
//! the page stays valid exactly as long as the caller keeps the handle.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::dict::IndexDef;
use crate::page::{PageView, INFIMUM_OFFSET, SUPREMUM_OFFSET};
use crate::pool::{BufferPool, RecPtr};
use crate::records::{PrefixParams, Tuple};

/// Which record a positioning should land on relative to the tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// First record greater than or equal to the tuple.
    Ge,
    /// Last record less than or equal to the tuple (the insert position).
    Le,
}

/// Page latch mode requested from the fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

/// How the cursor reached its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorFlag {
    /// Ordinary binary/linear search.
    Binary,
    /// Successful hash guess.
    Hash,
    /// Failed hash guess; the caller fell back to the B-tree and the next
    /// statistics update may repair one stale entry.
    HashFail,
}

/// A cursor positioned (or about to be positioned) on a leaf page.
#[derive(Debug, Clone)]
pub struct Cursor {
    index: Arc<IndexDef>,
    block_no: Option<u32>,
    rec: usize,
    /// Matched fields/bytes against the record on the low side of the
    /// landing point.
    pub low_match: u16,
    pub low_bytes: u16,
    /// Matched fields/bytes against the record on the up side.
    pub up_match: u16,
    pub up_bytes: u16,
    /// Prefix used for the latest hash probe (side flag stripped).
    pub(crate) probe: PrefixParams,
    /// Fold of the probe tuple, kept for node patching on insert.
    pub(crate) fold: u32,
    pub flag: CursorFlag,
}

impl Cursor {
    pub fn new(index: Arc<IndexDef>) -> Self {
        Cursor {
            index,
            block_no: None,
            rec: INFIMUM_OFFSET,
            low_match: 0,
            low_bytes: 0,
            up_match: 0,
            up_bytes: 0,
            probe: PrefixParams::from_raw(0),
            fold: 0,
            flag: CursorFlag::Binary,
        }
    }

    #[inline]
    pub fn index(&self) -> &Arc<IndexDef> {
        &self.index
    }

    #[inline]
    pub fn block_no(&self) -> Option<u32> {
        self.block_no
    }

    /// Record origin on the positioned page.
    #[inline]
    pub fn rec_off(&self) -> usize {
        self.rec
    }

    #[inline]
    pub fn rec_ptr(&self) -> Option<RecPtr> {
        self.block_no.map(|block_no| RecPtr {
            block_no,
            offset: self.rec as u16,
        })
    }

    #[inline]
    pub fn probe(&self) -> PrefixParams {
        self.probe
    }

    #[inline]
    pub fn fold(&self) -> u32 {
        self.fold
    }

    #[inline]
    pub fn position(&mut self, block_no: u32, rec: usize) {
        self.block_no = Some(block_no);
        self.rec = rec;
    }

    /// Positions the cursor on a leaf page by linear search, recording
    /// the match state with both neighbors of the landing point. The
    /// caller holds the page latch.
    pub fn search_leaf(
        &mut self,
        pool: &BufferPool,
        block_no: u32,
        tuple: &Tuple,
        mode: SearchMode,
    ) {
        let block = pool.block(block_no);
        let page = block.page();
        debug_assert_eq!(page.index_id(), self.index.id());

        let mut low = (0u16, 0u16);
        let mut low_rec = INFIMUM_OFFSET;
        let mut up = (0u16, 0u16);
        let mut up_rec = SUPREMUM_OFFSET;

        let mut rec = page.next_rec(INFIMUM_OFFSET).unwrap_or(SUPREMUM_OFFSET);
        while rec != SUPREMUM_OFFSET {
            if page.rec_is_metadata(rec) {
                rec = page.next_rec(rec).unwrap_or(SUPREMUM_OFFSET);
                continue;
            }
            let (ord, mf, mb) = cmp_tuple_rec(tuple, &page, &self.index, rec);
            let stop = match mode {
                SearchMode::Ge => ord != CmpOrdering::Greater,
                SearchMode::Le => ord == CmpOrdering::Less,
            };
            if stop {
                up = (mf, mb);
                up_rec = rec;
                break;
            }
            low = (mf, mb);
            low_rec = rec;
            rec = page.next_rec(rec).unwrap_or(SUPREMUM_OFFSET);
        }

        self.low_match = low.0;
        self.low_bytes = low.1;
        self.up_match = up.0;
        self.up_bytes = up.1;
        self.block_no = Some(block_no);
        self.rec = match mode {
            SearchMode::Ge => up_rec,
            SearchMode::Le => low_rec,
        };
        if self.flag != CursorFlag::HashFail {
            self.flag = CursorFlag::Binary;
        }
    }

    /// Validates a guessed position: the record must satisfy `mode`
    /// relative to `tuple`, and so must its neighbor on the other side.
    /// Refreshes the cursor's match state on success. Returns true on
    /// mismatch.
    pub fn check_mismatch(&mut self, pool: &BufferPool, tuple: &Tuple, mode: SearchMode) -> bool {
        let Some(block_no) = self.block_no else {
            return true;
        };
        let page = pool.block(block_no).page();
        let rec = self.rec;
        if !page.is_user_rec(rec) || page.rec_is_metadata(rec) {
            return true;
        }
        let (ord, mf, mb) = cmp_tuple_rec(tuple, &page, &self.index, rec);

        match mode {
            SearchMode::Ge => {
                if ord == CmpOrdering::Greater {
                    return true;
                }
                self.up_match = mf;
                self.up_bytes = mb;
                let prev = page.prev_rec(rec);
                if page.is_user_rec(prev) && !page.rec_is_metadata(prev) {
                    let (pord, pmf, pmb) = cmp_tuple_rec(tuple, &page, &self.index, prev);
                    if pord != CmpOrdering::Greater {
                        return true;
                    }
                    self.low_match = pmf;
                    self.low_bytes = pmb;
                } else {
                    self.low_match = 0;
                    self.low_bytes = 0;
                }
            }
            SearchMode::Le => {
                if ord == CmpOrdering::Less {
                    return true;
                }
                self.low_match = mf;
                self.low_bytes = mb;
                match page.next_rec(rec) {
                    Some(SUPREMUM_OFFSET) => {
                        self.up_match = 0;
                        self.up_bytes = 0;
                    }
                    Some(next) => {
                        let (nord, nmf, nmb) = cmp_tuple_rec(tuple, &page, &self.index, next);
                        if nord != CmpOrdering::Less {
                            return true;
                        }
                        self.up_match = nmf;
                        self.up_bytes = nmb;
                    }
                    None => return true,
                }
            }
        }
        false
    }
}

/// Compares a tuple against a stored record, field by field. NULL sorts
/// before every value. Returns the ordering plus the number of complete
/// fields and extra bytes that matched before the first difference.
fn cmp_tuple_rec(
    tuple: &Tuple,
    page: &PageView<'_>,
    index: &IndexDef,
    rec: usize,
) -> (CmpOrdering, u16, u16) {
    let n = tuple.n_fields().min(index.n_core_fields());
    for i in 0..n {
        let t = tuple.field(i);
        let r = page.rec_field(index, rec, i);
        match (t, r) {
            (None, None) => continue,
            (None, Some(_)) => return (CmpOrdering::Less, i as u16, 0),
            (Some(_), None) => return (CmpOrdering::Greater, i as u16, 0),
            (Some(a), Some(b)) => {
                let common = a.len().min(b.len());
                for j in 0..common {
                    match a[j].cmp(&b[j]) {
                        CmpOrdering::Equal => {}
                        ord => return (ord, i as u16, j as u16),
                    }
                }
                match a.len().cmp(&b.len()) {
                    CmpOrdering::Equal => {}
                    ord => return (ord, i as u16, common as u16),
                }
            }
        }
    }
    (CmpOrdering::Equal, n as u16, 0)
}

/// Page latch handed from the fast path to the caller.
pub enum PageGuard<'a> {
    S(RwLockReadGuard<'a, ()>),
    X(RwLockWriteGuard<'a, ()>),
}

/// Mini-transaction: pinned, latched pages released together on drop.
pub struct Mtr<'a> {
    pool: &'a BufferPool,
    pages: Vec<(u32, PageGuard<'a>)>,
}

impl<'a> Mtr<'a> {
    pub fn new(pool: &'a BufferPool) -> Self {
        Mtr { pool, pages: Vec::new() }
    }

    #[inline]
    pub(crate) fn pool(&self) -> &'a BufferPool {
        self.pool
    }

    /// Records a page whose latch and pin this mini-transaction now owns.
    pub(crate) fn memo_push(&mut self, block_no: u32, guard: PageGuard<'a>) {
        self.pages.push((block_no, guard));
    }

    /// Unpins and unlatches the most recently attached page.
    pub fn release_last_page(&mut self) {
        if let Some((block_no, guard)) = self.pages.pop() {
            self.pool.block(block_no).unfix();
            drop(guard);
        }
    }

    #[inline]
    pub fn n_pages(&self) -> usize {
        self.pages.len()
    }

    /// Releases everything. Dropping the mini-transaction does the same.
    pub fn commit(self) {}
}

impl Drop for Mtr<'_> {
    fn drop(&mut self) {
        for (block_no, guard) in self.pages.drain(..) {
            self.pool.block(block_no).unfix();
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::{FieldDef, IndexId};
    use crate::pool::PageId;
    use crate::records::RecordFormat;

    fn setup() -> (Arc<BufferPool>, Arc<IndexDef>, u32) {
        let pool = Arc::new(BufferPool::new(4).unwrap());
        let index = IndexDef::new(
            IndexId(1),
            RecordFormat::Compact,
            vec![FieldDef::variable().big()],
            1,
        )
        .unwrap();
        let block_no = pool
            .create_page(PageId::new(0, 1), index.id(), index.format())
            .unwrap();
        let block = pool.block(block_no);
        let mut latch = block.x_latch();
        block.with_page_mut(&mut latch, |mut page| {
            let mut prev = INFIMUM_OFFSET;
            for v in [&b"ant"[..], b"bee", b"cat"] {
                prev = page
                    .insert_after(&index, prev, &Tuple::from_values([v]))
                    .unwrap();
            }
        });
        drop(latch);
        (pool, index, block_no)
    }

    #[test]
    fn test_search_ge_positions_on_match() {
        let (pool, index, block_no) = setup();
        let mut cursor = Cursor::new(index.clone());
        let _s = pool.block(block_no).s_latch();
        cursor.search_leaf(&pool, block_no, &Tuple::from_values([&b"bee"[..]]), SearchMode::Ge);

        let page = pool.block(block_no).page();
        assert_eq!(page.rec_field(&index, cursor.rec_off(), 0), Some(&b"bee"[..]));
        assert_eq!(cursor.up_match, 1);
        assert_eq!(cursor.low_match, 0);
    }

    #[test]
    fn test_search_le_positions_before_gap() {
        let (pool, index, block_no) = setup();
        let mut cursor = Cursor::new(index.clone());
        let _s = pool.block(block_no).s_latch();
        cursor.search_leaf(&pool, block_no, &Tuple::from_values([&b"boa"[..]]), SearchMode::Le);

        let page = pool.block(block_no).page();
        // "boa" lands between "bee" and "cat"; LE stops on "bee".
        assert_eq!(page.rec_field(&index, cursor.rec_off(), 0), Some(&b"bee"[..]));
        assert_eq!(cursor.low_match, 0);
        assert_eq!(cursor.low_bytes, 1);
        assert_eq!(cursor.up_match, 0);
        assert_eq!(cursor.up_bytes, 0);
    }

    #[test]
    fn test_search_below_first_lands_on_infimum_side() {
        let (pool, index, block_no) = setup();
        let mut cursor = Cursor::new(index.clone());
        let _s = pool.block(block_no).s_latch();
        cursor.search_leaf(&pool, block_no, &Tuple::from_values([&b"aaa"[..]]), SearchMode::Le);
        assert_eq!(cursor.rec_off(), INFIMUM_OFFSET);
    }

    #[test]
    fn test_check_mismatch_ge() {
        let (pool, index, block_no) = setup();
        let mut cursor = Cursor::new(index.clone());
        {
            let _s = pool.block(block_no).s_latch();
            cursor.search_leaf(
                &pool,
                block_no,
                &Tuple::from_values([&b"bee"[..]]),
                SearchMode::Ge,
            );
        }

        // Correct guess: positioned on "bee" for GE "bee".
        assert!(!cursor.check_mismatch(&pool, &Tuple::from_values([&b"bee"[..]]), SearchMode::Ge));
        // Same position is wrong for GE "cat": "bee" < "cat".
        assert!(cursor.check_mismatch(&pool, &Tuple::from_values([&b"cat"[..]]), SearchMode::Ge));
        // And wrong for GE "abc": the predecessor "ant" is not < "abc"...
        // actually "ant" > "abc", so "bee" is not the first record >= "abc".
        assert!(cursor.check_mismatch(&pool, &Tuple::from_values([&b"abc"[..]]), SearchMode::Ge));
    }

    #[test]
    fn test_check_mismatch_le() {
        let (pool, index, block_no) = setup();
        let mut cursor = Cursor::new(index.clone());
        {
            let _s = pool.block(block_no).s_latch();
            cursor.search_leaf(
                &pool,
                block_no,
                &Tuple::from_values([&b"bee"[..]]),
                SearchMode::Le,
            );
        }

        assert!(!cursor.check_mismatch(&pool, &Tuple::from_values([&b"bee"[..]]), SearchMode::Le));
        // "bee" is not <= "bar".
        assert!(cursor.check_mismatch(&pool, &Tuple::from_values([&b"bar"[..]]), SearchMode::Le));
        // For "cat" the successor "cat" is not > "cat", so "bee" is not
        // the last record <= "cat".
        assert!(cursor.check_mismatch(&pool, &Tuple::from_values([&b"cat"[..]]), SearchMode::Le));
    }

    #[test]
    fn test_mtr_releases_pins() {
        let (pool, _index, block_no) = setup();
        let block = pool.block(block_no);
        {
            let mut mtr = Mtr::new(&pool);
            let guard = PageGuard::S(block.s_latch());
            block.fix();
            mtr.memo_push(block_no, guard);
            assert_eq!(block.fix_count(), 1);
        }
        assert_eq!(block.fix_count(), 0);
    }
}
