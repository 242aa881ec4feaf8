//! # Dictionary: Index Descriptors and Search Statistics
//!
//! The dictionary owns the index descriptors the hash index works against.
//! Each [`IndexDef`] carries:
//!
//! - the physical shape of its records (field widths, nullability, row
//!   format), which drives fingerprinting;
//! - a [`SearchInfo`] block of *deliberately unsynchronized* statistics.
//!   These fields are relaxed atomics mutated without latches; racing
//!   updates may clobber each other and can only delay convergence of the
//!   heuristic, never corrupt the index.
//!
//! ## Lazy free
//!
//! A dropped index whose pages are still hashed cannot be destroyed yet:
//! hash nodes hold fingerprints computed against its field layout. Dropping
//! moves the descriptor to a freed list and marks it; `ref_count` tracks
//! the number of buffered pages still hashed for it. When the last such
//! page is un-hashed, the hash index calls [`Dict::lazy_free`] and the
//! descriptor finally goes away.
//!
//! The freed list is a leaf mutex *outside* the dictionary lock: lazy free
//! runs while a hash partition latch is held, and taking the dictionary
//! lock there would invert the `dictionary > partition` lock order that
//! `disable()` relies on.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::{HASH_ANALYSIS_THRESHOLD, MAX_FIXED_FIELD_LEN, POTENTIAL_CLAMP};
use crate::records::{PrefixParams, RecordFormat};

/// Identifier of an index; also selects its hash partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId(pub u64);

/// Physical description of one indexed column.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    /// Stored width in bytes; 0 means variable length.
    pub fixed_len: u16,
    /// Whether the column may be SQL NULL.
    pub nullable: bool,
    /// Whether a variable column may exceed 127 bytes (two-byte length
    /// header in the compact format).
    pub big: bool,
}

impl FieldDef {
    pub fn fixed(len: u16) -> Self {
        FieldDef { fixed_len: len, nullable: false, big: false }
    }

    pub fn variable() -> Self {
        FieldDef { fixed_len: 0, nullable: false, big: false }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn big(mut self) -> Self {
        self.big = true;
        self
    }
}

/// Per-index search statistics driving the adaptive heuristic.
///
/// Every field is a relaxed atomic and none is protected by any latch; the
/// values bias scheduling decisions only and never gate a safety-critical
/// branch.
#[derive(Debug, Default)]
pub struct SearchInfo {
    /// Recommended prefix, packed with the side flag.
    left_bytes_fields: AtomicU32,
    /// Streak of consecutive potentially successful hash searches.
    n_hash_potential: AtomicU8,
    /// Whether the latest search with the recommended prefix could have
    /// used the hash index.
    last_hash_succ: AtomicBool,
    /// Positionings since the recommendation last changed; analysis is
    /// skipped until this clears [`HASH_ANALYSIS_THRESHOLD`].
    hash_analysis: AtomicU16,
    /// Number of buffered pages currently hashed for this index.
    ref_count: AtomicU32,
}

impl SearchInfo {
    #[inline]
    pub fn left_bytes_fields(&self) -> PrefixParams {
        PrefixParams::from_raw(self.left_bytes_fields.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn left_raw(&self) -> u32 {
        self.left_bytes_fields.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_left_bytes_fields(&self, params: PrefixParams) {
        self.left_bytes_fields.store(params.raw(), Ordering::Relaxed);
    }

    #[inline]
    pub fn n_hash_potential(&self) -> u8 {
        self.n_hash_potential.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_n_hash_potential(&self, v: u8) {
        self.n_hash_potential.store(v, Ordering::Relaxed);
    }

    /// Bumps the success streak, clamped so a long streak decays quickly
    /// after the workload shifts.
    #[inline]
    pub fn bump_potential(&self) {
        let v = self.n_hash_potential.load(Ordering::Relaxed);
        if v < POTENTIAL_CLAMP {
            self.n_hash_potential.store(v + 1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn last_hash_succ(&self) -> bool {
        self.last_hash_succ.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_last_hash_succ(&self, v: bool) {
        self.last_hash_succ.store(v, Ordering::Relaxed);
    }

    /// Counts one positioning and reports whether analysis should run.
    /// Racy by design; a lost increment merely delays the heuristic.
    #[inline]
    pub fn hash_analysis_useful(&self) -> bool {
        let v = self.hash_analysis.load(Ordering::Relaxed);
        if v <= HASH_ANALYSIS_THRESHOLD {
            self.hash_analysis.store(v + 1, Ordering::Relaxed);
        }
        v >= HASH_ANALYSIS_THRESHOLD
    }

    #[inline]
    pub fn hash_analysis_reset(&self) {
        self.hash_analysis.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_ref_count(&self, v: u32) {
        self.ref_count.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn ref_count_inc(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the previous value; 0 means underflow, which the callers
    /// treat as a fatal accounting bug in debug builds.
    #[inline]
    pub fn ref_count_dec(&self) -> u32 {
        let prev = self.ref_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "index hash reference count underflow");
        prev
    }
}

/// Descriptor of one B-tree index.
#[derive(Debug)]
pub struct IndexDef {
    id: IndexId,
    format: RecordFormat,
    fields: Vec<FieldDef>,
    n_uniq: u16,
    ibuf: bool,
    freed: AtomicBool,
    search_info: SearchInfo,
}

impl IndexDef {
    pub fn new(
        id: IndexId,
        format: RecordFormat,
        fields: Vec<FieldDef>,
        n_uniq: u16,
    ) -> Result<Arc<Self>> {
        ensure!(!fields.is_empty(), "an index needs at least one field");
        ensure!(
            (1..=fields.len() as u16).contains(&n_uniq),
            "n_uniq {} out of range for {} fields",
            n_uniq,
            fields.len()
        );
        for (i, f) in fields.iter().enumerate() {
            ensure!(
                (f.fixed_len as usize) <= MAX_FIXED_FIELD_LEN,
                "field {} fixed width {} exceeds the supported maximum",
                i,
                f.fixed_len
            );
        }
        Ok(Arc::new(IndexDef {
            id,
            format,
            fields,
            n_uniq,
            ibuf: false,
            freed: AtomicBool::new(false),
            search_info: SearchInfo::default(),
        }))
    }

    #[inline]
    pub fn id(&self) -> IndexId {
        self.id
    }

    #[inline]
    pub fn format(&self) -> RecordFormat {
        self.format
    }

    #[inline]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    #[inline]
    pub fn field(&self, i: usize) -> &FieldDef {
        &self.fields[i]
    }

    #[inline]
    pub fn n_core_fields(&self) -> usize {
        self.fields.len()
    }

    /// Bytes of null bitmap a compact record of this index carries.
    #[inline]
    pub fn n_core_null_bytes(&self) -> usize {
        let nullable = self.fields.iter().filter(|f| f.nullable).count();
        nullable.div_ceil(8)
    }

    /// Number of fields that uniquely determine a record in the tree.
    #[inline]
    pub fn n_uniq_in_tree(&self) -> u16 {
        self.n_uniq
    }

    /// Width of the NULL filler a redundant-format record stores for a
    /// NULL value of this field.
    #[inline]
    pub fn sql_null_size(&self, i: usize) -> usize {
        self.fields[i].fixed_len as usize
    }

    /// Whether this is a change-buffer index; those see too many deletes
    /// for the heuristic to be worth running.
    #[inline]
    pub fn is_ibuf(&self) -> bool {
        self.ibuf
    }

    #[inline]
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    fn mark_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn search_info(&self) -> &SearchInfo {
        &self.search_info
    }
}

/// The index catalog, plus the freed-but-still-referenced descriptor list.
#[derive(Debug, Default)]
pub struct Dict {
    indexes: RwLock<HashMap<IndexId, Arc<IndexDef>>>,
    freed: Mutex<Vec<Arc<IndexDef>>>,
}

/// Holding this prevents indexes from being registered or dropped.
pub struct DictFreeze<'a> {
    guard: RwLockReadGuard<'a, HashMap<IndexId, Arc<IndexDef>>>,
}

impl Dict {
    pub fn new() -> Self {
        Dict::default()
    }

    pub fn register(&self, index: Arc<IndexDef>) {
        self.indexes.write().insert(index.id(), index);
    }

    pub fn get(&self, id: IndexId) -> Option<Arc<IndexDef>> {
        self.indexes.read().get(&id).cloned()
    }

    /// Drops an index from the catalog. If hashed pages still reference
    /// it, the descriptor is parked on the freed list until the hash index
    /// releases the last page.
    pub fn drop_index(&self, id: IndexId) {
        let Some(index) = self.indexes.write().remove(&id) else {
            return;
        };
        index.mark_freed();
        if index.search_info().ref_count() > 0 {
            self.freed.lock().push(index);
        }
    }

    /// Destroys a freed descriptor whose last hashed page was just
    /// dropped. Takes only the freed-list mutex; safe to call under a
    /// partition latch.
    pub fn lazy_free(&self, index: &Arc<IndexDef>) {
        debug_assert!(index.is_freed());
        self.freed.lock().retain(|i| !Arc::ptr_eq(i, index));
    }

    /// Blocks catalog changes for the lifetime of the returned guard.
    pub fn freeze(&self) -> DictFreeze<'_> {
        DictFreeze { guard: self.indexes.read() }
    }

    /// Visits every live descriptor, registered or freed, through an
    /// already-held freeze (the freeze's own read guard is reused, so
    /// this never re-locks the catalog).
    pub fn for_each_index_frozen(
        &self,
        freeze: &DictFreeze<'_>,
        mut f: impl FnMut(&Arc<IndexDef>),
    ) {
        for index in freeze.guard.values() {
            f(index);
        }
        for index in self.freed.lock().iter() {
            f(index);
        }
    }

    /// Number of descriptors parked on the freed list.
    pub fn n_freed(&self) -> usize {
        self.freed.lock().len()
    }
}
