//! # Leaf Pages
//!
//! A leaf page is one 16 KiB buffer-pool frame laid out as:
//!
//! ```text
//! +---------------------------+ 0
//! | PageHeader (16B)          |  index id, record count, heap top, flags
//! +---------------------------+ 16
//! | infimum pseudo-record     |  lower page boundary, never a match
//! +---------------------------+
//! | supremum pseudo-record    |  upper page boundary, never a match
//! +---------------------------+ 38 (HEAP_START)
//! | record heap               |  records appended upward, each preceded
//! | ...                       |  by its format-specific header bytes
//! +---------------------------+ heap_top
//! | free space                |
//! +---------------------------+ PAGE_SIZE
//! ```
//!
//! Records form a singly linked list in key order: infimum -> user records
//! -> supremum. Each record's origin points at the start of its field data;
//! the bytes *below* the origin hold a 3-byte fixed header (info byte +
//! next-record pointer) plus the format-specific column headers described
//! in [`crate::records`]. Deleting a record only unlinks it; heap space is
//! reclaimed when the page is rebuilt, which is out of scope here.
//!
//! All access is zero-copy: [`PageView`] borrows the frame immutably and
//! returns `&[u8]` slices into it, [`PageMut`] mutates in place. Thread
//! safety is the buffer pool's job (page latches); these types assume the
//! caller holds the appropriate latch.

mod rec;

use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::PAGE_SIZE;
use crate::dict::{IndexDef, IndexId};
use crate::records::{PrefixParams, RecordFormat, Tuple};

pub use rec::REC_EXTRA_SIZE;

/// Bytes of page header at offset 0.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Record origin of the infimum pseudo-record.
pub const INFIMUM_OFFSET: usize = PAGE_HEADER_SIZE + REC_EXTRA_SIZE;

/// Record origin of the supremum pseudo-record.
pub const SUPREMUM_OFFSET: usize = INFIMUM_OFFSET + 8 + REC_EXTRA_SIZE;

/// First byte available to the record heap.
pub const HEAP_START: usize = SUPREMUM_OFFSET + 8;

/// Page flag bit: records use the compact format.
const PAGE_FLAG_COMPACT: u8 = 0x01;

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct PageHeader {
    index_id: U64,
    n_recs: U16,
    heap_top: U16,
    flags: u8,
    _reserved: [u8; 3],
}

const _: () = assert!(core::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    #[inline]
    fn index_id(&self) -> u64 {
        self.index_id.get()
    }

    #[inline]
    fn set_index_id(&mut self, val: u64) {
        self.index_id = U64::new(val);
    }

    #[inline]
    fn n_recs(&self) -> u16 {
        self.n_recs.get()
    }

    #[inline]
    fn set_n_recs(&mut self, val: u16) {
        self.n_recs = U16::new(val);
    }

    #[inline]
    fn heap_top(&self) -> u16 {
        self.heap_top.get()
    }

    #[inline]
    fn set_heap_top(&mut self, val: u16) {
        self.heap_top = U16::new(val);
    }
}

/// Immutable zero-copy view of a leaf page.
#[derive(Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
}

impl<'a> PageView<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        PageView { data }
    }

    #[inline]
    fn header(&self) -> &PageHeader {
        // INVARIANT: the header prefix is always present and U16/U64 are
        // unaligned types, so the cast cannot fail.
        PageHeader::ref_from_bytes(&self.data[..PAGE_HEADER_SIZE])
            .expect("page header cast")
    }

    #[inline]
    pub fn index_id(&self) -> IndexId {
        IndexId(self.header().index_id())
    }

    #[inline]
    pub fn n_recs(&self) -> u16 {
        self.header().n_recs()
    }

    #[inline]
    pub fn heap_top(&self) -> usize {
        self.header().heap_top() as usize
    }

    #[inline]
    pub fn is_compact(&self) -> bool {
        self.header().flags & PAGE_FLAG_COMPACT != 0
    }

    #[inline]
    pub fn format(&self) -> RecordFormat {
        if self.is_compact() {
            RecordFormat::Compact
        } else {
            RecordFormat::Redundant
        }
    }

    /// Next record in key order; `None` past the supremum.
    #[inline]
    pub fn next_rec(&self, origin: usize) -> Option<usize> {
        match rec::next(self.data, origin) {
            0 => None,
            n => Some(n as usize),
        }
    }

    /// Record preceding `origin`, found by walking from the infimum.
    pub fn prev_rec(&self, origin: usize) -> usize {
        let mut cur = INFIMUM_OFFSET;
        while let Some(next) = self.next_rec(cur) {
            if next == origin {
                return cur;
            }
            cur = next;
        }
        debug_assert!(false, "record {origin} not linked on page");
        INFIMUM_OFFSET
    }

    /// First user record, skipping a leading metadata record; `None` on an
    /// empty page.
    pub fn first_user_rec(&self) -> Option<usize> {
        let mut rec = self.next_rec(INFIMUM_OFFSET)?;
        if rec != SUPREMUM_OFFSET && self.rec_is_metadata(rec) {
            rec = self.next_rec(rec)?;
        }
        (rec != SUPREMUM_OFFSET).then_some(rec)
    }

    #[inline]
    pub fn is_infimum(&self, origin: usize) -> bool {
        origin == INFIMUM_OFFSET
    }

    #[inline]
    pub fn is_supremum(&self, origin: usize) -> bool {
        origin == SUPREMUM_OFFSET
    }

    #[inline]
    pub fn is_user_rec(&self, origin: usize) -> bool {
        origin >= HEAP_START && origin < PAGE_SIZE
    }

    #[inline]
    pub fn rec_is_metadata(&self, origin: usize) -> bool {
        rec::info(self.data, origin) & rec::REC_INFO_METADATA != 0
    }

    /// Field value of a user record, `None` meaning SQL NULL.
    pub fn rec_field(&self, index: &IndexDef, origin: usize, i: usize) -> Option<&'a [u8]> {
        debug_assert!(self.is_user_rec(origin));
        let bounds = if self.is_compact() {
            rec::field_compact(self.data, index, origin, i)
        } else {
            rec::field_redundant(self.data, index, origin, i)
        };
        bounds.map(|(start, len)| &self.data[start..start + len])
    }

    /// Number of leading record bytes covered by the given prefix.
    pub fn rec_prefix_len(&self, index: &IndexDef, origin: usize, probe: PrefixParams) -> usize {
        if self.is_compact() {
            rec::prefix_len::<true>(self.data, index, origin, probe)
        } else {
            rec::prefix_len::<false>(self.data, index, origin, probe)
        }
    }

    /// Raw bytes of a record prefix, for fingerprinting.
    #[inline]
    pub fn rec_bytes(&self, origin: usize, len: usize) -> &'a [u8] {
        &self.data[origin..origin + len]
    }
}

/// Mutable view of a leaf page.
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    #[inline]
    pub fn new(data: &'a mut [u8]) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        PageMut { data }
    }

    #[inline]
    pub fn view(&self) -> PageView<'_> {
        PageView::new(self.data)
    }

    #[inline]
    fn header_mut(&mut self) -> &mut PageHeader {
        // INVARIANT: see PageView::header.
        PageHeader::mut_from_bytes(&mut self.data[..PAGE_HEADER_SIZE])
            .expect("page header cast")
    }

    /// Formats an empty leaf page in place.
    pub fn init(&mut self, index_id: IndexId, format: RecordFormat) {
        self.data[..HEAP_START].fill(0);
        let hdr = self.header_mut();
        hdr.set_index_id(index_id.0);
        hdr.set_n_recs(0);
        hdr.set_heap_top(HEAP_START as u16);
        hdr.flags = if format.is_compact() { PAGE_FLAG_COMPACT } else { 0 };

        rec::set_info(self.data, INFIMUM_OFFSET, 0);
        rec::set_next(self.data, INFIMUM_OFFSET, SUPREMUM_OFFSET as u16);
        self.data[INFIMUM_OFFSET..INFIMUM_OFFSET + 8].copy_from_slice(b"infimum\0");

        rec::set_info(self.data, SUPREMUM_OFFSET, 0);
        rec::set_next(self.data, SUPREMUM_OFFSET, 0);
        self.data[SUPREMUM_OFFSET..SUPREMUM_OFFSET + 8].copy_from_slice(b"supremum");
    }

    /// Encodes `tuple` onto the heap and links it after `prev`. Returns
    /// the new record's origin.
    pub fn insert_after(
        &mut self,
        index: &IndexDef,
        prev: usize,
        tuple: &Tuple,
    ) -> eyre::Result<usize> {
        self.insert_after_with_info(index, prev, tuple, 0)
    }

    /// As [`Self::insert_after`], marking the record as instant-ALTER
    /// metadata.
    pub fn insert_metadata(
        &mut self,
        index: &IndexDef,
        prev: usize,
        tuple: &Tuple,
    ) -> eyre::Result<usize> {
        self.insert_after_with_info(index, prev, tuple, rec::REC_INFO_METADATA)
    }

    fn insert_after_with_info(
        &mut self,
        index: &IndexDef,
        prev: usize,
        tuple: &Tuple,
        info: u8,
    ) -> eyre::Result<usize> {
        eyre::ensure!(
            prev != SUPREMUM_OFFSET,
            "cannot insert after the supremum"
        );
        let heap_top = self.view().heap_top();
        let compact = self.view().is_compact();
        let (origin, new_top) = if compact {
            rec::encode_compact(self.data, heap_top, index, tuple, info)?
        } else {
            rec::encode_redundant(self.data, heap_top, index, tuple, info)?
        };

        let old_next = rec::next(self.data, prev);
        rec::set_next(self.data, prev, origin as u16);
        rec::set_next(self.data, origin, old_next);

        let n = self.view().n_recs() + 1;
        let hdr = self.header_mut();
        hdr.set_n_recs(n);
        hdr.set_heap_top(new_top as u16);
        Ok(origin)
    }

    /// Unlinks a user record from the chain. The heap bytes stay behind
    /// until the page is rebuilt.
    pub fn delete_rec(&mut self, origin: usize) {
        debug_assert!(self.view().is_user_rec(origin));
        let prev = self.view().prev_rec(origin);
        let next = rec::next(self.data, origin);
        rec::set_next(self.data, prev, next);
        let n = self.view().n_recs().saturating_sub(1);
        self.header_mut().set_n_recs(n);
    }
}
