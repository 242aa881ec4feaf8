//! # Record Formats and Logical Tuples
//!
//! Rows live on leaf pages in one of two physical formats:
//!
//! - **Compact**: a null bitmap plus reversed variable-length headers
//!   precede the record origin; NULL columns occupy zero data bytes.
//! - **Redundant**: a reversed array of cumulative end offsets precedes the
//!   origin; NULL fixed-width columns occupy a zero filler of their full
//!   width, NULL variable columns occupy nothing.
//!
//! The format is a closed two-variant set, so format-sensitive inner loops
//! (fingerprinting, prefix walks) are monomorphized over a `const COMP:
//! bool` instead of branching per field.
//!
//! A [`Tuple`] is the logical side of the same row: a short vector of
//! optional byte values, `None` meaning SQL NULL. Fingerprint equivalence
//! between a tuple and a stored record - same bytes in, same fold out - is
//! the correctness hinge of the whole hash index.

use smallvec::SmallVec;

/// Physical row format of a page and of the index that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    /// Null bitmap + reversed var-length headers; NULLs store no bytes.
    Compact,
    /// Reversed end-offset array; fixed NULLs store a full-width filler.
    Redundant,
}

impl RecordFormat {
    #[inline]
    pub fn is_compact(self) -> bool {
        matches!(self, RecordFormat::Compact)
    }
}

/// Encoded prefix description: how much of a record participates in the
/// fingerprint, packed into a `u32`.
///
/// - bits 0..16: number of complete fields
/// - bits 16..31: number of bytes of the following field
/// - bit 31: `LEFT_SIDE` - which of two equal-fingerprint neighbors on a
///   page owns the hash entry (the earlier one when set)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixParams(u32);

impl PrefixParams {
    /// Side flag: the earlier of two equal-fingerprint records wins.
    pub const LEFT_SIDE: u32 = 1 << 31;

    #[inline]
    pub fn new(n_fields: u16, n_bytes: u16, left_side: bool) -> Self {
        debug_assert!(n_bytes < 1 << 15, "byte count must fit in 15 bits");
        let mut raw = u32::from(n_fields) | (u32::from(n_bytes) << 16);
        if left_side {
            raw |= Self::LEFT_SIDE;
        }
        PrefixParams(raw)
    }

    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        PrefixParams(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Number of complete fields in the prefix.
    #[inline]
    pub fn n_fields(self) -> u16 {
        self.0 as u16
    }

    /// Number of leading bytes of the field after the complete ones.
    #[inline]
    pub fn n_bytes(self) -> u16 {
        ((self.0 >> 16) & 0x7fff) as u16
    }

    #[inline]
    pub fn left_side(self) -> bool {
        self.0 & Self::LEFT_SIDE != 0
    }

    /// The same prefix with the side flag cleared; this is what cursors
    /// carry and what fingerprints are computed from.
    #[inline]
    pub fn without_side(self) -> Self {
        PrefixParams(self.0 & !Self::LEFT_SIDE)
    }

    /// Number of complete or incomplete fields the prefix touches.
    #[inline]
    pub fn n_probe_fields(self) -> usize {
        self.n_fields() as usize + usize::from(self.n_bytes() > 0)
    }

    /// Whether the prefix selects nothing at all (no hash can be built).
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 & !Self::LEFT_SIDE == 0
    }
}

/// One logical field value; `None` is SQL NULL.
pub type TupleField = Option<Vec<u8>>;

/// A logical row: field values in index order, `None` for SQL NULL.
#[derive(Debug, Clone, Default)]
pub struct Tuple {
    fields: SmallVec<[TupleField; 8]>,
    metadata: bool,
}

impl Tuple {
    pub fn new<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = Option<V>>,
        V: Into<Vec<u8>>,
    {
        Tuple {
            fields: values.into_iter().map(|v| v.map(Into::into)).collect(),
            metadata: false,
        }
    }

    /// Convenience constructor for all-non-NULL tuples.
    pub fn from_values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        Tuple {
            fields: values.into_iter().map(|v| Some(v.into())).collect(),
            metadata: false,
        }
    }

    /// Marks this tuple as an instant-ALTER metadata record. Metadata
    /// records are never fingerprinted and never satisfy the fast path.
    pub fn with_metadata(mut self) -> Self {
        self.metadata = true;
        self
    }

    #[inline]
    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    /// Field value, `None` meaning SQL NULL.
    ///
    /// # Panics
    /// Panics if `i` is out of bounds; callers check `n_fields` first.
    #[inline]
    pub fn field(&self, i: usize) -> Option<&[u8]> {
        self.fields[i].as_deref()
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_params_packing() {
        let p = PrefixParams::new(3, 7, true);
        assert_eq!(p.n_fields(), 3);
        assert_eq!(p.n_bytes(), 7);
        assert!(p.left_side());
        assert_eq!(p.n_probe_fields(), 4);

        let stripped = p.without_side();
        assert!(!stripped.left_side());
        assert_eq!(stripped.n_fields(), 3);
        assert_eq!(stripped.n_bytes(), 7);
        assert_eq!(stripped.raw(), p.raw() & !PrefixParams::LEFT_SIDE);
    }

    #[test]
    fn test_prefix_params_empty() {
        assert!(PrefixParams::from_raw(PrefixParams::LEFT_SIDE).is_empty());
        assert!(!PrefixParams::new(1, 0, false).is_empty());
        assert!(!PrefixParams::new(0, 1, true).is_empty());
        assert_eq!(PrefixParams::new(0, 1, true).n_probe_fields(), 1);
    }

    #[test]
    fn test_tuple_nulls() {
        let t = Tuple::new([Some(b"abc".to_vec()), None, Some(b"".to_vec())]);
        assert_eq!(t.n_fields(), 3);
        assert_eq!(t.field(0), Some(&b"abc"[..]));
        assert_eq!(t.field(1), None);
        assert_eq!(t.field(2), Some(&b""[..]));
        assert!(!t.is_metadata());
        assert!(t.clone().with_metadata().is_metadata());
    }
}
