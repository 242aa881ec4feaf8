//! # Record Fingerprints
//!
//! A fingerprint ("fold") is the CRC-32C of the owning index id followed by
//! an encoded record prefix: the first `n_fields` complete field values
//! plus the first `n_bytes` bytes of the next field, in physical on-page
//! layout.
//!
//! Two routines produce folds:
//!
//! - [`rec_fold`] hashes a record in place on a leaf page. The prefix is
//!   one contiguous byte range, located by the format-specific header walk.
//! - [`tuple_fold`] hashes a logical tuple field by field, synthesizing
//!   exactly the bytes the record codec would have stored: compact NULLs
//!   contribute nothing, redundant NULLs contribute a zero filler of the
//!   column's SQL-NULL width.
//!
//! Both feed one streaming digest, so `rec_fold(r) == tuple_fold(t)`
//! whenever the stored prefix of `r` byte-matches the encoded prefix of
//! `t`. Everything the hash index promises rests on that equivalence;
//! collisions are tolerated because every fast-path hit is re-validated
//! against the live page.

use crc::{Crc, CRC_32_ISCSI};

use crate::config::MAX_FIXED_FIELD_LEN;
use crate::dict::IndexDef;
use crate::page::PageView;
use crate::records::PrefixParams;

/// CRC-32C (Castagnoli), the iSCSI polynomial.
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Zero filler standing in for NULL values in redundant-format folds.
static NULL_FILLER: [u8; MAX_FIXED_FIELD_LEN] = [0; MAX_FIXED_FIELD_LEN];

/// Fold of a user record on a leaf page.
///
/// `COMP` selects the record format at compile time; use [`rec_fold_dyn`]
/// when the format is only known from the page.
pub fn rec_fold<const COMP: bool>(
    page: &PageView<'_>,
    origin: usize,
    index: &IndexDef,
    probe: PrefixParams,
) -> u32 {
    debug_assert!(page.is_user_rec(origin));
    debug_assert!(!page.rec_is_metadata(origin));
    debug_assert_eq!(COMP, page.is_compact());
    debug_assert!(!probe.left_side(), "fold probes carry no side flag");

    let n = page.rec_prefix_len(index, origin, probe);
    let mut digest = CRC32C.digest();
    digest.update(&index.id().0.to_le_bytes());
    digest.update(page.rec_bytes(origin, n));
    digest.finalize()
}

/// Fold of a user record, dispatching on the page's format flag.
pub fn rec_fold_dyn(
    page: &PageView<'_>,
    origin: usize,
    index: &IndexDef,
    probe: PrefixParams,
) -> u32 {
    if page.is_compact() {
        rec_fold::<true>(page, origin, index, probe)
    } else {
        rec_fold::<false>(page, origin, index, probe)
    }
}

/// Fold of a logical tuple under the same prefix.
pub fn tuple_fold(tuple: &crate::records::Tuple, index: &IndexDef, probe: PrefixParams) -> u32 {
    debug_assert!(!probe.left_side(), "fold probes carry no side flag");
    debug_assert!(tuple.n_fields() >= probe.n_probe_fields());

    let comp = index.format().is_compact();
    let n_fields = probe.n_fields() as usize;
    let n_bytes = probe.n_bytes() as usize;

    let mut digest = CRC32C.digest();
    digest.update(&index.id().0.to_le_bytes());

    for i in 0..n_fields {
        match tuple.field(i) {
            Some(data) => digest.update(data),
            None if comp => {}
            None => digest.update(&NULL_FILLER[..index.sql_null_size(i)]),
        }
    }

    if n_bytes > 0 {
        match tuple.field(n_fields) {
            Some(data) => digest.update(&data[..n_bytes.min(data.len())]),
            None if comp => {}
            None => {
                let filler = index.sql_null_size(n_fields);
                digest.update(&NULL_FILLER[..n_bytes.min(filler)]);
            }
        }
    }

    digest.finalize()
}
