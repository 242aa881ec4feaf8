//! Record header codec for the two row formats.
//!
//! Every record, pseudo-records included, carries a fixed 3-byte header
//! immediately below its origin: an info byte at `origin - 3` and a
//! little-endian next-record pointer at `origin - 2`. User records add the
//! format-specific column headers below that, growing downward, mirroring
//! how the field data grows upward from the origin.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::config::PAGE_SIZE;
use crate::dict::IndexDef;
use crate::records::{PrefixParams, Tuple};

/// Fixed header bytes below every record origin.
pub const REC_EXTRA_SIZE: usize = 3;

/// Info bit: instant-ALTER metadata record.
pub(crate) const REC_INFO_METADATA: u8 = 0x01;

/// Info bit: redundant record uses one-byte end offsets.
pub(crate) const REC_INFO_OFFS_1BYTE: u8 = 0x02;

#[inline]
pub(crate) fn info(data: &[u8], origin: usize) -> u8 {
    data[origin - REC_EXTRA_SIZE]
}

#[inline]
pub(crate) fn set_info(data: &mut [u8], origin: usize, v: u8) {
    data[origin - REC_EXTRA_SIZE] = v;
}

#[inline]
pub(crate) fn next(data: &[u8], origin: usize) -> u16 {
    u16::from_le_bytes([data[origin - 2], data[origin - 1]])
}

#[inline]
pub(crate) fn set_next(data: &mut [u8], origin: usize, v: u16) {
    data[origin - 2..origin].copy_from_slice(&v.to_le_bytes());
}

/// Cumulative end offset and NULL flag of field `i` of a redundant record.
#[inline]
fn red_entry(data: &[u8], origin: usize, i: usize, one_byte: bool) -> (usize, bool) {
    if one_byte {
        let b = data[origin - REC_EXTRA_SIZE - 1 - i];
        ((b & 0x7f) as usize, b & 0x80 != 0)
    } else {
        let p = origin - REC_EXTRA_SIZE - 2 * (i + 1);
        let v = u16::from_le_bytes([data[p], data[p + 1]]);
        ((v & 0x7fff) as usize, v & 0x8000 != 0)
    }
}

/// Number of leading record bytes the prefix `(n_fields, n_bytes)` covers,
/// specialized per format so the field walk stays branch-free on the
/// format in the fingerprinting loop.
pub(crate) fn prefix_len<const COMP: bool>(
    data: &[u8],
    index: &IndexDef,
    origin: usize,
    probe: PrefixParams,
) -> usize {
    let n_fields = probe.n_fields() as usize;
    let n_bytes = probe.n_bytes() as usize;
    let n_f = n_fields + usize::from(n_bytes > 0);
    debug_assert!(n_f >= 1, "empty prefix");
    debug_assert!(n_f <= index.n_core_fields());

    if COMP {
        let mut nulls = origin - REC_EXTRA_SIZE - 1;
        let mut lens = origin - REC_EXTRA_SIZE - index.n_core_null_bytes() - 1;
        let mut null_mask = 1u8;
        let mut n = 0usize;
        let mut len = 0usize;

        for field in &index.fields()[..n_f] {
            if field.nullable {
                let is_null = data[nulls] & null_mask != 0;
                null_mask <<= 1;
                if null_mask == 0 {
                    null_mask = 1;
                    nulls -= 1;
                }
                if is_null {
                    len = 0;
                    continue;
                }
            }

            len = field.fixed_len as usize;
            if len == 0 {
                len = data[lens] as usize;
                lens = lens.wrapping_sub(1);
                if len & 0x80 != 0 && field.big {
                    len = ((len & 0x3f) << 8) | data[lens] as usize;
                    lens = lens.wrapping_sub(1);
                }
            }
            n += len;
        }

        if n_bytes > 0 {
            n = n - len + n_bytes.min(len);
        }
        n
    } else {
        let one_byte = info(data, origin) & REC_INFO_OFFS_1BYTE != 0;
        if n_bytes == 0 {
            red_entry(data, origin, n_fields - 1, one_byte).0
        } else {
            let base = if n_fields == 0 {
                0
            } else {
                red_entry(data, origin, n_fields - 1, one_byte).0
            };
            let end = red_entry(data, origin, n_fields, one_byte).0;
            base + n_bytes.min(end - base)
        }
    }
}

/// Absolute bounds of field `i` of a compact record, `None` if NULL.
pub(crate) fn field_compact(
    data: &[u8],
    index: &IndexDef,
    origin: usize,
    i: usize,
) -> Option<(usize, usize)> {
    debug_assert!(i < index.n_core_fields());
    let mut nulls = origin - REC_EXTRA_SIZE - 1;
    let mut lens = origin - REC_EXTRA_SIZE - index.n_core_null_bytes() - 1;
    let mut null_mask = 1u8;
    let mut start = 0usize;

    for (f, field) in index.fields()[..=i].iter().enumerate() {
        let mut is_null = false;
        if field.nullable {
            is_null = data[nulls] & null_mask != 0;
            null_mask <<= 1;
            if null_mask == 0 {
                null_mask = 1;
                nulls -= 1;
            }
        }
        let len = if is_null {
            0
        } else if field.fixed_len > 0 {
            field.fixed_len as usize
        } else {
            let mut l = data[lens] as usize;
            lens = lens.wrapping_sub(1);
            if l & 0x80 != 0 && field.big {
                l = ((l & 0x3f) << 8) | data[lens] as usize;
                lens = lens.wrapping_sub(1);
            }
            l
        };
        if f == i {
            return (!is_null).then_some((origin + start, len));
        }
        start += len;
    }
    unreachable!("loop covers field i");
}

/// Absolute bounds of field `i` of a redundant record, `None` if NULL.
pub(crate) fn field_redundant(
    data: &[u8],
    index: &IndexDef,
    origin: usize,
    i: usize,
) -> Option<(usize, usize)> {
    debug_assert!(i < index.n_core_fields());
    let one_byte = info(data, origin) & REC_INFO_OFFS_1BYTE != 0;
    let (end, is_null) = red_entry(data, origin, i, one_byte);
    if is_null {
        return None;
    }
    let start = if i == 0 {
        0
    } else {
        red_entry(data, origin, i - 1, one_byte).0
    };
    Some((origin + start, end - start))
}

/// Encodes a compact record at `heap_top`. Returns `(origin, new_heap_top)`.
pub(crate) fn encode_compact(
    data: &mut [u8],
    heap_top: usize,
    index: &IndexDef,
    tuple: &Tuple,
    info_bits: u8,
) -> Result<(usize, usize)> {
    ensure!(
        tuple.n_fields() == index.n_core_fields(),
        "tuple has {} fields, index needs {}",
        tuple.n_fields(),
        index.n_core_fields()
    );

    let n_null_bytes = index.n_core_null_bytes();
    let mut var_hdr = 0usize;
    let mut data_len = 0usize;
    for (i, field) in index.fields().iter().enumerate() {
        match tuple.field(i) {
            None => ensure!(field.nullable, "NULL value in non-nullable field {i}"),
            Some(v) => {
                if field.fixed_len > 0 {
                    ensure!(
                        v.len() == field.fixed_len as usize,
                        "field {i} value length {} != fixed width {}",
                        v.len(),
                        field.fixed_len
                    );
                } else if field.big {
                    ensure!(v.len() <= 0x3fff, "field {i} exceeds two-byte length header");
                    var_hdr += if v.len() >= 128 { 2 } else { 1 };
                } else {
                    ensure!(v.len() <= 255, "field {i} exceeds one-byte length header");
                    var_hdr += 1;
                }
                data_len += v.len();
            }
        }
    }

    let extra = REC_EXTRA_SIZE + n_null_bytes + var_hdr;
    let origin = heap_top + extra;
    let end = origin + data_len;
    ensure!(end <= PAGE_SIZE, "page full");

    data[heap_top..origin].fill(0);
    set_info(data, origin, info_bits);

    let mut nulls = origin - REC_EXTRA_SIZE - 1;
    let mut lens = origin - REC_EXTRA_SIZE - n_null_bytes - 1;
    let mut null_mask = 1u8;
    let mut pos = origin;
    for (i, field) in index.fields().iter().enumerate() {
        let value = tuple.field(i);
        if field.nullable {
            if value.is_none() {
                data[nulls] |= null_mask;
            }
            null_mask <<= 1;
            if null_mask == 0 {
                null_mask = 1;
                nulls -= 1;
            }
        }
        let Some(v) = value else { continue };
        if field.fixed_len == 0 {
            if field.big && v.len() >= 128 {
                data[lens] = 0x80 | (v.len() >> 8) as u8;
                lens -= 1;
                data[lens] = (v.len() & 0xff) as u8;
                lens = lens.wrapping_sub(1);
            } else {
                data[lens] = v.len() as u8;
                lens = lens.wrapping_sub(1);
            }
        }
        data[pos..pos + v.len()].copy_from_slice(v);
        pos += v.len();
    }

    Ok((origin, end))
}

/// Encodes a redundant record at `heap_top`. Returns `(origin,
/// new_heap_top)`. NULL fixed-width fields store a zero filler of their
/// full width so the on-page prefix stays byte-stable.
pub(crate) fn encode_redundant(
    data: &mut [u8],
    heap_top: usize,
    index: &IndexDef,
    tuple: &Tuple,
    info_bits: u8,
) -> Result<(usize, usize)> {
    ensure!(
        tuple.n_fields() == index.n_core_fields(),
        "tuple has {} fields, index needs {}",
        tuple.n_fields(),
        index.n_core_fields()
    );

    let mut ends: SmallVec<[usize; 8]> = SmallVec::new();
    let mut total = 0usize;
    for (i, field) in index.fields().iter().enumerate() {
        let stored = match tuple.field(i) {
            Some(v) => {
                if field.fixed_len > 0 {
                    ensure!(
                        v.len() == field.fixed_len as usize,
                        "field {i} value length {} != fixed width {}",
                        v.len(),
                        field.fixed_len
                    );
                }
                v.len()
            }
            None => {
                ensure!(field.nullable, "NULL value in non-nullable field {i}");
                index.sql_null_size(i)
            }
        };
        total += stored;
        ends.push(total);
    }
    ensure!(total <= 0x7fff, "record too large for redundant end offsets");

    let one_byte = total <= 0x7f;
    let sz = if one_byte { 1 } else { 2 };
    let extra = REC_EXTRA_SIZE + index.n_core_fields() * sz;
    let origin = heap_top + extra;
    let end = origin + total;
    ensure!(end <= PAGE_SIZE, "page full");

    data[heap_top..origin].fill(0);
    set_info(
        data,
        origin,
        if one_byte { info_bits | REC_INFO_OFFS_1BYTE } else { info_bits },
    );

    let mut pos = origin;
    for (i, field) in index.fields().iter().enumerate() {
        let value = tuple.field(i);
        let e = ends[i];
        if one_byte {
            data[origin - REC_EXTRA_SIZE - 1 - i] =
                e as u8 | if value.is_none() { 0x80 } else { 0 };
        } else {
            let p = origin - REC_EXTRA_SIZE - 2 * (i + 1);
            let v = e as u16 | if value.is_none() { 0x8000 } else { 0 };
            data[p..p + 2].copy_from_slice(&v.to_le_bytes());
        }
        match value {
            Some(v) => {
                data[pos..pos + v.len()].copy_from_slice(v);
                pos += v.len();
            }
            None => {
                let filler = field.fixed_len as usize;
                data[pos..pos + filler].fill(0);
                pos += filler;
            }
        }
    }

    Ok((origin, end))
}
