//! 2-bit base codec and k-mer layout arithmetic.
//!
//! Bases map to 2-bit codes `{A=0, C=1, G=2, T=3}` (case-insensitive).
//! Newlines and carriage returns inside a sequence are skipped; any other
//! byte ends the current run of valid bases. A k-mer of length K occupies
//! `kmer_width(K)` units, low bases in the low bits of the low unit, with the
//! unused high bits of the high unit kept zero.

use std::cmp::Ordering;

use crate::config::{Unit, UNIT_BITS};

/// Code returned for `\n` / `\r`: skip the byte, keep the current k-mer window.
pub const CODE_SKIP: Unit = 0x4;
/// Code returned for any byte that is not a base or a line terminator.
pub const CODE_INVALID: Unit = 0x5;

/// Maps one input byte to its 2-bit code, [`CODE_SKIP`] or [`CODE_INVALID`].
#[inline]
pub fn encode_base(ch: u8) -> Unit {
    match ch {
        b'A' | b'a' => 0x0,
        b'C' | b'c' => 0x1,
        b'G' | b'g' => 0x2,
        b'T' | b't' => 0x3,
        b'\n' | b'\r' => CODE_SKIP,
        _ => CODE_INVALID,
    }
}

/// Complement of a valid 2-bit code (A↔T, C↔G).
#[inline]
pub fn complement_code(code: Unit) -> Unit {
    debug_assert!(code <= 0x3);
    0x3 - code
}

/// Maps a 2-bit code back to its uppercase base letter.
#[inline]
pub fn decode_base(code: u8) -> u8 {
    match code & 0x3 {
        0x0 => b'A',
        0x1 => b'C',
        0x2 => b'G',
        _ => b'T',
    }
}

/// Returns `true` for the eight base letters accepted by [`encode_base`].
#[inline]
pub fn is_base(ch: u8) -> bool {
    matches!(ch, b'A' | b'a' | b'C' | b'c' | b'G' | b'g' | b'T' | b't')
}

/// Number of packing units of `unit_size` bytes needed for K bases.
pub fn kmer_width_by_unit_size(k: usize, unit_size: usize) -> usize {
    let bases_per_unit = unit_size * 8 / 2;
    k.div_ceil(bases_per_unit)
}

/// Number of [`Unit`] words needed for K bases.
pub fn kmer_width(k: usize) -> usize {
    kmer_width_by_unit_size(k, std::mem::size_of::<Unit>())
}

/// Packed size of a k-mer in bytes when stored as [`Unit`] words.
pub fn kmer_size(k: usize) -> usize {
    kmer_width(k) * std::mem::size_of::<Unit>()
}

/// Lexicographic comparison of two equal-width packed k-mers.
///
/// The high-indexed unit holds the front of the base sequence, so comparison
/// runs from the highest unit down.
pub fn compare_kmers(kmer_1: &[Unit], kmer_2: &[Unit]) -> Ordering {
    debug_assert_eq!(kmer_1.len(), kmer_2.len());
    for i in (0..kmer_1.len()).rev() {
        match kmer_1[i].cmp(&kmer_2[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Smallest count-field width in bytes (1, 2, 4 or 8) that holds `count_max`.
pub fn count_field_size(count_max: u64) -> usize {
    if count_max <= u8::MAX as u64 {
        1
    } else if count_max <= u16::MAX as u64 {
        2
    } else if count_max <= u32::MAX as u64 {
        4
    } else {
        8
    }
}

/// Number of bits of the top unit that carry valid bases for a k-mer of
/// length `k` spread over `kmer_width(k)` units.
pub fn high_valid_bits(k: usize) -> usize {
    k * 2 - UNIT_BITS * (kmer_width(k) - 1)
}
