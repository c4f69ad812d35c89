#![forbid(unsafe_code)]
//! Allocation bitmap manager.
//!
//! ## Design
//!
//! The manager is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on free maps (1 = free; unit `i`
//!    is bit `i % 32` of little-endian word `i / 32`, which is the same as
//!    bit `i % 8` of byte `i / 8`).
//! 2. **Geometry**: for each bitmap-owning ordinal, the allocation unit, bit
//!    count, map location, and the reserved system area.
//! 3. **WorkingBitmap**: the computed map, scratch-backed, built all-free
//!    and then claimed block by block while the inode scan walks extents.

mod geometry;
mod working;

pub use geometry::{BitmapGeometry, SystemArea, check_system_area, system_area_blocks, validate_layout};
pub use working::{BitmapDiff, ClaimOutcome, WorkingBitmap};

// ── Bitmap operations ───────────────────────────────────────────────────────

fn locate(idx: u64) -> Option<(usize, u8)> {
    let byte = usize::try_from(idx / 8).ok()?;
    #[expect(clippy::cast_possible_truncation)]
    let bit = (idx % 8) as u8;
    Some((byte, bit))
}

/// Whether unit `idx` is marked free. Units past the slice read as
/// allocated.
#[must_use]
pub fn bitmap_is_free(bitmap: &[u8], idx: u64) -> bool {
    locate(idx)
        .and_then(|(byte, bit)| bitmap.get(byte).map(|b| (b >> bit) & 1 == 1))
        .unwrap_or(false)
}

pub fn bitmap_mark_free(bitmap: &mut [u8], idx: u64) {
    if let Some((byte, bit)) = locate(idx) {
        if let Some(b) = bitmap.get_mut(byte) {
            *b |= 1 << bit;
        }
    }
}

pub fn bitmap_mark_allocated(bitmap: &mut [u8], idx: u64) {
    if let Some((byte, bit)) = locate(idx) {
        if let Some(b) = bitmap.get_mut(byte) {
            *b &= !(1 << bit);
        }
    }
}

/// Count free units among the first `count`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u64) -> u64 {
    let full = usize::try_from(count / 8).unwrap_or(usize::MAX).min(bitmap.len());
    let mut free: u64 = bitmap[..full]
        .iter()
        .map(|b| u64::from(b.count_ones()))
        .sum();
    for idx in (full as u64 * 8)..count {
        if bitmap_is_free(bitmap, idx) {
            free += 1;
        }
    }
    free
}

/// First free unit in `[start, count)`, wrapping to `[0, start)`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u64, start: u64) -> Option<u64> {
    (start..count)
        .chain(0..start.min(count))
        .find(|&idx| bitmap_is_free(bitmap, idx))
}

/// Mark the first `bits` units free and everything after them, including
/// padding, allocated.
pub fn bitmap_init_free(bitmap: &mut [u8], bits: u64) {
    bitmap.fill(0);
    let full = usize::try_from(bits / 8).unwrap_or(usize::MAX).min(bitmap.len());
    bitmap[..full].fill(0xFF);
    let rem = bits % 8;
    if rem != 0 {
        if let Some(last) = bitmap.get_mut(full) {
            *last = (1_u8 << rem) - 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn word_layout_matches_byte_layout() {
        let mut map = vec![0_u8; 8];
        bitmap_mark_free(&mut map, 33);
        let word = u32::from_le_bytes([map[4], map[5], map[6], map[7]]);
        assert_eq!(word, 1 << (33 % 32));
    }

    #[test]
    fn init_free_zeroes_trailing_bits() {
        let mut map = vec![0xAA_u8; 4];
        bitmap_init_free(&mut map, 11);
        assert_eq!(map, vec![0xFF, 0b0000_0111, 0, 0]);
        assert_eq!(bitmap_count_free(&map, 32), 11);
        assert!(!bitmap_is_free(&map, 11));
        assert!(!bitmap_is_free(&map, 1_000));
    }

    #[test]
    fn find_free_wraps() {
        let mut map = vec![0_u8; 2];
        bitmap_mark_free(&mut map, 3);
        assert_eq!(bitmap_find_free(&map, 16, 5), Some(3));
        assert_eq!(bitmap_find_free(&map, 16, 0), Some(3));
        bitmap_mark_allocated(&mut map, 3);
        assert_eq!(bitmap_find_free(&map, 16, 0), None);
    }

    proptest! {
        #[test]
        fn count_free_matches_bitwise_count(
            bytes in proptest::collection::vec(any::<u8>(), 0..64),
            count in 0_u64..600,
        ) {
            let expected = (0..count).filter(|&i| bitmap_is_free(&bytes, i)).count() as u64;
            prop_assert_eq!(bitmap_count_free(&bytes, count), expected);
        }

        #[test]
        fn mark_then_query(idx in 0_u64..512) {
            let mut map = vec![0_u8; 64];
            bitmap_mark_free(&mut map, idx);
            prop_assert!(bitmap_is_free(&map, idx));
            prop_assert_eq!(bitmap_count_free(&map, 512), 1);
            bitmap_mark_allocated(&mut map, idx);
            prop_assert_eq!(bitmap_count_free(&map, 512), 0);
        }
    }
}
