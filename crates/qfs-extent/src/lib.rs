#![forbid(unsafe_code)]
//! Extent translation: logical byte offset to extent-array position.
//!
//! Pure functions, no I/O. Given a file's DAU geometry, [`translate`]
//! decides which of the 19 extent slots addresses an offset, whether that
//! slot is a direct small/large pointer or an N-th level indirect block,
//! the index to follow at each indirect level, and how many more pointers
//! remain in the same container. [`offset_of`] is the exact inverse and is
//! what the extent walker uses for end-of-file decisions.
//!
//! ## Layout
//!
//! | Slots | Addresses |
//! |-------|-----------|
//! | 0..8 | small DAUs (when small DAUs apply), otherwise large |
//! | 8..16 | large DAUs |
//! | 16 | level-1 indirect: `B` large DAUs |
//! | 17 | level-2 indirect: `B²` large DAUs |
//! | 18 | level-3 indirect: `B³` large DAUs |
//!
//! `B` is the indirect branching factor of a large metadata block.
//!
//! ## Version-1 level-3 layout
//!
//! Version-1 images store the two outer level-3 path positions one slot
//! higher than their logical digit (slot 0 unused). The translator emits
//! stored positions and [`offset_of`] decrements them, so level-3 capacity
//! on those images is `(B-1)²·B`.

use qfs_error::{QfsError, Result};
use qfs_ondisk::indirect::branching_factor;
use qfs_ondisk::{DeviceClass, Inode, InodeStatus, Superblock};
use qfs_types::{DEV_BSIZE, NDEXT, NSDEXT};
use serde::{Deserialize, Serialize};

/// First indirect slot; slot `INDIRECT_SLOT + level - 1` holds level `level`.
pub const INDIRECT_SLOT: usize = NDEXT;

// ── Geometry ────────────────────────────────────────────────────────────────

/// DAU geometry of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DauGeometry {
    /// Small DAU in bytes.
    pub small: u64,
    /// Large DAU in bytes, already multiplied by the stripe width.
    pub large: u64,
    /// Whether direct slots 0..8 hold small DAUs.
    pub small_direct: bool,
    /// Pointers per indirect block.
    pub branching: u64,
    /// Size of an indirect block in bytes.
    pub indirect_size: u64,
    /// Version-1 level-3 layout.
    pub legacy_level3: bool,
}

impl DauGeometry {
    /// Geometry for `inode` on the filesystem described by `sb`.
    ///
    /// Directories, segment indexes and `META` files use metadata DAU sizes
    /// on an unstriped device. Other files use data sizes and the stripe
    /// width of the group holding `extents[0].ord`.
    #[must_use]
    pub fn for_inode(sb: &Superblock, inode: &Inode) -> Self {
        let class = file_class(sb, inode);
        let width = match class {
            DeviceClass::Meta => 1,
            DeviceClass::Data => {
                let leader = sb.stripe_leader(inode.extents[0].ord);
                sb.device(leader).map_or(1, |e| u64::from(e.stripe_width()))
            }
        };
        let (small, large) = sb.dau_sizes(class);
        Self::new(
            u64::from(small),
            u64::from(large),
            width,
            inode.status.contains(InodeStatus::ON_LARGE),
            u64::from(sb.lg_meta),
            sb.version.is_legacy(),
        )
    }

    #[must_use]
    pub fn new(
        small: u64,
        large: u64,
        stripe_width: u64,
        on_large: bool,
        indirect_size: u64,
        legacy_level3: bool,
    ) -> Self {
        let width = stripe_width.max(1);
        Self {
            small,
            large: large * width,
            small_direct: small < large && width == 1 && !on_large,
            branching: branching_factor(u32::try_from(indirect_size).unwrap_or(u32::MAX)),
            indirect_size,
            legacy_level3,
        }
    }

    /// Bytes addressed by the 16 direct slots.
    #[must_use]
    pub fn direct_span(&self) -> u64 {
        if self.small_direct {
            NSDEXT as u64 * self.small + (NDEXT - NSDEXT) as u64 * self.large
        } else {
            NDEXT as u64 * self.large
        }
    }

    /// Data block size addressed by a direct slot.
    #[must_use]
    pub fn direct_unit(&self, slot: usize) -> u64 {
        if self.small_direct && slot < NSDEXT {
            self.small
        } else {
            self.large
        }
    }

    /// Large DAUs addressed through the level-3 slot.
    fn level3_capacity(&self) -> u64 {
        let b = self.branching;
        if self.legacy_level3 {
            b.saturating_sub(1)
                .saturating_mul(b.saturating_sub(1))
                .saturating_mul(b)
        } else {
            b.saturating_mul(b).saturating_mul(b)
        }
    }

    /// Largest file size addressable with this geometry.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        let b = self.branching;
        let blocks = b
            .saturating_add(b.saturating_mul(b))
            .saturating_add(self.level3_capacity());
        self.direct_span()
            .saturating_add(blocks.saturating_mul(self.large))
    }

    /// Device blocks covered by one DAU of `bytes`.
    #[must_use]
    pub fn dev_blocks(bytes: u64) -> u64 {
        bytes / u64::from(DEV_BSIZE)
    }
}

/// Device class a file's data is allocated from.
#[must_use]
pub fn file_class(sb: &Superblock, inode: &Inode) -> DeviceClass {
    if inode.is_dir()
        || inode.status.contains(InodeStatus::SEG_INDEX)
        || inode.status.contains(InodeStatus::META)
    {
        sb.meta_class()
    } else {
        DeviceClass::Data
    }
}

/// Size of one member id in a segment index table.
pub const SEG_ID_SIZE: u64 = 8;

/// Bytes the extent arrays of `inode` map: the member table of a segment
/// index, the file size otherwise.
#[must_use]
pub fn mapped_len(inode: &Inode) -> u64 {
    if !inode.status.contains(InodeStatus::SEG_INDEX) {
        return inode.size;
    }
    if inode.seg_size == 0 {
        return 0;
    }
    inode.size.div_ceil(inode.seg_size).saturating_mul(SEG_ID_SIZE)
}

// ── Translation ─────────────────────────────────────────────────────────────

/// Where an offset lives in the extent arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    Direct {
        slot: usize,
        /// Whether the slot holds a small DAU.
        small: bool,
    },
    Indirect {
        /// Extent slot (16, 17 or 18).
        slot: usize,
        /// Indirection depth, 1..=3.
        level: u8,
        /// Stored position to follow in each indirect block, outermost
        /// first; only `level` entries are meaningful.
        path: [u64; 3],
    },
}

impl Location {
    /// Extent slot in the inode.
    #[must_use]
    pub fn slot(&self) -> usize {
        match *self {
            Self::Direct { slot, .. } | Self::Indirect { slot, .. } => slot,
        }
    }

    /// Meaningful path positions (empty for direct slots).
    #[must_use]
    pub fn path(&self) -> &[u64] {
        match self {
            Self::Direct { .. } => &[],
            Self::Indirect { level, path, .. } => &path[..usize::from(*level)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub location: Location,
    /// Byte offset within the addressed data block.
    pub within: u64,
    /// Size of the addressed data block in bytes.
    pub unit: u64,
    /// Further pointers addressable in the same container (direct region
    /// or innermost indirect block) after this one.
    pub remaining: u64,
}

/// Translate a logical byte offset.
///
/// Fails with [`QfsError::FileTooLarge`] when the offset lies beyond what
/// the three indirect levels can address.
pub fn translate(geom: &DauGeometry, offset: u64) -> Result<Translation> {
    let small_span = if geom.small_direct {
        NSDEXT as u64 * geom.small
    } else {
        0
    };
    let large_first = if geom.small_direct { NSDEXT } else { 0 };

    if offset < small_span {
        let slot = offset / geom.small;
        return Ok(Translation {
            location: Location::Direct {
                slot: to_usize(slot),
                small: true,
            },
            within: offset % geom.small,
            unit: geom.small,
            remaining: NSDEXT as u64 - 1 - slot,
        });
    }

    let direct_span = geom.direct_span();
    if offset < direct_span {
        let rel = offset - small_span;
        let slot = large_first as u64 + rel / geom.large;
        return Ok(Translation {
            location: Location::Direct {
                slot: to_usize(slot),
                small: false,
            },
            within: rel % geom.large,
            unit: geom.large,
            remaining: NDEXT as u64 - 1 - slot,
        });
    }

    let b = geom.branching;
    let too_large = || QfsError::FileTooLarge { offset };
    if b == 0 {
        return Err(too_large());
    }
    let rel = offset - direct_span;
    let within = rel % geom.large;
    let mut index = rel / geom.large;

    let indirect = |slot: usize, level: u8, path: [u64; 3], innermost: u64| Translation {
        location: Location::Indirect { slot, level, path },
        within,
        unit: geom.large,
        remaining: b - 1 - innermost,
    };

    if index < b {
        return Ok(indirect(INDIRECT_SLOT, 1, [index, 0, 0], index));
    }
    index -= b;

    let level2 = b.checked_mul(b).ok_or_else(too_large)?;
    if index < level2 {
        let inner = index % b;
        return Ok(indirect(INDIRECT_SLOT + 1, 2, [index / b, inner, 0], inner));
    }
    index -= level2;

    if index >= geom.level3_capacity() {
        return Err(too_large());
    }
    let inner = index % b;
    let upper = index / b;
    let path = if geom.legacy_level3 {
        let outer_digits = b - 1;
        [upper / outer_digits + 1, upper % outer_digits + 1, inner]
    } else {
        [upper / b, upper % b, inner]
    };
    Ok(indirect(INDIRECT_SLOT + 2, 3, path, inner))
}

/// Logical byte offset of the first byte addressed by extent `slot`
/// followed by stored indirect positions `path`.
///
/// `path` may be shorter than the slot's depth: the result is then the
/// first offset covered by the indirect block reached so far. Returns
/// `None` for positions the geometry cannot address (including the unused
/// slot 0 of version-1 level-3 outer blocks).
#[must_use]
pub fn offset_of(geom: &DauGeometry, slot: usize, path: &[u64]) -> Option<u64> {
    if slot < NDEXT {
        if !path.is_empty() {
            return None;
        }
        let slot = slot as u64;
        return Some(if geom.small_direct {
            if slot < NSDEXT as u64 {
                slot * geom.small
            } else {
                NSDEXT as u64 * geom.small + (slot - NSDEXT as u64) * geom.large
            }
        } else {
            slot * geom.large
        });
    }

    let b = geom.branching;
    let level = slot.checked_sub(INDIRECT_SLOT)? + 1;
    if level > 3 || path.len() > level || path.iter().any(|p| *p >= b) {
        return None;
    }

    // Logical digits, outermost first; missing inner digits are zero.
    let mut digits = [0_u64; 3];
    for (i, stored) in path.iter().enumerate() {
        let shifted = geom.legacy_level3 && level == 3 && i < 2;
        digits[i] = if shifted { stored.checked_sub(1)? } else { *stored };
    }

    let (base, index) = match level {
        1 => (0, digits[0]),
        2 => (b, digits[0].checked_mul(b)?.checked_add(digits[1])?),
        _ => {
            let outer = if geom.legacy_level3 { b - 1 } else { b };
            let upper = digits[0].checked_mul(outer)?.checked_add(digits[1])?;
            (
                b.checked_add(b.checked_mul(b)?)?,
                upper.checked_mul(b)?.checked_add(digits[2])?,
            )
        }
    };
    let blocks = base.checked_add(index)?;
    geom.direct_span()
        .checked_add(blocks.checked_mul(geom.large)?)
}

/// Device block holding `offset` of a direct-mapped file, `None` at or past
/// the end of the span.
#[must_use]
pub fn direct_map(base: u64, span_blocks: u64, offset: u64) -> Option<u64> {
    let rel = offset >> qfs_types::DEV_BSHIFT;
    (rel < span_blocks).then(|| base + rel)
}

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SMALL: u64 = 4096;
    const LARGE: u64 = 16384;

    fn geom(legacy: bool) -> DauGeometry {
        DauGeometry::new(SMALL, LARGE, 1, false, 4096, legacy)
    }

    #[test]
    fn small_and_large_direct_regions() {
        let g = geom(false);
        assert!(g.small_direct);
        assert_eq!(g.direct_span(), 8 * SMALL + 8 * LARGE);

        let t = translate(&g, 0).expect("offset 0");
        assert_eq!(
            t.location,
            Location::Direct {
                slot: 0,
                small: true
            }
        );
        assert_eq!(t.remaining, 7);

        let t = translate(&g, 8 * SMALL + 5).expect("first large");
        assert_eq!(
            t.location,
            Location::Direct {
                slot: 8,
                small: false
            }
        );
        assert_eq!(t.within, 5);
        assert_eq!(t.unit, LARGE);
        assert_eq!(t.remaining, 7);
    }

    #[test]
    fn on_large_and_striped_files_skip_small_region() {
        let on_large = DauGeometry::new(SMALL, LARGE, 1, true, 4096, false);
        assert!(!on_large.small_direct);
        assert_eq!(on_large.direct_span(), 16 * LARGE);

        let striped = DauGeometry::new(SMALL, LARGE, 2, false, 4096, false);
        assert!(!striped.small_direct);
        assert_eq!(striped.large, 2 * LARGE);
    }

    #[test]
    fn indirect_levels() {
        let g = geom(false);
        let b = g.branching;
        assert_eq!(b, 510);
        let d = g.direct_span();

        let t = translate(&g, d).expect("level 1");
        assert_eq!(
            t.location,
            Location::Indirect {
                slot: 16,
                level: 1,
                path: [0, 0, 0]
            }
        );
        assert_eq!(t.remaining, b - 1);

        let t = translate(&g, d + b * LARGE).expect("level 2");
        assert_eq!(t.location.slot(), 17);
        assert_eq!(t.location.path(), &[0, 0]);

        let t = translate(&g, d + (b + b * b + b + 3) * LARGE).expect("level 3");
        assert_eq!(t.location.slot(), 18);
        assert_eq!(t.location.path(), &[0, 1, 3]);
    }

    #[test]
    fn legacy_level3_shifts_outer_positions() {
        let g = geom(true);
        let b = g.branching;
        let start3 = g.direct_span() + (b + b * b) * LARGE;
        let t = translate(&g, start3).expect("first level-3 block");
        assert_eq!(t.location.path(), &[1, 1, 0]);
        assert_eq!(offset_of(&g, 18, &[1, 1, 0]), Some(start3));
        assert_eq!(offset_of(&g, 18, &[0, 1, 0]), None);
        assert_eq!(offset_of(&g, 18, &[1, 0]), None);

        // Level 1 and 2 are unaffected.
        let t = translate(&g, g.direct_span()).expect("level 1");
        assert_eq!(t.location.path(), &[0]);
    }

    #[test]
    fn beyond_level3_is_file_too_large() {
        for legacy in [false, true] {
            let g = geom(legacy);
            let max = g.max_size();
            assert!(translate(&g, max - 1).is_ok());
            assert!(matches!(
                translate(&g, max),
                Err(QfsError::FileTooLarge { .. })
            ));
        }
        assert!(geom(true).max_size() < geom(false).max_size());
    }

    #[test]
    fn partial_paths_give_container_start() {
        let g = geom(false);
        let b = g.branching;
        let d = g.direct_span();
        assert_eq!(offset_of(&g, 16, &[]), Some(d));
        assert_eq!(offset_of(&g, 17, &[2]), Some(d + (b + 2 * b) * LARGE));
        assert_eq!(offset_of(&g, 17, &[b]), None);
        assert_eq!(offset_of(&g, 19, &[]), None);
    }

    #[test]
    fn segment_index_maps_its_member_table() {
        let mut index = Inode::free(qfs_types::InodeId::new(20, 1));
        index.status.insert(InodeStatus::SEG_INDEX);
        index.size = 10 * 1024 * 1024 + 1;
        index.seg_size = 1024 * 1024;
        assert_eq!(mapped_len(&index), 11 * SEG_ID_SIZE);
        index.seg_size = 0;
        assert_eq!(mapped_len(&index), 0);

        let mut plain = Inode::free(qfs_types::InodeId::new(21, 1));
        plain.size = 5000;
        assert_eq!(mapped_len(&plain), 5000);
    }

    #[test]
    fn direct_map_span() {
        assert_eq!(direct_map(1000, 4, 0), Some(1000));
        assert_eq!(direct_map(1000, 4, 3 * 1024 + 1023), Some(1003));
        assert_eq!(direct_map(1000, 4, 4 * 1024), None);
    }

    fn slot_path_key(t: &Translation) -> (usize, Vec<u64>) {
        (t.location.slot(), t.location.path().to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn translate_then_offset_of_is_identity(
            offset in 0_u64..geom(false).max_size(),
            legacy in any::<bool>(),
            small_direct in any::<bool>(),
        ) {
            let g = DauGeometry::new(SMALL, LARGE, 1, !small_direct, 4096, legacy);
            prop_assume!(offset < g.max_size());
            let t = translate(&g, offset).expect("addressable");
            let start = offset_of(&g, t.location.slot(), t.location.path())
                .expect("inverse exists");
            prop_assert_eq!(start + t.within, offset);
            prop_assert!(t.within < t.unit);
        }

        #[test]
        fn translation_order_follows_offset_order(
            a in 0_u64..geom(true).max_size(),
            b in 0_u64..geom(true).max_size(),
            legacy in any::<bool>(),
        ) {
            let g = geom(legacy);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let tl = translate(&g, lo).expect("lo");
            let th = translate(&g, hi).expect("hi");
            prop_assert!(slot_path_key(&tl) <= slot_path_key(&th));
        }

        #[test]
        fn sequential_units_tile_the_address_space(index in 0_u64..2_000_000) {
            // Walking block-by-block must visit consecutive offsets with no
            // gaps: next block starts where this one ends.
            let g = geom(false);
            let offset = g.direct_span() + index * LARGE;
            let t = translate(&g, offset).expect("in range");
            let next = translate(&g, offset + t.unit).expect("next in range");
            let start = offset_of(&g, next.location.slot(), next.location.path())
                .expect("inverse");
            prop_assert_eq!(start, offset + t.unit);
        }
    }
}
