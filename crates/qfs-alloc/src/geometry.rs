use qfs_error::{QfsError, Result};
use qfs_ondisk::{DeviceClass, Superblock};
use qfs_types::{DEV_BSIZE, Ordinal, SYSTEM_BASE, round_up};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bitmap geometry of one bitmap-owning ordinal (plain device or stripe
/// leader). Block numbers are logical group blocks for stripe leaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapGeometry {
    pub ord: Ordinal,
    pub class: DeviceClass,
    pub width: u16,
    /// Device blocks per bitmap bit.
    pub unit_blocks: u64,
    pub small_blocks: u64,
    /// Device blocks per large DAU (times stripe width).
    pub large_blocks: u64,
    /// Capacity in device blocks.
    pub capacity: u64,
    /// Bits that describe real units.
    pub bits: u64,
    /// Where the map is stored.
    pub map_ord: Ordinal,
    pub map_block: u64,
    pub map_blocks: u64,
}

impl BitmapGeometry {
    pub fn from_superblock(sb: &Superblock, ord: Ordinal) -> Result<Self> {
        let entry = sb
            .device(ord)
            .ok_or_else(|| QfsError::Superblock(format!("ordinal {ord} not in device table")))?;
        if !entry.owns_bitmap() {
            return Err(QfsError::Superblock(format!(
                "ordinal {ord} is a stripe member and has no bitmap"
            )));
        }
        let (small, large) = sb.dau_sizes(entry.class);
        let width = entry.stripe_width();
        let small_blocks = u64::from(small / DEV_BSIZE);
        let large_blocks = u64::from(large / DEV_BSIZE) * u64::from(width);
        let unit_blocks = if small < large && width == 1 {
            small_blocks
        } else {
            large_blocks
        };
        let bits = entry.capacity / unit_blocks;
        let geom = Self {
            ord,
            class: entry.class,
            width,
            unit_blocks,
            small_blocks,
            large_blocks,
            capacity: entry.capacity,
            bits,
            map_ord: entry.mm_ord,
            map_block: u64::from(entry.allocmap),
            map_blocks: u64::from(entry.l_allocmap),
        };
        let needed = bits.div_ceil(8).div_ceil(u64::from(DEV_BSIZE));
        if needed > geom.map_blocks {
            return Err(QfsError::Superblock(format!(
                "ordinal {ord}: bitmap needs {needed} blocks, superblock reserves {}",
                geom.map_blocks
            )));
        }
        Ok(geom)
    }

    /// Geometry of every bitmap-owning ordinal, in ordinal order.
    pub fn for_filesystem(sb: &Superblock) -> Result<Vec<Self>> {
        sb.eq
            .iter()
            .filter(|e| e.owns_bitmap())
            .map(|e| Self::from_superblock(sb, e.ord))
            .collect()
    }

    /// On-disk map size in bytes.
    #[must_use]
    pub fn map_bytes(&self) -> u64 {
        self.map_blocks * u64::from(DEV_BSIZE)
    }
}

/// Reserved system area of one ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemArea {
    /// Length in device blocks as recorded in the superblock.
    pub blocks: u64,
    /// Accepted only because of the version-1 small-DAU rounding.
    pub legacy_rounding: bool,
}

fn raw_system_blocks(sb: &Superblock, ord: Ordinal, width: u16) -> u64 {
    let maps: u64 = sb
        .eq
        .iter()
        .filter(|e| e.owns_bitmap() && e.mm_ord == ord)
        .map(|e| u64::from(e.l_allocmap))
        .sum();
    SYSTEM_BASE * u64::from(width) + maps
}

/// System area of `ord`: both superblock copies on every stripe member plus
/// every bitmap stored on `ord`, rounded to the large DAU.
pub fn system_area_blocks(sb: &Superblock, ord: Ordinal) -> Result<u64> {
    let geom = BitmapGeometry::from_superblock(sb, ord)?;
    Ok(round_up(
        raw_system_blocks(sb, ord, geom.width),
        geom.large_blocks,
    ))
}

/// Compare the recorded system area of `ord` against the computed one.
///
/// Version-1 images may carry the small-DAU rounded value; anything else
/// that disagrees is fatal.
pub fn check_system_area(sb: &Superblock, ord: Ordinal) -> Result<SystemArea> {
    let geom = BitmapGeometry::from_superblock(sb, ord)?;
    let recorded = sb.device(ord).map_or(0, |e| u64::from(e.system));
    let raw = raw_system_blocks(sb, ord, geom.width);
    let computed = round_up(raw, geom.large_blocks);
    if recorded == computed {
        return Ok(SystemArea {
            blocks: recorded,
            legacy_rounding: false,
        });
    }
    if sb.version.is_legacy() && recorded == round_up(raw, geom.small_blocks) {
        return Ok(SystemArea {
            blocks: recorded,
            legacy_rounding: true,
        });
    }
    Err(QfsError::Superblock(format!(
        "ordinal {ord}: system area is {recorded} blocks, expected {computed}"
    )))
}

/// Bitmaps stored on one ordinal must be laid out back to back from
/// `SYSTEM_BASE` in ordinal order.
pub fn validate_layout(sb: &Superblock) -> Result<()> {
    let mut next: BTreeMap<Ordinal, u64> = BTreeMap::new();
    for entry in sb.eq.iter().filter(|e| e.owns_bitmap()) {
        let expected = next.entry(entry.mm_ord).or_insert(SYSTEM_BASE);
        if u64::from(entry.allocmap) != *expected {
            return Err(QfsError::Superblock(format!(
                "ordinal {}: bitmap at block {} on ordinal {}, expected {}",
                entry.ord, entry.allocmap, entry.mm_ord, expected
            )));
        }
        *expected += u64::from(entry.l_allocmap);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfs_ondisk::{DeviceEntry, DeviceState, FsckRequest, OptionMask, SuperblockVersion};

    fn entry(ord: u16, class: DeviceClass, allocmap: u32, system: u32) -> DeviceEntry {
        DeviceEntry {
            ord: Ordinal(ord),
            eq: 10 + ord,
            state: DeviceState::On,
            class,
            num_group: 1,
            capacity: 8192,
            space: 0,
            allocmap,
            l_allocmap: 1,
            mm_ord: Ordinal(0),
            system,
        }
    }

    fn sb(version: SuperblockVersion) -> Superblock {
        Superblock {
            version,
            fs_id: 1,
            name: "qfs".into(),
            init_time: 1,
            update_time: 1,
            fs_count: 2,
            mm_count: 1,
            ord: Ordinal(0),
            option_mask: OptionMask::default(),
            fsck_request: FsckRequest::default(),
            sm_data: 4096,
            lg_data: 16384,
            sm_meta: 4096,
            lg_meta: 16384,
            inodes_ord: Ordinal(0),
            inodes_block: 48,
            capacity: 16384,
            space: 0,
            shared: false,
            log_ord: Ordinal(0),
            log_block: 0,
            log_len: 0,
            eq: vec![
                entry(0, DeviceClass::Meta, 32, 48),
                entry(1, DeviceClass::Data, 33, 32),
            ],
        }
    }

    #[test]
    fn geometry_uses_small_units_when_available() {
        let sb = sb(SuperblockVersion::V2);
        let g = BitmapGeometry::from_superblock(&sb, Ordinal(0)).expect("geometry");
        assert_eq!(g.unit_blocks, 4);
        assert_eq!(g.large_blocks, 16);
        assert_eq!(g.bits, 2048);
        assert_eq!(g.map_bytes(), 1024);
    }

    #[test]
    fn system_area_rounds_to_large_dau() {
        let sb = sb(SuperblockVersion::V2);
        // Ordinal 0 holds both bitmaps: 32 + 2 -> 48.
        assert_eq!(system_area_blocks(&sb, Ordinal(0)).expect("sys"), 48);
        assert_eq!(system_area_blocks(&sb, Ordinal(1)).expect("sys"), 32);
        assert!(!check_system_area(&sb, Ordinal(0)).expect("ok").legacy_rounding);
        validate_layout(&sb).expect("layout");
    }

    #[test]
    fn legacy_rounding_accepted_only_for_v1() {
        let mut v1 = sb(SuperblockVersion::V1);
        v1.eq[0].system = 36;
        let area = check_system_area(&v1, Ordinal(0)).expect("legacy ok");
        assert!(area.legacy_rounding);

        let mut v2 = sb(SuperblockVersion::V2);
        v2.eq[0].system = 36;
        assert!(matches!(
            check_system_area(&v2, Ordinal(0)),
            Err(QfsError::Superblock(_))
        ));
    }

    #[test]
    fn short_bitmap_reservation_rejected() {
        let mut sb = sb(SuperblockVersion::V2);
        sb.eq[1].capacity = 4 * 8 * 1024 * 2;
        assert!(BitmapGeometry::from_superblock(&sb, Ordinal(1)).is_err());
    }

    #[test]
    fn misplaced_bitmap_rejected() {
        let mut sb = sb(SuperblockVersion::V2);
        sb.eq[1].allocmap = 40;
        assert!(validate_layout(&sb).is_err());
    }
}
