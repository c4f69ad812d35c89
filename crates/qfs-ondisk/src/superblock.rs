use qfs_types::{
    MAX_ORDINALS, Ordinal, ParseError, SUPERBLOCK_SIZE, ensure_slice, ensure_slice_mut, nul_padded, read_fixed,
    read_le_u16, read_le_u32, read_le_u64, read_u8, trim_nul_padded, write_bytes, write_le_u16,
    write_le_u32, write_le_u64, write_u8,
};
use serde::{Deserialize, Serialize};

pub const SB_MAGIC_V1: u32 = 0x5146_5331;
pub const SB_MAGIC_V2: u32 = 0x5146_5332;
pub const SB_MAGIC_V2A: u32 = 0x5146_5341;

const EQ_TABLE_OFFSET: usize = 0x100;
const EQ_ENTRY_SIZE: usize = 64;

// ── Version and option bits ─────────────────────────────────────────────────

/// Superblock format version, selected by the magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SuperblockVersion {
    V1,
    V2,
    V2a,
}

impl SuperblockVersion {
    const ALL: [Self; 3] = [Self::V1, Self::V2, Self::V2a];

    #[must_use]
    pub fn magic(self) -> u32 {
        match self {
            Self::V1 => SB_MAGIC_V1,
            Self::V2 => SB_MAGIC_V2,
            Self::V2a => SB_MAGIC_V2A,
        }
    }

    #[must_use]
    pub fn from_magic(magic: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.magic() == magic)
    }

    /// Version-1 images keep the legacy level-3 indirect layout and the
    /// small-DAU system-area rounding.
    #[must_use]
    pub fn is_legacy(self) -> bool {
        self == Self::V1
    }
}

/// Superblock option-compatibility bits (`option_mask`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionMask(pub u32);

impl OptionMask {
    pub const WORM_V2: Self = Self(0x1);
    pub const DIR_HASH: Self = Self(0x2);
    pub const LOG: Self = Self(0x4);

    const KNOWN: u32 = 0x7;

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Bits this engine does not understand for the given version.
    ///
    /// Only v2a images may carry option bits at all.
    #[must_use]
    pub fn unknown_bits(self, version: SuperblockVersion) -> u32 {
        match version {
            SuperblockVersion::V1 | SuperblockVersion::V2 => self.0,
            SuperblockVersion::V2a => self.0 & !Self::KNOWN,
        }
    }
}

/// Out-of-band check request left by the kernel module (`fsck_request`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsckRequest(pub u32);

impl FsckRequest {
    pub const NOTICE: Self = Self(0x1);
    pub const ALERT: Self = Self(0x2);

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

// ── Device table ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    On,
    Off,
    Down,
}

impl DeviceState {
    fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::On),
            1 => Ok(Self::Off),
            2 => Ok(Self::Down),
            _ => Err(ParseError::InvalidField {
                field: "eq_state",
                reason: "unknown device state",
            }),
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            Self::On => 0,
            Self::Off => 1,
            Self::Down => 2,
        }
    }
}

/// Device class: where file data vs. metadata (directories, indirect
/// blocks, the inode table) is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Data,
    Meta,
}

impl DeviceClass {
    fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Data),
            1 => Ok(Self::Meta),
            _ => Err(ParseError::InvalidField {
                field: "eq_class",
                reason: "unknown device class",
            }),
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Meta => 1,
        }
    }
}

/// One entry of the superblock's per-ordinal partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub ord: Ordinal,
    pub eq: u16,
    pub state: DeviceState,
    pub class: DeviceClass,
    /// Stripe width. 1 for a plain device, >1 for a stripe-group leader,
    /// 0 for a non-leader stripe member.
    pub num_group: u16,
    /// Device size in device blocks.
    pub capacity: u64,
    /// Free device blocks.
    pub space: u64,
    /// First device block of this ordinal's bitmap (on `mm_ord`).
    pub allocmap: u32,
    pub l_allocmap: u32,
    /// Ordinal holding this ordinal's bitmap.
    pub mm_ord: Ordinal,
    /// Reserved system-area length in device blocks.
    pub system: u32,
}

impl DeviceEntry {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, EQ_ENTRY_SIZE)?;
        Ok(Self {
            ord: Ordinal(read_le_u16(bytes, 0x00)?),
            eq: read_le_u16(bytes, 0x02)?,
            state: DeviceState::from_raw(read_u8(bytes, 0x04)?)?,
            class: DeviceClass::from_raw(read_u8(bytes, 0x05)?)?,
            num_group: read_le_u16(bytes, 0x06)?,
            capacity: read_le_u64(bytes, 0x08)?,
            space: read_le_u64(bytes, 0x10)?,
            allocmap: read_le_u32(bytes, 0x18)?,
            l_allocmap: read_le_u32(bytes, 0x1C)?,
            mm_ord: Ordinal(read_le_u16(bytes, 0x20)?),
            system: read_le_u32(bytes, 0x24)?,
        })
    }

    pub fn write_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        write_bytes(bytes, 0, &[0_u8; EQ_ENTRY_SIZE])?;
        write_le_u16(bytes, 0x00, self.ord.0)?;
        write_le_u16(bytes, 0x02, self.eq)?;
        write_u8(bytes, 0x04, self.state.to_raw())?;
        write_u8(bytes, 0x05, self.class.to_raw())?;
        write_le_u16(bytes, 0x06, self.num_group)?;
        write_le_u64(bytes, 0x08, self.capacity)?;
        write_le_u64(bytes, 0x10, self.space)?;
        write_le_u32(bytes, 0x18, self.allocmap)?;
        write_le_u32(bytes, 0x1C, self.l_allocmap)?;
        write_le_u16(bytes, 0x20, self.mm_ord.0)?;
        write_le_u32(bytes, 0x24, self.system)?;
        Ok(())
    }

    /// Whether this ordinal owns an allocation bitmap (plain devices and
    /// stripe-group leaders).
    #[must_use]
    pub fn owns_bitmap(&self) -> bool {
        self.num_group >= 1
    }

    #[must_use]
    pub fn stripe_width(&self) -> u16 {
        self.num_group.max(1)
    }

    #[must_use]
    pub fn is_down(&self) -> bool {
        self.state == DeviceState::Down
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Parsed superblock (one copy; every ordinal carries a primary and a
/// backup).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub version: SuperblockVersion,
    pub fs_id: u32,
    pub name: String,
    pub init_time: u64,
    pub update_time: u64,
    pub fs_count: u16,
    pub mm_count: u16,
    /// Ordinal this copy was read from.
    pub ord: Ordinal,
    pub option_mask: OptionMask,
    pub fsck_request: FsckRequest,
    pub sm_data: u32,
    pub lg_data: u32,
    pub sm_meta: u32,
    pub lg_meta: u32,
    pub inodes_ord: Ordinal,
    pub inodes_block: u32,
    pub capacity: u64,
    pub space: u64,
    pub shared: bool,
    pub log_ord: Ordinal,
    pub log_block: u32,
    /// Log length in device blocks; 0 when the filesystem has no log.
    pub log_len: u32,
    /// Device table, `fs_count` entries in ordinal order.
    pub eq: Vec<DeviceEntry>,
}

impl Superblock {
    /// Parse one 8192-byte superblock copy.
    ///
    /// A magic number that is only valid after a byte swap yields
    /// [`ParseError::ForeignByteOrder`]; callers treat that as fatal.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(region, 0, SUPERBLOCK_SIZE)?;

        let magic = read_le_u32(region, 0x000)?;
        let Some(version) = SuperblockVersion::from_magic(magic) else {
            if let Some(native) = SuperblockVersion::from_magic(magic.swap_bytes()) {
                return Err(ParseError::ForeignByteOrder {
                    native: u64::from(native.magic()),
                    actual: u64::from(magic),
                });
            }
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SB_MAGIC_V2A),
                actual: u64::from(magic),
            });
        };

        let fs_count = read_le_u16(region, 0x038)?;
        if fs_count == 0 || usize::from(fs_count) > MAX_ORDINALS {
            return Err(ParseError::InvalidField {
                field: "fs_count",
                reason: "must be in 1..=64",
            });
        }

        let eq = (0..usize::from(fs_count))
            .map(|i| {
                let start = EQ_TABLE_OFFSET + i * EQ_ENTRY_SIZE;
                DeviceEntry::parse_from_bytes(ensure_slice(region, start, EQ_ENTRY_SIZE)?)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let sb = Self {
            version,
            fs_id: read_le_u32(region, 0x004)?,
            name: trim_nul_padded(&read_fixed::<32>(region, 0x008)?),
            init_time: read_le_u64(region, 0x028)?,
            update_time: read_le_u64(region, 0x030)?,
            fs_count,
            mm_count: read_le_u16(region, 0x03A)?,
            ord: Ordinal(read_le_u16(region, 0x03C)?),
            option_mask: OptionMask(read_le_u32(region, 0x040)?),
            fsck_request: FsckRequest(read_le_u32(region, 0x044)?),
            sm_data: read_le_u32(region, 0x048)?,
            lg_data: read_le_u32(region, 0x04C)?,
            sm_meta: read_le_u32(region, 0x050)?,
            lg_meta: read_le_u32(region, 0x054)?,
            inodes_ord: Ordinal(read_le_u16(region, 0x058)?),
            inodes_block: read_le_u32(region, 0x05C)?,
            capacity: read_le_u64(region, 0x060)?,
            space: read_le_u64(region, 0x068)?,
            shared: read_le_u32(region, 0x070)? != 0,
            log_ord: Ordinal(read_le_u16(region, 0x074)?),
            log_block: read_le_u32(region, 0x078)?,
            log_len: read_le_u32(region, 0x07C)?,
            eq,
        };
        sb.validate_geometry()?;
        Ok(sb)
    }

    /// Serialize into a full 8192-byte region.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        write_le_u32(&mut region, 0x000, self.version.magic())?;
        write_le_u32(&mut region, 0x004, self.fs_id)?;
        write_bytes(&mut region, 0x008, &nul_padded::<32>(&self.name))?;
        write_le_u64(&mut region, 0x028, self.init_time)?;
        write_le_u64(&mut region, 0x030, self.update_time)?;
        write_le_u16(&mut region, 0x038, self.fs_count)?;
        write_le_u16(&mut region, 0x03A, self.mm_count)?;
        write_le_u16(&mut region, 0x03C, self.ord.0)?;
        write_le_u32(&mut region, 0x040, self.option_mask.0)?;
        write_le_u32(&mut region, 0x044, self.fsck_request.0)?;
        write_le_u32(&mut region, 0x048, self.sm_data)?;
        write_le_u32(&mut region, 0x04C, self.lg_data)?;
        write_le_u32(&mut region, 0x050, self.sm_meta)?;
        write_le_u32(&mut region, 0x054, self.lg_meta)?;
        write_le_u16(&mut region, 0x058, self.inodes_ord.0)?;
        write_le_u32(&mut region, 0x05C, self.inodes_block)?;
        write_le_u64(&mut region, 0x060, self.capacity)?;
        write_le_u64(&mut region, 0x068, self.space)?;
        write_le_u32(&mut region, 0x070, u32::from(self.shared))?;
        write_le_u16(&mut region, 0x074, self.log_ord.0)?;
        write_le_u32(&mut region, 0x078, self.log_block)?;
        write_le_u32(&mut region, 0x07C, self.log_len)?;
        for (i, entry) in self.eq.iter().enumerate() {
            let start = EQ_TABLE_OFFSET + i * EQ_ENTRY_SIZE;
            entry.write_into(ensure_slice_mut(&mut region, start, EQ_ENTRY_SIZE)?)?;
        }
        Ok(region)
    }

    /// Validate DAU sizes, counts, and device-table consistency.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.mm_count > self.fs_count {
            return Err(ParseError::InvalidField {
                field: "mm_count",
                reason: "exceeds fs_count",
            });
        }
        if self.ord.0 >= self.fs_count {
            return Err(ParseError::InvalidField {
                field: "ord",
                reason: "outside device table",
            });
        }

        validate_dau_pair("sm_data/lg_data", self.sm_data, self.lg_data)?;
        validate_dau_pair("sm_meta/lg_meta", self.sm_meta, self.lg_meta)?;
        if self.sm_meta < 4096 {
            return Err(ParseError::InvalidField {
                field: "sm_meta",
                reason: "must be >= 4096",
            });
        }
        if self.mm_count == 0 && (self.sm_meta != self.sm_data || self.lg_meta != self.lg_data) {
            return Err(ParseError::InvalidField {
                field: "sm_meta/lg_meta",
                reason: "must equal data sizes without metadata devices",
            });
        }

        for (i, entry) in self.eq.iter().enumerate() {
            if entry.ord.index() != i {
                return Err(ParseError::InvalidField {
                    field: "eq_ord",
                    reason: "device table out of ordinal order",
                });
            }
            if entry.mm_ord.0 >= self.fs_count {
                return Err(ParseError::InvalidField {
                    field: "eq_mm_ord",
                    reason: "bitmap ordinal outside device table",
                });
            }
            if entry.num_group != 1 && entry.class == DeviceClass::Meta {
                return Err(ParseError::InvalidField {
                    field: "eq_num_group",
                    reason: "metadata devices cannot be striped",
                });
            }
        }

        self.validate_stripe_groups()?;
        if self.device(self.inodes_ord).is_none_or(|e| e.num_group != 1) {
            return Err(ParseError::InvalidField {
                field: "inodes_ord",
                reason: "must name an unstriped ordinal",
            });
        }
        if self.has_log() && self.device(self.log_ord).is_none_or(|e| e.num_group != 1) {
            return Err(ParseError::InvalidField {
                field: "log_ord",
                reason: "must name an unstriped ordinal",
            });
        }

        let meta_devices = self
            .eq
            .iter()
            .filter(|e| e.class == DeviceClass::Meta)
            .count();
        if meta_devices != usize::from(self.mm_count) {
            return Err(ParseError::InvalidField {
                field: "mm_count",
                reason: "disagrees with device table",
            });
        }

        Ok(())
    }

    /// A leader of width `w` is followed by exactly `w - 1` members; bitmaps
    /// are never stored on a striped ordinal.
    fn validate_stripe_groups(&self) -> Result<(), ParseError> {
        let mut members_left = 0_u16;
        for entry in &self.eq {
            if entry.num_group == 0 {
                if members_left == 0 {
                    return Err(ParseError::InvalidField {
                        field: "eq_num_group",
                        reason: "stripe member without a leader",
                    });
                }
                members_left -= 1;
                continue;
            }
            if members_left != 0 {
                return Err(ParseError::InvalidField {
                    field: "eq_num_group",
                    reason: "stripe group shorter than its width",
                });
            }
            members_left = entry.num_group - 1;
            if entry.owns_bitmap()
                && self.device(entry.mm_ord).is_none_or(|holder| holder.num_group != 1)
            {
                return Err(ParseError::InvalidField {
                    field: "eq_mm_ord",
                    reason: "bitmap stored on a striped ordinal",
                });
            }
        }
        if members_left != 0 {
            return Err(ParseError::InvalidField {
                field: "eq_num_group",
                reason: "stripe group runs past the device table",
            });
        }
        Ok(())
    }

    /// Leader ordinal of the stripe group `ord` belongs to (itself when
    /// unstriped).
    #[must_use]
    pub fn stripe_leader(&self, ord: Ordinal) -> Ordinal {
        let mut idx = ord.index().min(self.eq.len().saturating_sub(1));
        while idx > 0 && self.eq[idx].num_group == 0 {
            idx -= 1;
        }
        Ordinal(u16::try_from(idx).unwrap_or(u16::MAX))
    }

    #[must_use]
    pub fn device(&self, ord: Ordinal) -> Option<&DeviceEntry> {
        self.eq.get(ord.index())
    }

    /// (small, large) DAU sizes in bytes for a device class.
    #[must_use]
    pub fn dau_sizes(&self, class: DeviceClass) -> (u32, u32) {
        match class {
            DeviceClass::Data => (self.sm_data, self.lg_data),
            DeviceClass::Meta => (self.sm_meta, self.lg_meta),
        }
    }

    /// Class metadata is allocated from: meta devices when present.
    #[must_use]
    pub fn meta_class(&self) -> DeviceClass {
        if self.mm_count == 0 {
            DeviceClass::Data
        } else {
            DeviceClass::Meta
        }
    }

    #[must_use]
    pub fn has_log(&self) -> bool {
        self.log_len != 0
    }

    /// Whether `other` is a copy of the same filesystem instance.
    #[must_use]
    pub fn same_filesystem(&self, other: &Self) -> bool {
        self.fs_id == other.fs_id && self.init_time == other.init_time
    }
}

fn validate_dau_pair(field: &'static str, small: u32, large: u32) -> Result<(), ParseError> {
    if !small.is_power_of_two() || !large.is_power_of_two() {
        return Err(ParseError::InvalidField {
            field,
            reason: "DAU sizes must be powers of two",
        });
    }
    if small < 1024 || small > large {
        return Err(ParseError::InvalidField {
            field,
            reason: "require 1024 <= small <= large",
        });
    }
    if large / small > 64 {
        return Err(ParseError::InvalidField {
            field,
            reason: "large/small ratio exceeds 64",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            version: SuperblockVersion::V2a,
            fs_id: 0xFEED,
            name: "samfs1".into(),
            init_time: 100,
            update_time: 200,
            fs_count: 2,
            mm_count: 1,
            ord: Ordinal(0),
            option_mask: OptionMask(OptionMask::DIR_HASH.0 | OptionMask::WORM_V2.0),
            fsck_request: FsckRequest::default(),
            sm_data: 4096,
            lg_data: 16384,
            sm_meta: 4096,
            lg_meta: 16384,
            inodes_ord: Ordinal(0),
            inodes_block: 48,
            capacity: 8192,
            space: 4000,
            shared: false,
            log_ord: Ordinal(0),
            log_block: 0,
            log_len: 0,
            eq: vec![
                DeviceEntry {
                    ord: Ordinal(0),
                    eq: 10,
                    state: DeviceState::On,
                    class: DeviceClass::Meta,
                    num_group: 1,
                    capacity: 4096,
                    space: 2000,
                    allocmap: 32,
                    l_allocmap: 1,
                    mm_ord: Ordinal(0),
                    system: 48,
                },
                DeviceEntry {
                    ord: Ordinal(1),
                    eq: 11,
                    state: DeviceState::On,
                    class: DeviceClass::Data,
                    num_group: 1,
                    capacity: 4096,
                    space: 2000,
                    allocmap: 33,
                    l_allocmap: 1,
                    mm_ord: Ordinal(0),
                    system: 32,
                },
            ],
        }
    }

    #[test]
    fn superblock_round_trips_through_region() {
        let sb = sample();
        let region = sb.to_bytes().expect("serialize");
        assert_eq!(region.len(), SUPERBLOCK_SIZE);
        let parsed = Superblock::parse_superblock_region(&region).expect("parse");
        assert_eq!(parsed, sb);
    }

    #[test]
    fn swapped_magic_is_foreign_byte_order() {
        let mut region = sample().to_bytes().expect("serialize");
        region[0..4].copy_from_slice(&SB_MAGIC_V2.to_be_bytes());
        let err = Superblock::parse_superblock_region(&region).unwrap_err();
        assert!(matches!(err, ParseError::ForeignByteOrder { .. }), "{err:?}");
    }

    #[test]
    fn garbage_magic_is_invalid_magic() {
        let mut region = sample().to_bytes().expect("serialize");
        region[0..4].copy_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        assert!(matches!(
            Superblock::parse_superblock_region(&region),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn option_bits_depend_on_version() {
        let mask = OptionMask(0x3);
        assert_eq!(mask.unknown_bits(SuperblockVersion::V2a), 0);
        assert_eq!(mask.unknown_bits(SuperblockVersion::V2), 0x3);
        assert_eq!(OptionMask(0x18).unknown_bits(SuperblockVersion::V2a), 0x18);
    }

    #[test]
    fn geometry_rejects_bad_dau_sizes() {
        let mut sb = sample();
        sb.lg_data = 3000;
        assert!(sb.validate_geometry().is_err());

        let mut sb = sample();
        sb.sm_data = 1024;
        sb.lg_data = 1024 * 128;
        assert!(sb.validate_geometry().is_err());

        let mut sb = sample();
        sb.sm_meta = 2048;
        assert!(sb.validate_geometry().is_err());
    }

    #[test]
    fn geometry_rejects_mm_count_mismatch() {
        let mut sb = sample();
        sb.mm_count = 0;
        assert!(sb.validate_geometry().is_err());
    }

    #[test]
    fn striped_meta_device_rejected() {
        let mut sb = sample();
        sb.eq[0].num_group = 2;
        assert!(sb.validate_geometry().is_err());
    }

    #[test]
    fn stripe_groups_validated() {
        let mut sb = sample();
        let mut member = sb.eq[1];
        member.ord = Ordinal(2);
        member.num_group = 0;
        sb.eq[1].num_group = 2;
        sb.eq.push(member);
        sb.fs_count = 3;
        sb.validate_geometry().expect("leader + member");
        assert_eq!(sb.stripe_leader(Ordinal(2)), Ordinal(1));
        assert_eq!(sb.stripe_leader(Ordinal(0)), Ordinal(0));

        sb.eq[1].num_group = 3;
        assert!(sb.validate_geometry().is_err(), "group runs past table");

        sb.eq[1].num_group = 1;
        assert!(sb.validate_geometry().is_err(), "member without leader");
    }

    #[test]
    fn fs_count_zero_rejected() {
        let mut region = sample().to_bytes().expect("serialize");
        region[0x38..0x3A].copy_from_slice(&0_u16.to_le_bytes());
        assert!(matches!(
            Superblock::parse_superblock_region(&region),
            Err(ParseError::InvalidField {
                field: "fs_count",
                ..
            })
        ));
    }
}
