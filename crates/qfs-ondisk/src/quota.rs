use qfs_types::{ParseError, ensure_slice, read_le_u64, write_bytes, write_le_u64};
use serde::{Deserialize, Serialize};

pub const QUOTA_RECORD_SIZE: usize = 128;
const TOTAL_OFFSET: usize = 0x30;

/// Quota domain; each has its own quota file in the root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QuotaDomain {
    Admin,
    Group,
    User,
}

impl QuotaDomain {
    pub const ALL: [Self; 3] = [Self::Admin, Self::Group, Self::User];

    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Admin => ".quota_a",
            Self::Group => ".quota_g",
            Self::User => ".quota_u",
        }
    }
}

/// One counter set (limits plus usage).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCounters {
    pub file_soft: u64,
    pub file_hard: u64,
    pub block_soft: u64,
    pub block_hard: u64,
    pub files: u64,
    /// Usage in 512-byte quota units.
    pub blocks: u64,
}

impl QuotaCounters {
    fn parse(bytes: &[u8], base: usize) -> Result<Self, ParseError> {
        Ok(Self {
            file_soft: read_le_u64(bytes, base)?,
            file_hard: read_le_u64(bytes, base + 0x08)?,
            block_soft: read_le_u64(bytes, base + 0x10)?,
            block_hard: read_le_u64(bytes, base + 0x18)?,
            files: read_le_u64(bytes, base + 0x20)?,
            blocks: read_le_u64(bytes, base + 0x28)?,
        })
    }

    fn write(&self, bytes: &mut [u8], base: usize) -> Result<(), ParseError> {
        write_le_u64(bytes, base, self.file_soft)?;
        write_le_u64(bytes, base + 0x08, self.file_hard)?;
        write_le_u64(bytes, base + 0x10, self.block_soft)?;
        write_le_u64(bytes, base + 0x18, self.block_hard)?;
        write_le_u64(bytes, base + 0x20, self.files)?;
        write_le_u64(bytes, base + 0x28, self.blocks)?;
        Ok(())
    }
}

/// Quota record for one id: online usage and total (online + offline).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub online: QuotaCounters,
    pub total: QuotaCounters,
}

impl QuotaRecord {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, QUOTA_RECORD_SIZE)?;
        Ok(Self {
            online: QuotaCounters::parse(bytes, 0)?,
            total: QuotaCounters::parse(bytes, TOTAL_OFFSET)?,
        })
    }

    pub fn write_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        write_bytes(bytes, 0, &[0_u8; QUOTA_RECORD_SIZE])?;
        self.online.write(bytes, 0)?;
        self.total.write(bytes, TOTAL_OFFSET)
    }

    /// Whether usage counters agree; limits are never compared.
    #[must_use]
    pub fn usage_matches(&self, other: &Self) -> bool {
        self.online.files == other.online.files
            && self.online.blocks == other.online.blocks
            && self.total.files == other.total.files
            && self.total.blocks == other.total.blocks
    }

    /// Copy usage counters from `computed`, keeping this record's limits.
    pub fn take_usage(&mut self, computed: &Self) {
        self.online.files = computed.online.files;
        self.online.blocks = computed.online.blocks;
        self.total.files = computed.total.files;
        self.total.blocks = computed.total.blocks;
    }

    #[must_use]
    pub fn is_unused(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips() {
        let rec = QuotaRecord {
            online: QuotaCounters {
                file_soft: 10,
                file_hard: 20,
                block_soft: 1000,
                block_hard: 2000,
                files: 3,
                blocks: 96,
            },
            total: QuotaCounters {
                files: 4,
                blocks: 200,
                ..QuotaCounters::default()
            },
        };
        let mut buf = vec![0xEE_u8; QUOTA_RECORD_SIZE];
        rec.write_into(&mut buf).expect("write");
        assert_eq!(QuotaRecord::parse_from_bytes(&buf).expect("parse"), rec);
        assert_eq!(&buf[0x60..0x80], &[0_u8; 0x20]);
    }

    #[test]
    fn take_usage_keeps_limits() {
        let mut on_disk = QuotaRecord::default();
        on_disk.online.file_hard = 50;
        on_disk.online.files = 99;
        let mut computed = QuotaRecord::default();
        computed.online.files = 2;
        assert!(!on_disk.usage_matches(&computed));
        on_disk.take_usage(&computed);
        assert!(on_disk.usage_matches(&computed));
        assert_eq!(on_disk.online.file_hard, 50);
    }
}
