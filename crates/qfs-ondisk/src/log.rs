use qfs_types::{
    DEV_BSIZE, ParseError, ensure_slice, read_le_u32, read_le_u64, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const LOG_MAGIC: u32 = 0x514C_4F47;
pub const LOG_VERSION: u32 = 1;

/// Write-ahead log header (first device block of the log region).
///
/// `head` and `tail` are device-block offsets into the log; records
/// occupy `1..len`, block 0 is the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    pub version: u32,
    pub fs_id: u32,
    pub len: u32,
    pub head: u32,
    pub tail: u32,
    pub seq: u64,
}

impl LogHeader {
    /// An empty log of `len` blocks.
    #[must_use]
    pub fn empty(fs_id: u32, len: u32) -> Self {
        Self {
            version: LOG_VERSION,
            fs_id,
            len,
            head: 1,
            tail: 1,
            seq: 0,
        }
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, 0x20)?;
        let magic = read_le_u32(bytes, 0x00)?;
        if magic != LOG_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(LOG_MAGIC),
                actual: u64::from(magic),
            });
        }
        let header = Self {
            version: read_le_u32(bytes, 0x04)?,
            fs_id: read_le_u32(bytes, 0x08)?,
            len: read_le_u32(bytes, 0x0C)?,
            head: read_le_u32(bytes, 0x10)?,
            tail: read_le_u32(bytes, 0x14)?,
            seq: read_le_u64(bytes, 0x18)?,
        };
        if header.version != LOG_VERSION {
            return Err(ParseError::InvalidField {
                field: "log_version",
                reason: "unsupported log version",
            });
        }
        Ok(header)
    }

    /// Serialize into one device block.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut block = vec![0_u8; DEV_BSIZE as usize];
        write_le_u32(&mut block, 0x00, LOG_MAGIC)?;
        write_le_u32(&mut block, 0x04, self.version)?;
        write_le_u32(&mut block, 0x08, self.fs_id)?;
        write_le_u32(&mut block, 0x0C, self.len)?;
        write_le_u32(&mut block, 0x10, self.head)?;
        write_le_u32(&mut block, 0x14, self.tail)?;
        write_le_u64(&mut block, 0x18, self.seq)?;
        Ok(block)
    }

    /// Check the header against the superblock that points at it.
    pub fn validate(&self, fs_id: u32, log_len: u32) -> Result<(), ParseError> {
        if self.fs_id != fs_id {
            return Err(ParseError::InvalidField {
                field: "log_fs_id",
                reason: "log belongs to another filesystem",
            });
        }
        if self.len != log_len {
            return Err(ParseError::InvalidField {
                field: "log_len",
                reason: "disagrees with superblock",
            });
        }
        let in_range = |pos: u32| pos >= 1 && pos < self.len;
        if !in_range(self.head) || !in_range(self.tail) {
            return Err(ParseError::InvalidField {
                field: "log_head/log_tail",
                reason: "outside log region",
            });
        }
        Ok(())
    }

    /// Whether unapplied records remain.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.head != self.tail
    }

    /// Discard unapplied records.
    pub fn reset(&mut self) {
        self.head = 1;
        self.tail = 1;
        self.seq = self.seq.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_and_validates() {
        let mut header = LogHeader::empty(0xFEED, 64);
        header.head = 10;
        header.tail = 4;
        let bytes = header.to_bytes().expect("serialize");
        let parsed = LogHeader::parse_from_bytes(&bytes).expect("parse");
        assert_eq!(parsed, header);
        parsed.validate(0xFEED, 64).expect("valid");
        assert!(parsed.is_dirty());
    }

    #[test]
    fn validate_rejects_mismatches() {
        let header = LogHeader::empty(1, 64);
        assert!(header.validate(2, 64).is_err());
        assert!(header.validate(1, 32).is_err());
        let mut header = LogHeader::empty(1, 64);
        header.head = 64;
        assert!(header.validate(1, 64).is_err());
    }

    #[test]
    fn reset_makes_clean() {
        let mut header = LogHeader::empty(1, 64);
        header.head = 7;
        header.reset();
        assert!(!header.is_dirty());
        assert_eq!(header.seq, 1);
    }

    #[test]
    fn bad_magic_rejected() {
        assert!(matches!(
            LogHeader::parse_from_bytes(&[0_u8; 1024]),
            Err(ParseError::InvalidMagic { .. })
        ));
    }
}
