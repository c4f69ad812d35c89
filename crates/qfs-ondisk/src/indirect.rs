use crate::inode::ExtentPtr;
use qfs_types::{
    InodeId, Ordinal, ParseError, ensure_slice, read_le_u16, read_le_u32, write_bytes,
    write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

pub const INDIRECT_HEADER_SIZE: usize = 16;
pub const INDIRECT_ENTRY_SIZE: usize = 8;

/// Entries per indirect block of `block_size` bytes.
#[must_use]
pub fn branching_factor(block_size: u32) -> u64 {
    (u64::from(block_size).saturating_sub(INDIRECT_HEADER_SIZE as u64))
        / INDIRECT_ENTRY_SIZE as u64
}

/// Validation header: the inode that owns the block and its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectHeader {
    pub owner: InodeId,
    pub level: u32,
}

impl IndirectHeader {
    /// Whether this block belongs where the traversal found it.
    #[must_use]
    pub fn matches(&self, owner: InodeId, level: u32) -> bool {
        self.owner == owner && self.level == level
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectBlock {
    pub header: IndirectHeader,
    pub entries: Vec<ExtentPtr>,
}

impl IndirectBlock {
    #[must_use]
    pub fn new(owner: InodeId, level: u32, block_size: u32) -> Self {
        let count = usize::try_from(branching_factor(block_size)).unwrap_or(0);
        Self {
            header: IndirectHeader { owner, level },
            entries: vec![ExtentPtr::HOLE; count],
        }
    }

    /// Parse a whole indirect block; the entry count follows the buffer
    /// length.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INDIRECT_HEADER_SIZE)?;
        let header = IndirectHeader {
            owner: InodeId::new(read_le_u32(bytes, 0)?, read_le_u32(bytes, 4)?),
            level: read_le_u32(bytes, 8)?,
        };
        let count = (bytes.len() - INDIRECT_HEADER_SIZE) / INDIRECT_ENTRY_SIZE;
        let entries = (0..count)
            .map(|i| {
                let off = INDIRECT_HEADER_SIZE + i * INDIRECT_ENTRY_SIZE;
                Ok(ExtentPtr {
                    block: read_le_u32(bytes, off)?,
                    ord: Ordinal(read_le_u16(bytes, off + 4)?),
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Self { header, entries })
    }

    pub fn write_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        let needed = INDIRECT_HEADER_SIZE + self.entries.len() * INDIRECT_ENTRY_SIZE;
        ensure_slice(bytes, 0, needed)?;
        bytes.fill(0);
        write_le_u32(bytes, 0, self.header.owner.ino.0)?;
        write_le_u32(bytes, 4, self.header.owner.generation.0)?;
        write_le_u32(bytes, 8, self.header.level)?;
        for (i, entry) in self.entries.iter().enumerate() {
            let off = INDIRECT_HEADER_SIZE + i * INDIRECT_ENTRY_SIZE;
            write_le_u32(bytes, off, entry.block)?;
            write_le_u16(bytes, off + 4, entry.ord.0)?;
        }
        Ok(())
    }

    /// Zero the entry at `index` inside a raw block buffer without
    /// reparsing it.
    pub fn clear_entry_in_place(bytes: &mut [u8], index: usize) -> Result<(), ParseError> {
        let off = INDIRECT_HEADER_SIZE + index * INDIRECT_ENTRY_SIZE;
        write_bytes(bytes, off, &[0_u8; INDIRECT_ENTRY_SIZE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branching_factor_for_common_sizes() {
        assert_eq!(branching_factor(16384), 2046);
        assert_eq!(branching_factor(4096), 510);
    }

    #[test]
    fn indirect_round_trips() {
        let mut block = IndirectBlock::new(InodeId::new(9, 2), 1, 4096);
        block.entries[0] = ExtentPtr::new(1000, 1);
        block.entries[509] = ExtentPtr::new(2000, 0);
        let mut buf = vec![0xFF_u8; 4096];
        block.write_into(&mut buf).expect("write");
        let parsed = IndirectBlock::parse_from_bytes(&buf).expect("parse");
        assert_eq!(parsed, block);
        assert!(parsed.header.matches(InodeId::new(9, 2), 1));
        assert!(!parsed.header.matches(InodeId::new(9, 3), 1));
        assert!(!parsed.header.matches(InodeId::new(9, 2), 2));
    }

    #[test]
    fn clear_entry_in_place_zeroes_one_slot() {
        let mut block = IndirectBlock::new(InodeId::new(9, 2), 1, 4096);
        block.entries[3] = ExtentPtr::new(77, 1);
        block.entries[4] = ExtentPtr::new(78, 1);
        let mut buf = vec![0_u8; 4096];
        block.write_into(&mut buf).expect("write");
        IndirectBlock::clear_entry_in_place(&mut buf, 3).expect("clear");
        let parsed = IndirectBlock::parse_from_bytes(&buf).expect("parse");
        assert!(parsed.entries[3].is_hole());
        assert_eq!(parsed.entries[4], ExtentPtr::new(78, 1));
    }
}
