#![forbid(unsafe_code)]
//! Directory block codec.
//!
//! Linear entry iteration over 4096-byte directory blocks, entry creation
//! and deletion with `reclen` splitting/coalescing, `.`/`..` management and
//! the folded FNV-1a name hash used when directory hashing is enabled.

use qfs_error::{QfsError, Result};
use qfs_types::{InodeId, read_le_u16, read_le_u32, read_u8, write_le_u16, write_le_u32};
use serde::{Deserialize, Serialize};

/// Directory entry header: `ino u32, gen u32, reclen u16, namlen u8,
/// ftype u8, hash u16, pad u16`.
pub const DIR_ENTRY_HEADER_LEN: usize = 16;

const OFF_INO: usize = 0;
const OFF_GEN: usize = 4;
const OFF_RECLEN: usize = 8;
const OFF_NAMLEN: usize = 10;
const OFF_FTYPE: usize = 11;
const OFF_HASH: usize = 12;

/// Entry file type code of a directory.
const FTYPE_DIR: u8 = 2;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Smallest `reclen` that holds a name of `name_len` bytes.
#[must_use]
pub fn required_rec_len(name_len: usize) -> usize {
    align4(DIR_ENTRY_HEADER_LEN + name_len)
}

fn corrupt(detail: impl Into<String>) -> QfsError {
    QfsError::Corruption {
        ordinal: 0,
        block: 0,
        detail: detail.into(),
    }
}

fn field<T>(res: std::result::Result<T, qfs_types::ParseError>) -> Result<T> {
    res.map_err(|e| corrupt(e.to_string()))
}

/// Folded 32-bit FNV-1a hash of an entry name.
#[must_use]
pub fn name_hash(name: &[u8]) -> u16 {
    let mut h: u32 = 0x811C_9DC5;
    for &b in name {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x0100_0193);
    }
    #[expect(clippy::cast_possible_truncation)]
    let folded = ((h >> 16) ^ (h & 0xFFFF)) as u16;
    folded
}

// ── Entries ─────────────────────────────────────────────────────────────────

/// One live entry of a directory block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Byte offset of the entry within its block.
    pub offset: usize,
    pub id: InodeId,
    pub rec_len: u16,
    /// Directory-entry file type code (see `FileType::dirent_code`).
    pub ftype: u8,
    pub hash: u16,
    pub name: Vec<u8>,
}

impl DirEntry {
    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }

    #[must_use]
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Raw slot walked by every block operation; free slots included.
struct Slot {
    offset: usize,
    end: usize,
    ino: u32,
    name_len: usize,
}

fn slots(block: &[u8]) -> Result<Vec<Slot>> {
    let mut out = Vec::new();
    let mut off = 0_usize;
    while off < block.len() {
        if off + DIR_ENTRY_HEADER_LEN > block.len() {
            return Err(corrupt(format!("truncated directory entry at offset {off}")));
        }
        let rec_len = usize::from(field(read_le_u16(block, off + OFF_RECLEN))?);
        if rec_len < DIR_ENTRY_HEADER_LEN || rec_len % 4 != 0 {
            return Err(corrupt(format!("invalid reclen {rec_len} at offset {off}")));
        }
        let end = off + rec_len;
        if end > block.len() {
            return Err(corrupt(format!("entry at offset {off} crosses the block end")));
        }
        let ino = field(read_le_u32(block, off + OFF_INO))?;
        let name_len = usize::from(field(read_u8(block, off + OFF_NAMLEN))?);
        if ino != 0 && (name_len == 0 || required_rec_len(name_len) > rec_len) {
            return Err(corrupt(format!("name length {name_len} invalid at offset {off}")));
        }
        out.push(Slot {
            offset: off,
            end,
            ino,
            name_len,
        });
        off = end;
    }
    Ok(out)
}

fn decode(block: &[u8], slot: &Slot) -> Result<DirEntry> {
    let off = slot.offset;
    let name_start = off + DIR_ENTRY_HEADER_LEN;
    Ok(DirEntry {
        offset: off,
        id: InodeId::new(slot.ino, field(read_le_u32(block, off + OFF_GEN))?),
        rec_len: field(read_le_u16(block, off + OFF_RECLEN))?,
        ftype: field(read_u8(block, off + OFF_FTYPE))?,
        hash: field(read_le_u16(block, off + OFF_HASH))?,
        name: block[name_start..name_start + slot.name_len].to_vec(),
    })
}

/// Every live entry of `block`, in on-disk order.
///
/// Fails when the entries do not tile the block exactly.
pub fn parse_dir_block(block: &[u8]) -> Result<Vec<DirEntry>> {
    slots(block)?
        .iter()
        .filter(|s| s.ino != 0)
        .map(|s| decode(block, s))
        .collect()
}

/// Look up a live entry by name.
pub fn find_entry(block: &[u8], name: &[u8]) -> Result<Option<DirEntry>> {
    Ok(parse_dir_block(block)?.into_iter().find(|e| e.name == name))
}

fn write_entry(
    block: &mut [u8],
    offset: usize,
    id: InodeId,
    rec_len: usize,
    ftype: u8,
    hash: u16,
    name: &[u8],
) -> Result<()> {
    let name_len =
        u8::try_from(name.len()).map_err(|_| QfsError::Format("entry name exceeds 255 bytes".into()))?;
    let rec_len_u16 =
        u16::try_from(rec_len).map_err(|_| QfsError::Format("entry reclen exceeds u16".into()))?;
    let end = offset + rec_len;
    if end > block.len() || rec_len < required_rec_len(name.len()) {
        return Err(corrupt("entry does not fit its slot"));
    }
    block[offset..end].fill(0);
    field(write_le_u32(block, offset + OFF_INO, id.ino.0))?;
    field(write_le_u32(block, offset + OFF_GEN, id.generation.0))?;
    field(write_le_u16(block, offset + OFF_RECLEN, rec_len_u16))?;
    block[offset + OFF_NAMLEN] = name_len;
    block[offset + OFF_FTYPE] = ftype;
    field(write_le_u16(block, offset + OFF_HASH, hash))?;
    block[offset + DIR_ENTRY_HEADER_LEN..offset + DIR_ENTRY_HEADER_LEN + name.len()]
        .copy_from_slice(name);
    Ok(())
}

// ── Block mutation ──────────────────────────────────────────────────────────

/// Add an entry to a single directory block.
///
/// Reuses a free slot when large enough, otherwise splits a live slot with
/// enough slack. Returns the entry's offset, or `NoSpace` when the block
/// is full.
pub fn add_entry(block: &mut [u8], id: InodeId, name: &[u8], ftype: u8, hash: u16) -> Result<usize> {
    if id.is_none() {
        return Err(QfsError::Format("directory entry inode cannot be zero".into()));
    }
    if name.is_empty() || name.len() > usize::from(u8::MAX) {
        return Err(QfsError::Format(format!(
            "directory entry name length {} out of range",
            name.len()
        )));
    }
    let need = required_rec_len(name.len());
    for slot in slots(block)? {
        let rec_len = slot.end - slot.offset;
        if slot.ino == 0 {
            if rec_len >= need {
                write_entry(block, slot.offset, id, rec_len, ftype, hash, name)?;
                return Ok(slot.offset);
            }
            continue;
        }
        let used = required_rec_len(slot.name_len);
        if rec_len - used >= need {
            let used_u16 = u16::try_from(used).map_err(|_| corrupt("reclen exceeds u16"))?;
            field(write_le_u16(block, slot.offset + OFF_RECLEN, used_u16))?;
            let new_off = slot.offset + used;
            write_entry(block, new_off, id, rec_len - used, ftype, hash, name)?;
            return Ok(new_off);
        }
    }
    Err(QfsError::NoSpace)
}

/// Remove the entry at `offset`. The slot is merged into the preceding
/// entry when there is one, otherwise it is marked free in place.
pub fn remove_entry_at(block: &mut [u8], offset: usize) -> Result<()> {
    let all = slots(block)?;
    let pos = all
        .iter()
        .position(|s| s.offset == offset)
        .ok_or_else(|| corrupt(format!("no entry at offset {offset}")))?;
    if pos > 0 {
        let prev = &all[pos - 1];
        let merged = u16::try_from(all[pos].end - prev.offset)
            .map_err(|_| corrupt("merged reclen exceeds u16"))?;
        field(write_le_u16(block, prev.offset + OFF_RECLEN, merged))?;
    }
    field(write_le_u32(block, offset + OFF_INO, 0))?;
    field(write_le_u32(block, offset + OFF_GEN, 0))?;
    block[offset + OFF_NAMLEN] = 0;
    block[offset + OFF_FTYPE] = 0;
    Ok(())
}

/// Remove a live entry by name. Returns whether one was found.
pub fn remove_entry(block: &mut [u8], name: &[u8]) -> Result<bool> {
    match find_entry(block, name)? {
        Some(entry) => {
            remove_entry_at(block, entry.offset)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Point the entry at `offset` to a different inode.
pub fn set_entry_target(block: &mut [u8], offset: usize, id: InodeId) -> Result<()> {
    field(write_le_u32(block, offset + OFF_INO, id.ino.0))?;
    field(write_le_u32(block, offset + OFF_GEN, id.generation.0))
}

pub fn set_entry_ftype(block: &mut [u8], offset: usize, ftype: u8) -> Result<()> {
    let slot = block
        .get_mut(offset + OFF_FTYPE)
        .ok_or_else(|| corrupt("ftype write out of bounds"))?;
    *slot = ftype;
    Ok(())
}

pub fn set_entry_hash(block: &mut [u8], offset: usize, hash: u16) -> Result<()> {
    field(write_le_u16(block, offset + OFF_HASH, hash))
}

/// A block holding a single free slot.
pub fn init_empty_block(block: &mut [u8]) -> Result<()> {
    block.fill(0);
    let len = u16::try_from(block.len()).map_err(|_| QfsError::Format("block too large".into()))?;
    field(write_le_u16(block, OFF_RECLEN, len))
}

/// First directory block: `.` then `..` spanning the rest.
pub fn init_dir_block(block: &mut [u8], self_id: InodeId, parent_id: InodeId, hashed: bool) -> Result<()> {
    let dot = required_rec_len(1);
    if block.len() < dot + required_rec_len(2) {
        return Err(QfsError::Format(
            "directory block too small for . and .. entries".into(),
        ));
    }
    block.fill(0);
    let hash = |name: &[u8]| if hashed { name_hash(name) } else { 0 };
    write_entry(block, 0, self_id, dot, FTYPE_DIR, hash(b"."), b".")?;
    write_entry(block, dot, parent_id, block.len() - dot, FTYPE_DIR, hash(b".."), b"..")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use qfs_types::DIR_BLK;

    const DIR: u8 = 2;
    const REG: u8 = 1;

    fn id(ino: u32) -> InodeId {
        InodeId::new(ino, 1)
    }

    #[test]
    fn init_dir_block_contains_dot_and_dotdot() {
        let mut block = vec![0_u8; DIR_BLK];
        init_dir_block(&mut block, id(11), id(2), false).expect("init");
        let entries = parse_dir_block(&block).expect("parse");
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dot());
        assert_eq!(entries[0].id, id(11));
        assert!(entries[1].is_dotdot());
        assert_eq!(entries[1].id, id(2));
        assert_eq!(usize::from(entries[1].rec_len), DIR_BLK - 20);
    }

    #[test]
    fn add_entry_splits_slack_and_reuses_free_slots() {
        let mut block = vec![0_u8; DIR_BLK];
        init_dir_block(&mut block, id(2), id(2), false).expect("init");
        let off = add_entry(&mut block, id(33), b"hello", REG, 0).expect("add");
        assert_eq!(off, 20 + 20);
        assert!(remove_entry(&mut block, b"hello").expect("remove"));
        assert!(find_entry(&block, b"hello").expect("find").is_none());
        let again = add_entry(&mut block, id(34), b"world", REG, 0).expect("add");
        assert_eq!(again, off);
    }

    #[test]
    fn full_block_reports_no_space() {
        let mut block = vec![0_u8; 64];
        init_dir_block(&mut block, id(2), id(2), false).expect("init");
        add_entry(&mut block, id(5), b"abcd", REG, 0).expect("first fits");
        let err = add_entry(&mut block, id(6), b"efgh", REG, 0).expect_err("full");
        assert!(matches!(err, QfsError::NoSpace));
    }

    #[test]
    fn remove_first_slot_marks_free() {
        let mut block = vec![0_u8; DIR_BLK];
        init_empty_block(&mut block).expect("empty");
        let off = add_entry(&mut block, id(9), b"only", REG, 0).expect("add");
        assert_eq!(off, 0);
        remove_entry_at(&mut block, 0).expect("remove");
        assert!(parse_dir_block(&block).expect("parse").is_empty());
    }

    #[test]
    fn corrupt_tiling_rejected() {
        let mut block = vec![0_u8; DIR_BLK];
        init_dir_block(&mut block, id(2), id(2), false).expect("init");
        block[OFF_RECLEN + 20] = 0x13;
        assert!(parse_dir_block(&block).is_err());

        let zero = vec![0_u8; DIR_BLK];
        assert!(parse_dir_block(&zero).is_err());
    }

    #[test]
    fn entry_updates_in_place() {
        let mut block = vec![0_u8; DIR_BLK];
        init_dir_block(&mut block, id(40), id(2), false).expect("init");
        let dotdot = find_entry(&block, b"..").expect("find").expect("present");
        set_entry_target(&mut block, dotdot.offset, id(7)).expect("target");
        set_entry_ftype(&mut block, dotdot.offset, DIR).expect("ftype");
        set_entry_hash(&mut block, dotdot.offset, name_hash(b"..")).expect("hash");
        let back = find_entry(&block, b"..").expect("find").expect("present");
        assert_eq!(back.id, id(7));
        assert_eq!(back.hash, name_hash(b".."));
    }

    #[test]
    fn hash_is_stable_and_spreads() {
        assert_eq!(name_hash(b"lost+found"), name_hash(b"lost+found"));
        assert_ne!(name_hash(b"a"), name_hash(b"b"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn added_entries_are_all_found(count in 1_usize..60) {
            let mut block = vec![0_u8; DIR_BLK];
            init_dir_block(&mut block, id(2), id(2), true).expect("init");
            for n in 0..count {
                let name = format!("file{n}");
                let ino = u32::try_from(n).expect("small") + 100;
                add_entry(&mut block, id(ino), name.as_bytes(), REG, name_hash(name.as_bytes()))
                    .expect("add");
            }
            let entries = parse_dir_block(&block).expect("parse");
            prop_assert_eq!(entries.len(), count + 2);
            for e in entries {
                prop_assert_eq!(e.hash, name_hash(&e.name));
            }
        }
    }
}
