//! Per-inode bookkeeping carried between the passes.

use qfs_ondisk::{ExtensionKind, Inode, InodeStatus};
use qfs_types::InodeId;

/// What a live slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InodeKind {
    RegularFile,
    Directory,
    SegmentIndex,
    SegmentMember,
    Extension(ExtensionKind),
    /// Removable-media stub.
    Object,
}

impl InodeKind {
    pub(crate) fn classify(inode: &Inode) -> Self {
        if inode.is_dir() {
            Self::Directory
        } else if inode.status.contains(InodeStatus::SEG_INDEX) {
            Self::SegmentIndex
        } else if inode.status.contains(InodeStatus::SEG_MEMBER) {
            Self::SegmentMember
        } else if inode.status.contains(InodeStatus::REMEDIA) {
            Self::Object
        } else {
            Self::RegularFile
        }
    }

    /// Whether directory entries may name this kind.
    pub(crate) fn is_nameable(self) -> bool {
        !matches!(self, Self::SegmentMember | Self::Extension(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InodeState {
    Free,
    Live,
    /// Failed pass-1 validation.
    Invalid,
    /// Released by this run.
    Freed,
    /// Kept with its data marked lost.
    Damaged,
}

/// Problem codes that steer later passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct InodeFlags(u16);

impl InodeFlags {
    pub(crate) const IO_ERROR: Self = Self(0x001);
    pub(crate) const DUPLICATE: Self = Self(0x002);
    pub(crate) const DUP_LOSER: Self = Self(0x004);
    pub(crate) const BAD_DOT: Self = Self(0x008);
    pub(crate) const SEG_PROBLEM: Self = Self(0x010);
    /// Orphan left where it is.
    pub(crate) const UNRESOLVED: Self = Self(0x020);
    /// `..` must follow a parent change.
    pub(crate) const REPARENTED: Self = Self(0x040);
    /// Parent change simulated by a check-only run.
    pub(crate) const SIMULATED: Self = Self(0x080);

    pub(crate) fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub(crate) fn insert(&mut self, flag: Self) {
        self.0 |= flag.0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InodeRecord {
    pub id: InodeId,
    pub kind: Option<InodeKind>,
    pub state: InodeState,
    /// Parent directory, segment index or extension base.
    pub parent: InodeId,
    /// Extension chain head, or the next link for extension slots.
    pub ext: InodeId,
    pub seg_ord: u32,
    pub ftype: u8,
    pub archived: bool,
    pub blocks_seen: u64,
    pub named_refs: u32,
    pub subdirs: u32,
    /// Named by its recorded parent (or index, or chain).
    pub proven: bool,
    pub flags: InodeFlags,
    alt: Option<usize>,
}

impl InodeRecord {
    pub(crate) fn free(id: InodeId) -> Self {
        Self {
            id,
            kind: None,
            state: InodeState::Free,
            parent: InodeId::NONE,
            ext: InodeId::NONE,
            seg_ord: 0,
            ftype: 0,
            archived: false,
            blocks_seen: 0,
            named_refs: 0,
            subdirs: 0,
            proven: false,
            flags: InodeFlags::default(),
            alt: None,
        }
    }

    pub(crate) fn live(inode: &Inode) -> Self {
        Self {
            kind: Some(InodeKind::classify(inode)),
            state: InodeState::Live,
            parent: inode.parent,
            ext: inode.ext,
            seg_ord: inode.seg_ord,
            ftype: inode.file_type().dirent_code(),
            archived: inode.has_archive_copy(),
            ..Self::free(inode.id)
        }
    }

    pub(crate) fn in_use(&self) -> bool {
        matches!(self.state, InodeState::Live | InodeState::Damaged)
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.kind == Some(InodeKind::Directory)
    }

    pub(crate) fn is_extension(&self) -> bool {
        matches!(self.kind, Some(InodeKind::Extension(_)))
    }

    /// Slot a later allocation may reuse.
    pub(crate) fn is_vacant(&self) -> bool {
        matches!(self.state, InodeState::Free | InodeState::Freed)
    }
}

/// Records indexed by inode number, plus a shared pool of alternate
/// parents for multiply-named inodes.
#[derive(Debug)]
pub(crate) struct InodeLedger {
    records: Vec<InodeRecord>,
    alt_pool: Vec<Vec<InodeId>>,
}

impl InodeLedger {
    pub(crate) fn new(count: u32) -> Self {
        let records = (0..=count)
            .map(|ino| InodeRecord::free(InodeId::new(ino, 0)))
            .collect();
        Self {
            records,
            alt_pool: Vec::new(),
        }
    }

    pub(crate) fn count(&self) -> u32 {
        u32::try_from(self.records.len() - 1).unwrap_or(u32::MAX)
    }

    pub(crate) fn get(&self, ino: u32) -> Option<&InodeRecord> {
        if ino == 0 {
            return None;
        }
        self.records.get(usize::try_from(ino).ok()?)
    }

    pub(crate) fn get_mut(&mut self, ino: u32) -> Option<&mut InodeRecord> {
        if ino == 0 {
            return None;
        }
        self.records.get_mut(usize::try_from(ino).ok()?)
    }

    pub(crate) fn set(&mut self, ino: u32, record: InodeRecord) {
        if let Some(slot) = self.get_mut(ino) {
            *slot = record;
        }
    }

    pub(crate) fn inodes(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.count()
    }

    /// Record lookup that also checks the generation.
    pub(crate) fn resolve(&self, id: InodeId) -> Option<&InodeRecord> {
        self.get(id.ino.0).filter(|r| r.id == id)
    }

    pub(crate) fn is_live_dir(&self, id: InodeId) -> bool {
        self.resolve(id).is_some_and(|r| r.in_use() && r.is_dir())
    }

    pub(crate) fn add_alt_parent(&mut self, ino: u32, dir: InodeId) {
        let Some(record) = usize::try_from(ino)
            .ok()
            .filter(|i| *i != 0)
            .and_then(|i| self.records.get_mut(i))
        else {
            return;
        };
        match record.alt {
            Some(idx) => {
                let list = &mut self.alt_pool[idx];
                if !list.contains(&dir) {
                    list.push(dir);
                }
            }
            None => {
                record.alt = Some(self.alt_pool.len());
                self.alt_pool.push(vec![dir]);
            }
        }
    }

    pub(crate) fn remove_alt_parent(&mut self, ino: u32, dir: InodeId) {
        if let Some(idx) = self.get(ino).and_then(|r| r.alt) {
            self.alt_pool[idx].retain(|d| *d != dir);
        }
    }

    pub(crate) fn alt_parents(&self, ino: u32) -> &[InodeId] {
        self.get(ino)
            .and_then(|r| r.alt)
            .map_or(&[], |idx| self.alt_pool[idx].as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfs_types::S_IFDIR;

    #[test]
    fn records_are_indexed_by_inode_number() {
        let mut ledger = InodeLedger::new(8);
        assert_eq!(ledger.count(), 8);
        assert!(ledger.get(0).is_none());
        assert!(ledger.get(9).is_none());
        let mut dir = Inode::free(InodeId::new(6, 3));
        dir.mode = S_IFDIR | 0o755;
        dir.nlink = 2;
        ledger.set(6, InodeRecord::live(&dir));
        assert!(ledger.is_live_dir(InodeId::new(6, 3)));
        assert!(!ledger.is_live_dir(InodeId::new(6, 4)));
        assert_eq!(ledger.get(6).map(|r| r.ftype), Some(2));
        assert_eq!(ledger.inodes().count(), 8);
    }

    #[test]
    fn alternate_parents_share_one_pool() {
        let mut ledger = InodeLedger::new(8);
        let a = InodeId::new(5, 1);
        let b = InodeId::new(6, 1);
        ledger.add_alt_parent(7, a);
        ledger.add_alt_parent(7, b);
        ledger.add_alt_parent(7, a);
        ledger.add_alt_parent(8, b);
        assert_eq!(ledger.alt_parents(7), &[a, b]);
        assert_eq!(ledger.alt_parents(8), &[b]);
        ledger.remove_alt_parent(7, a);
        assert_eq!(ledger.alt_parents(7), &[b]);
        assert!(ledger.alt_parents(3).is_empty());
    }

    #[test]
    fn flags_accumulate() {
        let mut flags = InodeFlags::default();
        flags.insert(InodeFlags::BAD_DOT);
        flags.insert(InodeFlags::IO_ERROR);
        assert!(flags.contains(InodeFlags::BAD_DOT));
        assert!(!flags.contains(InodeFlags::DUPLICATE));
    }
}
