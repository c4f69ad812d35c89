//! Ledger of device blocks claimed by more than one inode.
//!
//! Entries are keyed by the large-DAU-aligned block they fall in and carry
//! a mask of the sub-units claimed so far plus up to four owners; further
//! owners spill into chained overflow records. Records are appended to a
//! scratch region terminated by a sentinel record, so the ledger scales
//! with the damage rather than with memory. An in-memory index maps each
//! key to its first record.

use qfs_block::ScratchRegion;
use qfs_error::{QfsError, Result};
use qfs_ondisk::DeviceClass;
use qfs_types::{Ordinal, read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::trace;

const RECORD_SIZE: u64 = 48;
const OWNERS_PER_RECORD: usize = 4;
const SENTINEL_ORD: u16 = u16::MAX;
const NO_NEXT: u32 = u32::MAX;
const INITIAL_RECORDS: u64 = 64;

/// Large-DAU-aligned block on one ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct DupKey {
    pub ord: Ordinal,
    pub block: u64,
}

/// A validated claim: `len` device blocks at `block` on a bitmap-owning
/// ordinal whose bitmap granule is `unit` and large DAU `large`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClaimSpan {
    pub ord: Ordinal,
    pub class: DeviceClass,
    pub block: u64,
    pub len: u64,
    pub unit: u64,
    pub large: u64,
}

impl ClaimSpan {
    /// Granule one mask bit stands for.
    fn granule(&self) -> u64 {
        self.unit.max(self.large.div_ceil(64)).max(1)
    }

    /// Keys the span touches with the sub-unit mask inside each.
    fn pieces(&self) -> Vec<(DupKey, u64)> {
        let large = self.large.max(1);
        let granule = self.granule();
        let end = self.block.saturating_add(self.len.max(1));
        let mut out = Vec::new();
        let mut key = self.block - self.block % large;
        while key < end {
            let lo = self.block.max(key) - key;
            let hi = end.min(key + large) - key;
            let mut mask = 0_u64;
            let mut g = lo / granule;
            while g * granule < hi && g < 64 {
                mask |= 1 << g;
                g += 1;
            }
            out.push((
                DupKey {
                    ord: self.ord,
                    block: key,
                },
                mask,
            ));
            key += large;
        }
        out
    }

    fn size_class(&self) -> u8 {
        u8::from(self.len >= self.large)
    }
}

/// Owners of one key, merged across its overflow records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DupEntry {
    pub key: DupKey,
    pub class: DeviceClass,
    pub mask: u64,
    /// Ascending inode numbers.
    pub owners: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DupRecord {
    ord: u16,
    class: u8,
    size_class: u8,
    count: u8,
    block: u64,
    mask: u64,
    owners: [u32; OWNERS_PER_RECORD],
    next: u32,
}

impl DupRecord {
    fn sentinel() -> Self {
        Self {
            ord: SENTINEL_ORD,
            class: 0,
            size_class: 0,
            count: 0,
            block: 0,
            mask: 0,
            owners: [0; OWNERS_PER_RECORD],
            next: NO_NEXT,
        }
    }

    fn owners(&self) -> &[u32] {
        &self.owners[..usize::from(self.count)]
    }

    fn encode(&self) -> Result<[u8; RECORD_SIZE as usize]> {
        let mut buf = [0_u8; RECORD_SIZE as usize];
        let err = |e: qfs_types::ParseError| QfsError::Format(e.to_string());
        write_le_u16(&mut buf, 0, self.ord).map_err(err)?;
        buf[2] = self.class;
        buf[3] = self.size_class;
        buf[4] = self.count;
        write_le_u64(&mut buf, 8, self.block).map_err(err)?;
        write_le_u64(&mut buf, 16, self.mask).map_err(err)?;
        for (i, owner) in self.owners.iter().enumerate() {
            write_le_u32(&mut buf, 24 + 4 * i, *owner).map_err(err)?;
        }
        write_le_u32(&mut buf, 40, self.next).map_err(err)?;
        Ok(buf)
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let err = |e: qfs_types::ParseError| QfsError::Format(e.to_string());
        let mut owners = [0_u32; OWNERS_PER_RECORD];
        for (i, owner) in owners.iter_mut().enumerate() {
            *owner = read_le_u32(buf, 24 + 4 * i).map_err(err)?;
        }
        let count = buf[4];
        if usize::from(count) > OWNERS_PER_RECORD {
            return Err(QfsError::Format(format!(
                "duplicate ledger record holds {count} owners"
            )));
        }
        Ok(Self {
            ord: read_le_u16(buf, 0).map_err(err)?,
            class: buf[2],
            size_class: buf[3],
            count,
            block: read_le_u64(buf, 8).map_err(err)?,
            mask: read_le_u64(buf, 16).map_err(err)?,
            owners,
            next: read_le_u32(buf, 40).map_err(err)?,
        })
    }
}

fn class_code(class: DeviceClass) -> u8 {
    match class {
        DeviceClass::Data => 0,
        DeviceClass::Meta => 1,
    }
}

fn class_from_code(code: u8) -> DeviceClass {
    if code == 1 {
        DeviceClass::Meta
    } else {
        DeviceClass::Data
    }
}

#[derive(Debug)]
pub(crate) struct DupLedger {
    region: ScratchRegion,
    records: u32,
    index: HashMap<DupKey, u32>,
}

impl DupLedger {
    pub(crate) fn new(scratch_dir: Option<&Path>) -> Result<Self> {
        let region = ScratchRegion::create(scratch_dir, INITIAL_RECORDS * RECORD_SIZE)?;
        let mut ledger = Self {
            region,
            records: 0,
            index: HashMap::new(),
        };
        ledger.write_record(0, &DupRecord::sentinel())?;
        Ok(ledger)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub(crate) fn key_count(&self) -> usize {
        self.index.len()
    }

    fn read_record(&mut self, idx: u32) -> Result<DupRecord> {
        let mut buf = [0_u8; RECORD_SIZE as usize];
        self.region
            .read_at(u64::from(idx) * RECORD_SIZE, &mut buf)?;
        DupRecord::decode(&buf)
    }

    fn write_record(&mut self, idx: u32, record: &DupRecord) -> Result<()> {
        let end = (u64::from(idx) + 1) * RECORD_SIZE;
        if end > self.region.len() {
            self.region.grow(end.max(self.region.len() * 2))?;
        }
        let bytes = record.encode()?;
        self.region.write_at(u64::from(idx) * RECORD_SIZE, &bytes)
    }

    /// Append `record`, moving the sentinel behind it.
    fn append(&mut self, record: &DupRecord) -> Result<u32> {
        let idx = self.records;
        let next = idx.checked_add(1).ok_or(QfsError::NoSpace)?;
        self.write_record(next, &DupRecord::sentinel())?;
        self.write_record(idx, record)?;
        self.records = next;
        Ok(idx)
    }

    /// Indices of a key's record chain.
    fn chain(&mut self, head: u32) -> Result<Vec<(u32, DupRecord)>> {
        let mut out = Vec::new();
        let mut idx = head;
        while idx != NO_NEXT && idx < self.records {
            let record = self.read_record(idx)?;
            let next = record.next;
            out.push((idx, record));
            idx = next;
        }
        Ok(out)
    }

    /// Add `ino` as an owner of every key `span` touches, creating entries
    /// as needed.
    pub(crate) fn record_claim(&mut self, ino: u32, span: &ClaimSpan) -> Result<()> {
        for (key, mask) in span.pieces() {
            let Some(&head) = self.index.get(&key) else {
                let mut owners = [0_u32; OWNERS_PER_RECORD];
                owners[0] = ino;
                let idx = self.append(&DupRecord {
                    ord: key.ord.0,
                    class: class_code(span.class),
                    size_class: span.size_class(),
                    count: 1,
                    block: key.block,
                    mask,
                    owners,
                    next: NO_NEXT,
                })?;
                self.index.insert(key, idx);
                trace!(ord = %key.ord, block = key.block, ino, "duplicate entry created");
                continue;
            };
            let mut chain = self.chain(head)?;
            if chain[0].1.mask | mask != chain[0].1.mask {
                chain[0].1.mask |= mask;
                self.write_record(chain[0].0, &chain[0].1)?;
            }
            if chain.iter().any(|(_, r)| r.owners().contains(&ino)) {
                continue;
            }
            if let Some((idx, mut rec)) = chain
                .iter()
                .find(|(_, r)| usize::from(r.count) < OWNERS_PER_RECORD)
                .cloned()
            {
                rec.owners[usize::from(rec.count)] = ino;
                rec.count += 1;
                self.write_record(idx, &rec)?;
            } else {
                let mut owners = [0_u32; OWNERS_PER_RECORD];
                owners[0] = ino;
                let new_idx = self.append(&DupRecord {
                    ord: key.ord.0,
                    class: class_code(span.class),
                    size_class: span.size_class(),
                    count: 1,
                    block: key.block,
                    mask: 0,
                    owners,
                    next: NO_NEXT,
                })?;
                if let Some((tail_idx, mut tail)) = chain.last().cloned() {
                    tail.next = new_idx;
                    self.write_record(tail_idx, &tail)?;
                }
            }
            trace!(ord = %key.ord, block = key.block, ino, "duplicate owner added");
        }
        Ok(())
    }

    /// Whether any key `span` touches has a claimed sub-unit in common with
    /// it.
    pub(crate) fn overlaps(&mut self, span: &ClaimSpan) -> Result<bool> {
        for (key, mask) in span.pieces() {
            if let Some(&head) = self.index.get(&key) {
                let record = self.read_record(head)?;
                if record.mask & mask != 0 {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Drop `ino` from the owners of every key `span` touches. Returns the
    /// owners left across those keys, or `None` when no key is tracked.
    /// Keys left without owners are cleared.
    pub(crate) fn release_claim(&mut self, ino: u32, span: &ClaimSpan) -> Result<Option<usize>> {
        let mut tracked = false;
        let mut remaining = 0_usize;
        for (key, _) in span.pieces() {
            let Some(&head) = self.index.get(&key) else {
                continue;
            };
            tracked = true;
            let chain = self.chain(head)?;
            for (idx, mut rec) in chain.iter().cloned() {
                if let Some(pos) = rec.owners().iter().position(|o| *o == ino) {
                    let last = usize::from(rec.count) - 1;
                    rec.owners.swap(pos, last);
                    rec.owners[last] = 0;
                    rec.count -= 1;
                    self.write_record(idx, &rec)?;
                }
            }
            let left: usize = self
                .chain(head)?
                .iter()
                .map(|(_, r)| usize::from(r.count))
                .sum();
            if left == 0 {
                let mut cleared = self.read_record(head)?;
                cleared.mask = 0;
                self.write_record(head, &cleared)?;
                self.index.remove(&key);
                trace!(ord = %key.ord, block = key.block, "duplicate entry cleared");
            }
            remaining += left;
        }
        Ok(tracked.then_some(remaining))
    }

    /// Every live entry, scanning records up to the sentinel.
    pub(crate) fn entries(&mut self) -> Result<Vec<DupEntry>> {
        let mut merged: BTreeMap<DupKey, DupEntry> = BTreeMap::new();
        let mut idx = 0_u32;
        loop {
            let record = self.read_record(idx)?;
            if record.ord == SENTINEL_ORD {
                break;
            }
            idx += 1;
            let key = DupKey {
                ord: Ordinal(record.ord),
                block: record.block,
            };
            if !self.index.contains_key(&key) {
                continue;
            }
            let entry = merged.entry(key).or_insert_with(|| DupEntry {
                key,
                class: class_from_code(record.class),
                mask: 0,
                owners: Vec::new(),
            });
            entry.mask |= record.mask;
            entry.owners.extend_from_slice(record.owners());
        }
        Ok(merged
            .into_values()
            .map(|mut e| {
                e.owners.sort_unstable();
                e.owners.dedup();
                e
            })
            .filter(|e| !e.owners.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn span(block: u64, len: u64) -> ClaimSpan {
        ClaimSpan {
            ord: Ordinal(1),
            class: DeviceClass::Data,
            block,
            len,
            unit: 4,
            large: 16,
        }
    }

    #[test]
    fn second_claimant_creates_entry_and_confirm_adds_first() {
        let mut dups = DupLedger::new(None).expect("ledger");
        assert!(dups.is_empty());
        dups.record_claim(9, &span(64, 16)).expect("claim");
        assert!(dups.overlaps(&span(64, 16)).expect("overlap"));
        assert!(dups.overlaps(&span(68, 4)).expect("overlap"));
        assert!(!dups.overlaps(&span(80, 16)).expect("overlap"));
        dups.record_claim(7, &span(64, 16)).expect("claim");
        dups.record_claim(7, &span(64, 16)).expect("claim again");
        let entries = dups.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].owners, vec![7, 9]);
        assert_eq!(entries[0].key.block, 64);
        assert_eq!(dups.key_count(), 1);
    }

    #[test]
    fn small_claims_only_mark_their_sub_units() {
        let mut dups = DupLedger::new(None).expect("ledger");
        dups.record_claim(5, &span(68, 4)).expect("claim");
        assert!(!dups.overlaps(&span(64, 4)).expect("overlap"));
        assert!(dups.overlaps(&span(64, 16)).expect("overlap"));
        let entries = dups.entries().expect("entries");
        assert_eq!(entries[0].mask, 0b10);
    }

    #[test]
    fn owners_overflow_into_chained_records() {
        let mut dups = DupLedger::new(None).expect("ledger");
        for ino in 10..20 {
            dups.record_claim(ino, &span(32, 16)).expect("claim");
        }
        let entries = dups.entries().expect("entries");
        assert_eq!(entries[0].owners, (10..20).collect::<Vec<_>>());
        assert_eq!(dups.release_claim(15, &span(32, 16)).expect("release"), Some(9));
        let entries = dups.entries().expect("entries");
        assert!(!entries[0].owners.contains(&15));
    }

    #[test]
    fn releasing_every_owner_clears_the_entry() {
        let mut dups = DupLedger::new(None).expect("ledger");
        dups.record_claim(5, &span(64, 16)).expect("claim");
        dups.record_claim(6, &span(64, 16)).expect("claim");
        assert_eq!(dups.release_claim(6, &span(64, 16)).expect("release"), Some(1));
        assert_eq!(dups.release_claim(5, &span(64, 16)).expect("release"), Some(0));
        assert!(dups.is_empty());
        assert!(dups.entries().expect("entries").is_empty());
        assert_eq!(dups.release_claim(5, &span(64, 16)).expect("release"), None);
    }

    #[test]
    fn many_keys_grow_the_region() {
        let mut dups = DupLedger::new(None).expect("ledger");
        for key in 0..200_u64 {
            dups.record_claim(3, &span(key * 16, 16)).expect("claim");
        }
        assert_eq!(dups.entries().expect("entries").len(), 200);
    }

    proptest! {
        #[test]
        fn ledger_matches_a_set_model(
            claims in proptest::collection::vec((1_u32..12, 0_u64..8), 1..60),
            releases in proptest::collection::vec((1_u32..12, 0_u64..8), 0..30),
        ) {
            let mut dups = DupLedger::new(None).expect("ledger");
            let mut model: BTreeMap<u64, BTreeSet<u32>> = BTreeMap::new();
            for (ino, key) in &claims {
                dups.record_claim(*ino, &span(key * 16, 16)).expect("claim");
                model.entry(key * 16).or_default().insert(*ino);
            }
            for (ino, key) in &releases {
                let left = dups.release_claim(*ino, &span(key * 16, 16)).expect("release");
                match model.get_mut(&(key * 16)) {
                    Some(owners) => {
                        owners.remove(ino);
                        prop_assert_eq!(left, Some(owners.len()));
                        if owners.is_empty() {
                            model.remove(&(key * 16));
                        }
                    }
                    None => prop_assert_eq!(left, None),
                }
            }
            let entries = dups.entries().expect("entries");
            prop_assert_eq!(entries.len(), model.len());
            for entry in entries {
                let want: Vec<u32> = model[&entry.key.block].iter().copied().collect();
                prop_assert_eq!(entry.owners, want);
            }
        }
    }
}
