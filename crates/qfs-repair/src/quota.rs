//! Quota usage recomputed from the inodes and reconciled with the quota
//! files in the root directory.

use crate::context::FsckContext;
use crate::file;
use crate::report::ProblemKind;
use qfs_error::{QfsError, Result};
use qfs_ondisk::quota::QUOTA_RECORD_SIZE;
use qfs_ondisk::{Inode, InodeStatus, QuotaDomain, QuotaRecord};
use qfs_types::{DEV_BSIZE, InodeNumber, QUOTA_UNIT};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Usage per (domain, id) as the inodes describe it.
#[derive(Debug, Default)]
pub(crate) struct QuotaTally {
    usage: BTreeMap<(QuotaDomain, u32), QuotaRecord>,
}

fn domain_index(inode: &Inode, domain: QuotaDomain) -> u32 {
    match domain {
        QuotaDomain::Admin => inode.admin_id,
        QuotaDomain::Group => inode.gid,
        QuotaDomain::User => inode.uid,
    }
}

/// Counter deltas one inode contributes: (online files, online blocks,
/// total files, total blocks).
fn charge(inode: &Inode) -> Option<(u64, u64, u64, u64)> {
    let ino = inode.id.ino;
    if inode.is_free() || inode.is_extension() || ino == InodeNumber::INODES || ino == InodeNumber::BLOCKS {
        return None;
    }
    let files = u64::from(!inode.status.contains(InodeStatus::SEG_MEMBER));
    let resident = inode.blocks * (u64::from(DEV_BSIZE) / QUOTA_UNIT);
    if inode.status.contains(InodeStatus::OFFLINE) {
        let total = inode.size.div_ceil(QUOTA_UNIT).max(resident);
        Some((0, 0, files, total))
    } else {
        Some((files, resident, files, resident))
    }
}

impl QuotaTally {
    pub(crate) fn count(&mut self, inode: &Inode) {
        let Some((online_files, online_blocks, files, blocks)) = charge(inode) else {
            return;
        };
        for domain in QuotaDomain::ALL {
            let rec = self.usage.entry((domain, domain_index(inode, domain))).or_default();
            rec.online.files += online_files;
            rec.online.blocks += online_blocks;
            rec.total.files += files;
            rec.total.blocks += blocks;
        }
    }

    pub(crate) fn uncount(&mut self, inode: &Inode) {
        let Some((online_files, online_blocks, files, blocks)) = charge(inode) else {
            return;
        };
        for domain in QuotaDomain::ALL {
            if let Some(rec) = self.usage.get_mut(&(domain, domain_index(inode, domain))) {
                rec.online.files = rec.online.files.saturating_sub(online_files);
                rec.online.blocks = rec.online.blocks.saturating_sub(online_blocks);
                rec.total.files = rec.total.files.saturating_sub(files);
                rec.total.blocks = rec.total.blocks.saturating_sub(blocks);
            }
        }
    }

    pub(crate) fn usage(&self, domain: QuotaDomain, index: u32) -> QuotaRecord {
        self.usage.get(&(domain, index)).copied().unwrap_or_default()
    }
}

/// Quota-file bytes read and reconciled at a time.
const QUOTA_CHUNK: usize = 32 * QUOTA_RECORD_SIZE;

/// Bytes of whole records the quota file holds. A size running past the
/// blocks backing it is reported, repair trims it, and only the backed
/// records are compared.
fn records_len(ctx: &mut FsckContext<'_>, quota: &Inode, name: &str) -> Result<u64> {
    let record = QUOTA_RECORD_SIZE as u64;
    let ino = quota.id.ino.0;
    let seen = ctx.ledger.get(ino).map_or(0, |r| r.blocks_seen);
    let held = seen.saturating_mul(u64::from(DEV_BSIZE)) / record * record;
    let want = quota.size / record * record;
    if want <= held {
        return Ok(want);
    }
    ctx.problem(
        ProblemKind::Quota,
        Some(ino),
        format!("{name}: size {} runs past the {held} bytes allocated", quota.size),
    );
    if ctx.repairing() {
        let mut trimmed = quota.clone();
        trimmed.size = held;
        ctx.table.write_inode(&ctx.io, &trimmed)?;
    }
    Ok(held)
}

/// Compare every record of every quota file with the tally; repair
/// rewrites the usage counters and keeps the limits.
pub(crate) fn reconcile(ctx: &mut FsckContext<'_>) -> Result<()> {
    let root = ctx.table.read_inode(&ctx.io, InodeNumber::ROOT.0)?;
    for domain in QuotaDomain::ALL {
        let name = domain.file_name();
        let Some(entry) = file::lookup(&ctx.sb, &ctx.io, &root, name.as_bytes())? else {
            debug!(file = name, "no quota file");
            continue;
        };
        if !ctx.ledger.resolve(entry.id).is_some_and(|r| r.in_use()) {
            continue;
        }
        let quota = ctx.table.read_inode(&ctx.io, entry.id.ino.0)?;
        let len = records_len(ctx, &quota, name)?;
        let mut mismatched = 0_u32;
        let mut first = None;
        let mut index = 0_u32;
        for offset in (0..len).step_by(QUOTA_CHUNK) {
            let chunk_len = usize::try_from(len - offset).map_or(QUOTA_CHUNK, |l| l.min(QUOTA_CHUNK));
            let Some(mut bytes) = file::read_range(&ctx.sb, &ctx.io, &quota, offset, chunk_len)? else {
                ctx.unrepaired(
                    ProblemKind::IoError,
                    Some(quota.id.ino.0),
                    format!("cannot read quota file {name} at offset {offset}"),
                );
                break;
            };
            let mut dirty = false;
            for chunk in bytes.chunks_exact_mut(QUOTA_RECORD_SIZE) {
                let id = index;
                index += 1;
                let Ok(mut on_disk) = QuotaRecord::parse_from_bytes(chunk) else {
                    continue;
                };
                let computed = ctx.quota.usage(domain, id);
                if on_disk.usage_matches(&computed) {
                    continue;
                }
                mismatched += 1;
                first.get_or_insert(id);
                on_disk.take_usage(&computed);
                dirty |= on_disk.write_into(chunk).is_ok();
            }
            if dirty && ctx.repairing() {
                match file::write_range(&ctx.sb, &ctx.io, &quota, offset, &bytes) {
                    Ok(()) => {}
                    Err(QfsError::Corruption { detail, .. }) => {
                        ctx.unrepaired(ProblemKind::Quota, Some(quota.id.ino.0), detail);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if mismatched == 0 {
            continue;
        }
        let detail = format!(
            "{name}: {mismatched} records disagree with inode usage (first id {})",
            first.unwrap_or_default()
        );
        ctx.problem(ProblemKind::Quota, Some(quota.id.ino.0), detail);
        if ctx.repairing() {
            info!(file = name, records = mismatched, "quota usage rewritten");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfs_types::{InodeId, S_IFREG};

    fn file(uid: u32, blocks: u64, size: u64) -> Inode {
        let mut inode = Inode::free(InodeId::new(9, 1));
        inode.mode = S_IFREG | 0o644;
        inode.nlink = 1;
        inode.uid = uid;
        inode.gid = 20;
        inode.blocks = blocks;
        inode.size = size;
        inode
    }

    #[test]
    fn online_files_count_resident_blocks() {
        let mut tally = QuotaTally::default();
        tally.count(&file(100, 16, 16 * 1024));
        let rec = tally.usage(QuotaDomain::User, 100);
        assert_eq!(rec.online.files, 1);
        assert_eq!(rec.online.blocks, 32);
        assert_eq!(rec.total.blocks, 32);
        assert_eq!(tally.usage(QuotaDomain::Group, 20).total.files, 1);
        assert_eq!(tally.usage(QuotaDomain::Admin, 0).total.files, 1);
    }

    #[test]
    fn offline_files_charge_their_size_to_the_total() {
        let mut tally = QuotaTally::default();
        let mut inode = file(7, 0, 10_000);
        inode.status.insert(InodeStatus::OFFLINE);
        tally.count(&inode);
        let rec = tally.usage(QuotaDomain::User, 7);
        assert_eq!(rec.online.files, 0);
        assert_eq!(rec.online.blocks, 0);
        assert_eq!(rec.total.files, 1);
        assert_eq!(rec.total.blocks, 20);
    }

    #[test]
    fn members_add_blocks_but_not_files() {
        let mut tally = QuotaTally::default();
        let mut inode = file(5, 4, 4096);
        inode.status.insert(InodeStatus::SEG_MEMBER);
        tally.count(&inode);
        let rec = tally.usage(QuotaDomain::User, 5);
        assert_eq!(rec.total.files, 0);
        assert_eq!(rec.total.blocks, 8);
    }

    #[test]
    fn uncount_reverses_count() {
        let mut tally = QuotaTally::default();
        let inode = file(3, 8, 8192);
        tally.count(&inode);
        tally.count(&file(3, 2, 100));
        tally.uncount(&inode);
        let rec = tally.usage(QuotaDomain::User, 3);
        assert_eq!(rec.total.files, 1);
        assert_eq!(rec.total.blocks, 4);
        tally.uncount(&inode);
        assert_eq!(tally.usage(QuotaDomain::User, 3).total.blocks, 0);
    }

    #[test]
    fn table_and_block_inodes_are_exempt() {
        let mut tally = QuotaTally::default();
        let mut inode = file(0, 64, 65536);
        inode.id = InodeId::new(1, 1);
        tally.count(&inode);
        inode.id = InodeId::new(3, 1);
        tally.count(&inode);
        assert_eq!(tally.usage(QuotaDomain::User, 0), QuotaRecord::default());
    }
}
