//! Pass 1: read every slot, classify it, validate it and claim its blocks.

use crate::context::FsckContext;
use crate::ledger::{InodeKind, InodeRecord, InodeState};
use crate::report::ProblemKind;
use crate::walk::{WalkMode, direct_map_fault, walk_inode};
use qfs_error::{QfsError, Result};
use qfs_extent::{DauGeometry, mapped_len};
use qfs_ondisk::{ExtensionInode, FileType, Inode, InodeStatus};
use qfs_types::{DIR_BLK, InodeId, InodeNumber, S_IFEXT, S_IFMT, read_le_u32};
use tracing::{debug, info};

/// Slots whose loss makes the filesystem unusable.
fn is_reserved(ctx: &FsckContext<'_>, ino: u32) -> bool {
    ino < InodeNumber::HOSTS.0 || (ino == InodeNumber::HOSTS.0 && ctx.sb.shared)
}

fn invalid_reason(ctx: &FsckContext<'_>, ino: u32, inode: &Inode) -> Option<String> {
    if inode.id.ino.0 != ino {
        return Some(format!("slot holds inode number {}", inode.id.ino));
    }
    let ftype = inode.file_type();
    if matches!(ftype, FileType::Unknown | FileType::Extension) {
        return Some(format!("unknown mode {:#o}", inode.mode));
    }
    if inode.nlink == 0 {
        return Some("link count is zero".to_owned());
    }
    if ino == InodeNumber::ROOT.0 && ftype != FileType::Directory {
        return Some("root is not a directory".to_owned());
    }
    let index = inode.status.contains(InodeStatus::SEG_INDEX);
    let member = inode.status.contains(InodeStatus::SEG_MEMBER);
    if index && member {
        return Some("both segment index and segment member".to_owned());
    }
    if index && inode.seg_size == 0 {
        return Some("segment index with zero segment size".to_owned());
    }
    if member && inode.parent.is_none() {
        return Some("segment member without an index".to_owned());
    }
    if ftype == FileType::Directory && (inode.size == 0 || inode.size % DIR_BLK as u64 != 0) {
        return Some(format!("directory size {} is not a multiple of {DIR_BLK}", inode.size));
    }
    if inode.extents[0].ord.0 >= ctx.sb.fs_count {
        return Some(format!("data ordinal {} does not exist", inode.extents[0].ord));
    }
    if inode.status.contains(InodeStatus::DIRECT_MAP) {
        return direct_map_fault(ctx, inode);
    }
    let geom = DauGeometry::for_inode(&ctx.sb, inode);
    let len = mapped_len(inode);
    if len > geom.max_size() {
        return Some(format!("size {len} exceeds the {} addressable bytes", geom.max_size()));
    }
    None
}

pub(crate) fn run(ctx: &mut FsckContext<'_>) -> Result<()> {
    for ino in ctx.ledger.inodes() {
        ctx.options.check_cancelled()?;
        let raw = ctx.table.read_slot(&ctx.io, ino)?;
        let mode = read_le_u32(&raw, 0).map_err(|e| QfsError::InodeTable(e.to_string()))?;
        if mode == 0 {
            scan_free(ctx, ino, &raw)?;
        } else if mode & S_IFMT == S_IFEXT {
            scan_extension(ctx, ino, &raw)?;
        } else {
            scan_base(ctx, ino, &raw)?;
        }
    }
    let stats = &ctx.report.stats;
    info!(
        in_use = stats.inodes_in_use,
        directories = stats.directories,
        files = stats.files,
        extensions = stats.extensions,
        duplicates = ctx.dups.key_count(),
        "pass 1 complete"
    );
    Ok(())
}

fn slot_generation(raw: &[u8]) -> u32 {
    read_le_u32(raw, 8).unwrap_or(0)
}

fn scan_free(ctx: &mut FsckContext<'_>, ino: u32, raw: &[u8]) -> Result<()> {
    let reserved = ino == InodeNumber::ROOT.0
        || ino == InodeNumber::BLOCKS.0
        || (ino == InodeNumber::HOSTS.0 && ctx.sb.shared);
    if reserved {
        return Err(QfsError::InodeTable(format!("reserved inode {ino} is free")));
    }
    ctx.ledger
        .set(ino, InodeRecord::free(InodeId::new(ino, slot_generation(raw))));
    Ok(())
}

fn invalid(ctx: &mut FsckContext<'_>, ino: u32, raw: &[u8], reason: String) -> Result<()> {
    if is_reserved(ctx, ino) {
        return Err(QfsError::InodeTable(format!("reserved inode {ino}: {reason}")));
    }
    ctx.problem(ProblemKind::InvalidInode, Some(ino), reason);
    let mut record = InodeRecord::free(InodeId::new(ino, slot_generation(raw)));
    record.state = InodeState::Invalid;
    ctx.ledger.set(ino, record);
    Ok(())
}

fn scan_extension(ctx: &mut FsckContext<'_>, ino: u32, raw: &[u8]) -> Result<()> {
    let ext = match ExtensionInode::parse_from_bytes(raw) {
        Ok(ext) if ext.id.ino.0 == ino && !ext.base.is_none() => ext,
        Ok(ext) => {
            let reason = format!("extension {} in slot {ino} has base {}", ext.id, ext.base);
            return invalid(ctx, ino, raw, reason);
        }
        Err(e) => return invalid(ctx, ino, raw, format!("extension: {e}")),
    };
    if is_reserved(ctx, ino) {
        return Err(QfsError::InodeTable(format!("reserved inode {ino} is an extension")));
    }
    let mut record = InodeRecord::free(ext.id);
    record.kind = Some(InodeKind::Extension(ext.kind));
    record.state = InodeState::Live;
    record.parent = ext.base;
    record.ext = ext.next;
    ctx.ledger.set(ino, record);
    ctx.report.stats.extensions += 1;
    debug!(ino, kind = ?ext.kind, base = %ext.base, "extension");
    Ok(())
}

fn scan_base(ctx: &mut FsckContext<'_>, ino: u32, raw: &[u8]) -> Result<()> {
    let mut inode = match Inode::parse_from_bytes(raw) {
        Ok(inode) => inode,
        Err(e) => return invalid(ctx, ino, raw, e.to_string()),
    };
    if let Some(reason) = invalid_reason(ctx, ino, &inode) {
        return invalid(ctx, ino, raw, reason);
    }

    let mut record = InodeRecord::live(&inode);
    record.proven = ino == InodeNumber::ROOT.0;
    let kind = record.kind;
    ctx.ledger.set(ino, record);

    let summary = walk_inode(ctx, &mut inode, WalkMode::Claim)?;
    if summary.unusable {
        return invalid(ctx, ino, raw, "direct map unusable".to_owned());
    }
    if summary.changed && ctx.repairing() {
        ctx.table.write_inode(&ctx.io, &inode)?;
    }
    if let Some(rec) = ctx.ledger.get_mut(ino) {
        rec.blocks_seen = summary.blocks;
    }
    ctx.quota.count(&inode);

    let stats = &mut ctx.report.stats;
    stats.inodes_in_use += 1;
    stats.blocks_claimed += summary.blocks;
    match kind {
        Some(InodeKind::Directory) => stats.directories += 1,
        Some(InodeKind::SegmentMember) => stats.segment_members += 1,
        _ => stats.files += 1,
    }
    debug!(ino, blocks = summary.blocks, ?kind, "inode claimed");
    Ok(())
}

