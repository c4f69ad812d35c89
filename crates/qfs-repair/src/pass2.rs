//! Pass 2: cross-check every reference an inode is named by.
//!
//! Directory entries prove parentage or record alternate parents, segment
//! indexes prove their members, extension chains prove their links and
//! hard-link-parent lists are matched to the entries found. A confirm walk
//! collects every owner of each shared block.

use crate::context::FsckContext;
use crate::file::{self, Mapping};
use crate::ledger::{InodeFlags, InodeKind, InodeState};
use crate::links;
use crate::report::ProblemKind;
use crate::walk::{WalkMode, walk_inode};
use qfs_dir::{
    DirEntry, init_dir_block, init_empty_block, name_hash, parse_dir_block, remove_entry_at,
    set_entry_ftype, set_entry_hash,
};
use qfs_error::{QfsError, Result};
use qfs_extent::{SEG_ID_SIZE, mapped_len};
use qfs_ondisk::Inode;
use qfs_types::{DEV_BSIZE, DIR_BLK, InodeId, MAX_EXT_CHAIN, read_le_u32};
use tracing::{debug, info};

pub(crate) fn run(ctx: &mut FsckContext<'_>) -> Result<()> {
    for ino in ctx.ledger.inodes() {
        ctx.options.check_cancelled()?;
        let Some(rec) = ctx.ledger.get(ino) else {
            continue;
        };
        if rec.state != InodeState::Live {
            continue;
        }
        match rec.kind {
            Some(InodeKind::Directory) => check_directory(ctx, ino)?,
            Some(InodeKind::SegmentIndex) => check_segment_index(ctx, ino)?,
            _ => {}
        }
    }
    for ino in ctx.ledger.inodes() {
        let follow = ctx
            .ledger
            .get(ino)
            .is_some_and(|r| r.in_use() && !r.is_extension() && !r.ext.is_none());
        if follow {
            check_extension_chain(ctx, ino)?;
            links::check(ctx, ino)?;
        }
    }
    if !ctx.dups.is_empty() {
        confirm_duplicates(ctx)?;
    }
    info!(dir_io_error = ctx.dir_io_error, "pass 2 complete");
    Ok(())
}

fn flag(ctx: &mut FsckContext<'_>, ino: u32, flag: InodeFlags) {
    if let Some(rec) = ctx.ledger.get_mut(ino) {
        rec.flags.insert(flag);
    }
}

fn dir_read_failed(ctx: &mut FsckContext<'_>, dir: &Inode, offset: u64, detail: &str) {
    let ino = dir.id.ino.0;
    ctx.unrepaired(
        ProblemKind::IoError,
        Some(ino),
        format!("directory block at offset {offset}: {detail}"),
    );
    flag(ctx, ino, InodeFlags::IO_ERROR);
    ctx.dir_io_error = true;
}

fn check_directory(ctx: &mut FsckContext<'_>, ino: u32) -> Result<()> {
    let dir = ctx.table.read_inode(&ctx.io, ino)?;
    for offset in file::dir_block_offsets(&dir) {
        let (ord, block) = match file::resolve(&ctx.sb, &ctx.io, &dir, offset)? {
            Mapping::Mapped { ord, block, .. } => (ord, block),
            Mapping::Hole => {
                ctx.unrepaired(
                    ProblemKind::BadDirBlock,
                    Some(ino),
                    format!("no block mapped at offset {offset}"),
                );
                continue;
            }
            Mapping::Unreadable => {
                dir_read_failed(ctx, &dir, offset, "indirect block unreadable");
                continue;
            }
        };
        let mut bytes = match ctx.io.read(ord, block, DIR_BLK) {
            Ok(bytes) => bytes,
            Err(QfsError::Io(e)) => {
                dir_read_failed(ctx, &dir, offset, &e.to_string());
                continue;
            }
            Err(e) => return Err(e),
        };
        let mut dirty = false;
        let entries = match parse_dir_block(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                ctx.problem(
                    ProblemKind::BadDirBlock,
                    Some(ino),
                    format!("block at offset {offset}: {e}"),
                );
                if !ctx.repairing() {
                    continue;
                }
                if offset == 0 {
                    let hashed = ctx.entry_hash(b".") != 0;
                    init_dir_block(&mut bytes, dir.id, dir.parent, hashed)?;
                } else {
                    init_empty_block(&mut bytes)?;
                }
                dirty = true;
                parse_dir_block(&bytes)?
            }
        };

        if offset == 0 {
            let dot_ok = entries.first().is_some_and(|e| e.is_dot() && e.id == dir.id);
            let dotdot_ok = entries
                .get(1)
                .is_some_and(|e| e.is_dotdot() && e.id == dir.parent);
            if !dot_ok || !dotdot_ok {
                debug!(ino, dot_ok, dotdot_ok, "dot entries disagree with the inode");
                flag(ctx, ino, InodeFlags::BAD_DOT);
            }
        }
        for entry in &entries {
            dirty |= check_entry(ctx, &dir, &mut bytes, entry)?;
        }
        if dirty {
            ctx.io.write(ord, block, &bytes)?;
        }
    }
    Ok(())
}

/// Check one entry; returns whether `bytes` changed.
fn check_entry(ctx: &mut FsckContext<'_>, dir: &Inode, bytes: &mut [u8], entry: &DirEntry) -> Result<bool> {
    let dir_ino = dir.id.ino.0;
    let mut dirty = false;
    if ctx.checks_hashes() {
        let want = name_hash(&entry.name);
        if entry.hash != want {
            let fix = ctx.options.repair || ctx.options.regen_dir_hash;
            ctx.report.record(
                ProblemKind::DirHash,
                Some(dir_ino),
                format!("entry {:?} has hash {:#06x}, want {want:#06x}", entry.name_lossy(), entry.hash),
                fix,
            );
            if fix {
                set_entry_hash(bytes, entry.offset, want)?;
                dirty = true;
            }
        }
    }
    if entry.is_dot() || entry.is_dotdot() {
        return Ok(dirty);
    }

    let target = entry.id.ino.0;
    let stale = match ctx.ledger.get(target) {
        None => Some("no such inode".to_owned()),
        Some(rec) if rec.state == InodeState::Invalid => return Ok(dirty),
        Some(rec) if rec.is_vacant() => Some("inode is free".to_owned()),
        Some(rec) if rec.id.generation != entry.id.generation => Some(format!(
            "generation {} but inode has {}",
            entry.id.generation, rec.id.generation
        )),
        Some(rec) if !rec.kind.is_some_and(InodeKind::is_nameable) => {
            Some(format!("{:?} cannot be named", rec.kind))
        }
        Some(_) => None,
    };
    if let Some(why) = stale {
        ctx.problem(
            ProblemKind::StaleEntry,
            Some(dir_ino),
            format!("entry {:?} -> {}: {why}", entry.name_lossy(), entry.id),
        );
        if ctx.repairing() {
            remove_entry_at(bytes, entry.offset)?;
            dirty = true;
        }
        return Ok(dirty);
    }

    let Some(rec) = ctx.ledger.get_mut(target) else {
        return Ok(dirty);
    };
    rec.named_refs += 1;
    let want_ftype = rec.ftype;
    if rec.parent == dir.id {
        rec.proven = true;
    } else {
        ctx.ledger.add_alt_parent(target, dir.id);
    }
    if entry.ftype != want_ftype {
        ctx.problem(
            ProblemKind::FileType,
            Some(dir_ino),
            format!(
                "entry {:?} has type {} but inode {target} is type {want_ftype}",
                entry.name_lossy(),
                entry.ftype
            ),
        );
        if ctx.repairing() {
            set_entry_ftype(bytes, entry.offset, want_ftype)?;
            dirty = true;
        }
    }
    Ok(dirty)
}

/// Member-table bytes read and checked at a time.
const TABLE_CHUNK: u64 = 4096;

/// Bytes of the member table the index really holds. A table longer than
/// the blocks backing it comes from a corrupt size or segment size; repair
/// shrinks the size to the members the blocks can list.
fn table_len(ctx: &mut FsckContext<'_>, index: &Inode) -> Result<u64> {
    let ino = index.id.ino.0;
    let want = mapped_len(index);
    let seen = ctx.ledger.get(ino).map_or(0, |r| r.blocks_seen);
    let held = seen.saturating_mul(u64::from(DEV_BSIZE)) / SEG_ID_SIZE * SEG_ID_SIZE;
    if want <= held {
        return Ok(want);
    }
    ctx.problem(
        ProblemKind::SegmentIndex,
        Some(ino),
        format!("size {} lists {want} table bytes but only {held} are allocated", index.size),
    );
    flag(ctx, ino, InodeFlags::SEG_PROBLEM);
    if ctx.repairing() {
        let mut fixed = index.clone();
        ctx.quota.uncount(&fixed);
        fixed.size = (held / SEG_ID_SIZE).saturating_mul(index.seg_size);
        ctx.quota.count(&fixed);
        ctx.table.write_inode(&ctx.io, &fixed)?;
    }
    Ok(held)
}

fn check_segment_index(ctx: &mut FsckContext<'_>, ino: u32) -> Result<()> {
    let index = ctx.table.read_inode(&ctx.io, ino)?;
    let len = table_len(ctx, &index)?;
    let width = usize::try_from(SEG_ID_SIZE).unwrap_or(8);
    let mut slot = 0_u32;
    for offset in (0..len).step_by(usize::try_from(TABLE_CHUNK).unwrap_or(4096)) {
        let chunk_len = usize::try_from(TABLE_CHUNK.min(len - offset)).unwrap_or(0);
        let Some(mut table) = file::read_range(&ctx.sb, &ctx.io, &index, offset, chunk_len)? else {
            ctx.unrepaired(
                ProblemKind::IoError,
                Some(ino),
                format!("segment table unreadable at offset {offset}"),
            );
            flag(ctx, ino, InodeFlags::IO_ERROR);
            return Ok(());
        };
        let mut dirty = false;
        for raw in table.chunks_exact_mut(width) {
            if check_member(ctx, &index, slot, raw) {
                raw.fill(0);
                dirty = true;
            }
            slot += 1;
        }
        if dirty {
            file::write_range(&ctx.sb, &ctx.io, &index, offset, &table)?;
        }
    }
    Ok(())
}

/// Check one member-table slot. Returns whether repair clears it.
fn check_member(ctx: &mut FsckContext<'_>, index: &Inode, slot: u32, raw: &[u8]) -> bool {
    let ino = index.id.ino.0;
    let id = InodeId::new(
        read_le_u32(raw, 0).unwrap_or(0),
        read_le_u32(raw, 4).unwrap_or(0),
    );
    if id.is_none() {
        return false;
    }
    let fault = match ctx.ledger.resolve(id) {
        None => Some("member is free or reused".to_owned()),
        Some(rec) if !rec.in_use() || rec.kind != Some(InodeKind::SegmentMember) => {
            Some(format!("{:?} is not a segment member", rec.kind))
        }
        Some(rec) if rec.parent != index.id => Some(format!("member names index {}", rec.parent)),
        Some(rec) if rec.seg_ord != slot => Some(format!("member records position {}", rec.seg_ord)),
        Some(rec) if rec.proven => Some("member already listed".to_owned()),
        Some(_) => None,
    };
    let Some(why) = fault else {
        if let Some(rec) = ctx.ledger.get_mut(id.ino.0) {
            rec.proven = true;
            rec.named_refs = 1;
        }
        return false;
    };
    ctx.problem(
        ProblemKind::SegmentIndex,
        Some(ino),
        format!("segment {slot} -> {id}: {why}"),
    );
    flag(ctx, ino, InodeFlags::SEG_PROBLEM);
    ctx.repairing()
}

fn check_extension_chain(ctx: &mut FsckContext<'_>, base_ino: u32) -> Result<()> {
    let Some(base) = ctx.ledger.get(base_ino).map(|r| (r.id, r.ext)) else {
        return Ok(());
    };
    let (base_id, mut next) = base;
    let mut prev: Option<InodeId> = None;
    let mut links = 0_usize;
    while !next.is_none() {
        let fault = if links >= MAX_EXT_CHAIN {
            Some(format!("chain longer than {MAX_EXT_CHAIN} links"))
        } else {
            match ctx.ledger.resolve(next) {
                None => Some(format!("link {next} is free or reused")),
                Some(rec) if rec.state != InodeState::Live || !rec.is_extension() => {
                    Some(format!("link {next} is not an extension"))
                }
                Some(rec) if rec.parent != base_id => Some(format!("link {next} belongs to {}", rec.parent)),
                Some(rec) if rec.proven => Some(format!("link {next} already chained")),
                Some(_) => None,
            }
        };
        if let Some(why) = fault {
            ctx.problem(ProblemKind::Extension, Some(base_ino), why);
            if ctx.repairing() {
                cut_chain(ctx, base_ino, prev)?;
            }
            return Ok(());
        }
        let Some(rec) = ctx.ledger.get_mut(next.ino.0) else {
            return Ok(());
        };
        rec.proven = true;
        rec.named_refs = 1;
        prev = Some(next);
        next = rec.ext;
        links += 1;
    }
    Ok(())
}

/// End the chain of `base_ino` after `prev` (or at the base itself).
fn cut_chain(ctx: &mut FsckContext<'_>, base_ino: u32, prev: Option<InodeId>) -> Result<()> {
    match prev {
        None => {
            let mut base = ctx.table.read_inode(&ctx.io, base_ino)?;
            base.ext = InodeId::NONE;
            ctx.table.write_inode(&ctx.io, &base)?;
            if let Some(rec) = ctx.ledger.get_mut(base_ino) {
                rec.ext = InodeId::NONE;
            }
        }
        Some(link) => {
            let mut ext = ctx.table.read_extension(&ctx.io, link.ino.0)?;
            ext.next = InodeId::NONE;
            ctx.table.write_extension(&ctx.io, &ext)?;
            if let Some(rec) = ctx.ledger.get_mut(link.ino.0) {
                rec.ext = InodeId::NONE;
            }
        }
    }
    Ok(())
}

/// Walk every inode again, recording each owner of a block already known
/// to be shared.
fn confirm_duplicates(ctx: &mut FsckContext<'_>) -> Result<()> {
    for ino in ctx.ledger.inodes() {
        ctx.options.check_cancelled()?;
        let walk = ctx
            .ledger
            .get(ino)
            .is_some_and(|r| r.in_use() && !r.is_extension());
        if !walk {
            continue;
        }
        let mut inode = ctx.table.read_inode(&ctx.io, ino)?;
        walk_inode(ctx, &mut inode, WalkMode::Confirm)?;
    }
    for entry in ctx.dups.entries()? {
        if let [owner] = entry.owners.as_slice() {
            ctx.unrepaired(
                ProblemKind::BadExtent,
                Some(*owner),
                format!(
                    "block {} on ordinal {} is claimed twice by the same inode",
                    entry.key.block, entry.key.ord
                ),
            );
        }
    }
    debug!(keys = ctx.dups.key_count(), "duplicate owners confirmed");
    Ok(())
}
