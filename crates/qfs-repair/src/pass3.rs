//! Pass 3: resolve what the first two passes found.
//!
//! Order matters. Duplicate owners are settled before anything is freed,
//! frees happen before orphans are counted (a freed directory orphans its
//! children), and link and block counts are compared only once every
//! relocation is done. Quota reconciliation runs last, on the final
//! tallies.

use crate::context::FsckContext;
use crate::file::{self, Mapping};
use crate::ledger::{InodeFlags, InodeKind, InodeState};
use crate::links;
use crate::log;
use crate::lost_found::{self, LostFound};
use crate::quota;
use crate::report::ProblemKind;
use crate::walk::{WalkMode, walk_inode};
use qfs_dir::{parse_dir_block, remove_entry_at, set_entry_target};
use qfs_error::{QfsError, Result};
use qfs_ondisk::{Inode, OptionMask};
use qfs_types::{DIR_BLK, InodeId, InodeNumber, MAX_EXT_CHAIN};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Work carried between the steps of pass 3.
#[derive(Debug, Default)]
struct Resolution {
    /// Ids released by this pass; entries naming them are purged.
    freed: BTreeSet<InodeId>,
    lost_found: Option<LostFound>,
}

pub(crate) fn run(ctx: &mut FsckContext<'_>) -> Result<()> {
    let mut res = Resolution::default();
    resolve_duplicates(ctx)?;
    release_inodes(ctx, &mut res)?;
    if ctx.rebuild_maps && ctx.repairing() {
        rebuild_maps(ctx)?;
    }
    unclaimed_extensions(ctx, &mut res)?;
    resolve_orphans(ctx, &mut res)?;
    fix_dots(ctx)?;
    check_counts(ctx)?;
    if ctx.repairing() && !res.freed.is_empty() {
        purge_entries(ctx, &res.freed)?;
    }
    quota::reconcile(ctx)?;
    let stats = &ctx.report.stats;
    info!(
        freed = stats.inodes_freed,
        damaged = stats.inodes_damaged,
        relocated = stats.orphans_relocated,
        "pass 3 complete"
    );
    Ok(())
}

fn flag(ctx: &mut FsckContext<'_>, ino: u32, flag: InodeFlags) {
    if let Some(rec) = ctx.ledger.get_mut(ino) {
        rec.flags.insert(flag);
    }
}

// ── Duplicates ──────────────────────────────────────────────────────────────

/// Report every shared key once. The lowest-numbered owner keeps the
/// block; every other owner loses it.
fn resolve_duplicates(ctx: &mut FsckContext<'_>) -> Result<()> {
    if ctx.dups.is_empty() {
        return Ok(());
    }
    for entry in ctx.dups.entries()? {
        let [keeper, losers @ ..] = entry.owners.as_slice() else {
            continue;
        };
        if losers.is_empty() {
            continue;
        }
        ctx.report.stats.duplicate_keys += 1;
        ctx.problem(
            ProblemKind::DuplicateBlock,
            Some(*keeper),
            format!(
                "block {} on ordinal {} is owned by inodes {:?}; inode {keeper} keeps it",
                entry.key.block, entry.key.ord, entry.owners
            ),
        );
        for loser in losers {
            flag(ctx, *loser, InodeFlags::DUP_LOSER);
        }
    }
    Ok(())
}

// ── Freeing ─────────────────────────────────────────────────────────────────

/// Free invalid slots and every duplicate loser. Losers with an archive
/// copy are kept as damaged instead.
fn release_inodes(ctx: &mut FsckContext<'_>, res: &mut Resolution) -> Result<()> {
    if !ctx.repairing() {
        return Ok(());
    }
    for ino in ctx.ledger.inodes() {
        ctx.options.check_cancelled()?;
        let Some(rec) = ctx.ledger.get(ino) else {
            continue;
        };
        let (state, id, flags, archived) = (rec.state, rec.id, rec.flags, rec.archived);
        if state == InodeState::Invalid {
            ctx.table.free_slot(&ctx.io, id)?;
            mark_freed(ctx, res, id);
            continue;
        }
        if state != InodeState::Live || !flags.contains(InodeFlags::DUP_LOSER) {
            continue;
        }
        if archived {
            damage_inode(ctx, ino)?;
        } else {
            free_inode(ctx, res, ino)?;
        }
    }
    Ok(())
}

fn mark_freed(ctx: &mut FsckContext<'_>, res: &mut Resolution, id: InodeId) {
    if let Some(rec) = ctx.ledger.get_mut(id.ino.0) {
        rec.state = InodeState::Freed;
    }
    res.freed.insert(id);
    ctx.any_freed = true;
    ctx.report.stats.inodes_freed += 1;
    debug!(%id, "inode freed");
}

/// Give back every block of a live inode, its extension chain and the
/// slot itself. Whatever it named or indexed loses that proof.
fn free_inode(ctx: &mut FsckContext<'_>, res: &mut Resolution, ino: u32) -> Result<()> {
    let mut inode = ctx.table.read_inode(&ctx.io, ino)?;
    walk_inode(ctx, &mut inode, WalkMode::Release)?;
    ctx.quota.uncount(&inode);
    if inode.is_dir() {
        forget_entries(ctx, &inode)?;
    }
    for other in ctx.ledger.inodes() {
        if let Some(member) = ctx.ledger.get_mut(other) {
            if member.kind == Some(InodeKind::SegmentMember) && member.parent == inode.id {
                member.proven = false;
            }
        }
    }

    let mut next = inode.ext;
    let mut links = 0;
    while !next.is_none() && links < MAX_EXT_CHAIN {
        let Some(ext) = ctx
            .ledger
            .resolve(next)
            .filter(|r| r.is_extension() && r.parent == inode.id && r.state == InodeState::Live)
            .map(|r| (r.id, r.ext))
        else {
            break;
        };
        ctx.table.free_slot(&ctx.io, ext.0)?;
        mark_freed(ctx, res, ext.0);
        next = ext.1;
        links += 1;
    }

    ctx.table.free_slot(&ctx.io, inode.id)?;
    mark_freed(ctx, res, inode.id);
    Ok(())
}

/// Keep the inode but drop its resident data.
fn damage_inode(ctx: &mut FsckContext<'_>, ino: u32) -> Result<()> {
    let mut inode = ctx.table.read_inode(&ctx.io, ino)?;
    walk_inode(ctx, &mut inode, WalkMode::Release)?;
    ctx.quota.uncount(&inode);
    inode.mark_damaged();
    ctx.quota.count(&inode);
    ctx.table.write_inode(&ctx.io, &inode)?;
    if let Some(rec) = ctx.ledger.get_mut(ino) {
        rec.state = InodeState::Damaged;
        rec.blocks_seen = 0;
    }
    ctx.report.stats.inodes_damaged += 1;
    debug!(ino, "inode damaged; archive copy remains");
    Ok(())
}

/// Undo the references a directory about to be freed contributed.
fn forget_entries(ctx: &mut FsckContext<'_>, dir: &Inode) -> Result<()> {
    for offset in file::dir_block_offsets(dir) {
        let Mapping::Mapped { ord, block, .. } = file::resolve(&ctx.sb, &ctx.io, dir, offset)? else {
            continue;
        };
        let Ok(bytes) = ctx.io.read(ord, block, DIR_BLK) else {
            continue;
        };
        let Ok(entries) = parse_dir_block(&bytes) else {
            continue;
        };
        for entry in entries.iter().filter(|e| !e.is_dot() && !e.is_dotdot()) {
            let target = entry.id.ino.0;
            let Some(rec) = ctx.ledger.get_mut(target).filter(|r| r.id == entry.id) else {
                continue;
            };
            rec.named_refs = rec.named_refs.saturating_sub(1);
            if rec.parent == dir.id {
                rec.proven = false;
            } else {
                ctx.ledger.remove_alt_parent(target, dir.id);
                links::drop_parent(ctx, target, dir.id)?;
            }
        }
    }
    Ok(())
}

/// Releases skipped blocks another owner still holds; recompute every map
/// from the survivors.
fn rebuild_maps(ctx: &mut FsckContext<'_>) -> Result<()> {
    ctx.reset_maps()?;
    if ctx.sb.has_log() {
        log::claim_region(ctx)?;
    }
    for ino in ctx.ledger.inodes() {
        let rebuild = ctx
            .ledger
            .get(ino)
            .is_some_and(|r| r.in_use() && !r.is_extension());
        if rebuild {
            let mut inode = ctx.table.read_inode(&ctx.io, ino)?;
            walk_inode(ctx, &mut inode, WalkMode::Rebuild)?;
        }
    }
    ctx.rebuild_maps = false;
    info!("working bitmaps rebuilt");
    Ok(())
}

fn unclaimed_extensions(ctx: &mut FsckContext<'_>, res: &mut Resolution) -> Result<()> {
    for ino in ctx.ledger.inodes() {
        let Some(rec) = ctx.ledger.get(ino) else {
            continue;
        };
        if rec.state != InodeState::Live || !rec.is_extension() || rec.proven {
            continue;
        }
        let (id, base) = (rec.id, rec.parent);
        ctx.problem(
            ProblemKind::UnclaimedExtension,
            Some(ino),
            format!("extension {id} is not on the chain of {base}"),
        );
        if ctx.repairing() {
            ctx.table.free_slot(&ctx.io, id)?;
            mark_freed(ctx, res, id);
        }
    }
    Ok(())
}

// ── Orphans ─────────────────────────────────────────────────────────────────

fn resolve_orphans(ctx: &mut FsckContext<'_>, res: &mut Resolution) -> Result<()> {
    for ino in ctx.ledger.inodes() {
        if ino < InodeNumber::FIRST_USER.0 {
            continue;
        }
        ctx.options.check_cancelled()?;
        let Some(rec) = ctx.ledger.get(ino) else {
            continue;
        };
        if !rec.in_use() || rec.is_extension() || rec.proven {
            continue;
        }
        let (id, kind, parent, flags) = (rec.id, rec.kind, rec.parent, rec.flags);

        if kind == Some(InodeKind::SegmentMember) {
            orphan_member(ctx, res, ino, id, parent)?;
            continue;
        }
        if adopt_alternate(ctx, ino, id, parent)? {
            continue;
        }
        if flags.contains(InodeFlags::IO_ERROR) || ctx.dir_io_error {
            ctx.unrepaired(
                ProblemKind::Orphan,
                Some(ino),
                format!("{id} is not named by {parent}; left in place after read errors"),
            );
            flag(ctx, ino, InodeFlags::UNRESOLVED);
            continue;
        }
        if ctx.options.allow_offline_parents {
            ctx.unrepaired(
                ProblemKind::Orphan,
                Some(ino),
                format!("{id} is not named by {parent}; its parent may be offline"),
            );
            flag(ctx, ino, InodeFlags::UNRESOLVED);
            continue;
        }
        relocate(ctx, res, ino, id, parent)?;
    }
    Ok(())
}

/// A segment no valid index lists. When its index was already reported
/// the index problem stands for both.
fn orphan_member(
    ctx: &mut FsckContext<'_>,
    res: &mut Resolution,
    ino: u32,
    id: InodeId,
    index: InodeId,
) -> Result<()> {
    let index_reported = ctx
        .ledger
        .resolve(index)
        .is_some_and(|r| r.in_use() && r.flags.contains(InodeFlags::SEG_PROBLEM));
    if index_reported {
        debug!(%id, %index, "member of an index already reported");
        if ctx.repairing() {
            free_inode(ctx, res, ino)?;
        }
        return Ok(());
    }
    ctx.problem(
        ProblemKind::SegmentMember,
        Some(ino),
        format!("segment {id} is not listed by index {index}"),
    );
    if ctx.repairing() {
        free_inode(ctx, res, ino)?;
    }
    Ok(())
}

/// Make the lowest-numbered directory that names the inode its parent.
fn adopt_alternate(ctx: &mut FsckContext<'_>, ino: u32, id: InodeId, parent: InodeId) -> Result<bool> {
    let Some(adopter) = ctx
        .ledger
        .alt_parents(ino)
        .iter()
        .copied()
        .filter(|d| *d != id && ctx.ledger.is_live_dir(*d))
        .min()
    else {
        return Ok(false);
    };
    ctx.problem(
        ProblemKind::Orphan,
        Some(ino),
        format!("{id} is not named by {parent}; adopted by {adopter}"),
    );
    ctx.ledger.remove_alt_parent(ino, adopter);
    let is_dir = ctx.ledger.get(ino).is_some_and(|r| r.is_dir());
    let repairing = ctx.repairing();
    if repairing {
        let mut inode = ctx.table.read_inode(&ctx.io, ino)?;
        inode.parent = adopter;
        inode.change_time = ctx.now;
        ctx.table.write_inode(&ctx.io, &inode)?;
        links::drop_parent(ctx, ino, adopter)?;
    }
    if let Some(rec) = ctx.ledger.get_mut(ino) {
        rec.proven = true;
        if repairing {
            rec.parent = adopter;
            if is_dir {
                rec.flags.insert(InodeFlags::REPARENTED);
            }
        } else {
            rec.flags.insert(InodeFlags::SIMULATED);
        }
    }
    Ok(true)
}

fn relocate(ctx: &mut FsckContext<'_>, res: &mut Resolution, ino: u32, id: InodeId, parent: InodeId) -> Result<()> {
    let lf = match res.lost_found {
        Some(lf) => lf,
        None => {
            let lf = lost_found::locate(ctx)?;
            res.lost_found = Some(lf);
            lf
        }
    };
    let name = format!("#{ino}");
    let detail = format!("{id} is not named by {parent}; moved to {}/{name}", lost_found::LOST_FOUND);
    let Some(rec) = ctx.ledger.get(ino) else {
        return Ok(());
    };
    let (ftype, is_dir) = (rec.ftype, rec.is_dir());

    let LostFound::Dir(lf_id) = lf else {
        if lf == LostFound::Simulated {
            ctx.problem(ProblemKind::Orphan, Some(ino), detail);
            if let Some(rec) = ctx.ledger.get_mut(ino) {
                rec.named_refs += 1;
                rec.flags.insert(InodeFlags::SIMULATED);
            }
        } else {
            ctx.unrepaired(ProblemKind::Orphan, Some(ino), detail);
            flag(ctx, ino, InodeFlags::UNRESOLVED);
        }
        return Ok(());
    };

    if !ctx.repairing() {
        ctx.problem(ProblemKind::Orphan, Some(ino), detail);
        if let Some(rec) = ctx.ledger.get_mut(ino) {
            rec.named_refs += 1;
            rec.flags.insert(InodeFlags::SIMULATED);
        }
        return Ok(());
    }

    let mut lf_dir = ctx.table.read_inode(&ctx.io, lf_id.ino.0)?;
    if !lost_found::add_entry_growing(ctx, &mut lf_dir, name.as_bytes(), id, ftype)? {
        ctx.unrepaired(
            ProblemKind::Orphan,
            Some(ino),
            format!("{id} is not named by {parent}; {} is full", lost_found::LOST_FOUND),
        );
        flag(ctx, ino, InodeFlags::UNRESOLVED);
        return Ok(());
    }
    if is_dir {
        lf_dir.nlink += 1;
        ctx.table.write_inode(&ctx.io, &lf_dir)?;
    }
    let mut inode = ctx.table.read_inode(&ctx.io, ino)?;
    inode.parent = lf_id;
    inode.change_time = ctx.now;
    ctx.table.write_inode(&ctx.io, &inode)?;

    ctx.problem(ProblemKind::Orphan, Some(ino), detail);
    if let Some(rec) = ctx.ledger.get_mut(ino) {
        rec.parent = lf_id;
        rec.proven = true;
        rec.named_refs += 1;
        if is_dir {
            rec.flags.insert(InodeFlags::REPARENTED);
        }
    }
    ctx.report.stats.orphans_relocated += 1;
    Ok(())
}

// ── Dots ────────────────────────────────────────────────────────────────────

/// Point `.` and `..` of every flagged directory at itself and its parent.
fn fix_dots(ctx: &mut FsckContext<'_>) -> Result<()> {
    for ino in ctx.ledger.inodes() {
        let Some(rec) = ctx.ledger.get(ino) else {
            continue;
        };
        if !rec.in_use() || !rec.is_dir() || rec.flags.contains(InodeFlags::SIMULATED) {
            continue;
        }
        let bad = rec.flags.contains(InodeFlags::BAD_DOT);
        if !bad && !rec.flags.contains(InodeFlags::REPARENTED) {
            continue;
        }
        let (id, parent) = (rec.id, rec.parent);
        if !ctx.repairing() {
            ctx.problem(
                ProblemKind::DotEntry,
                Some(ino),
                format!("`.` or `..` of {id} does not name {id} and {parent}"),
            );
            continue;
        }
        let fixed = rewrite_dots(ctx, ino, id, parent)?;
        match (bad, fixed) {
            (true, true) => ctx.problem(
                ProblemKind::DotEntry,
                Some(ino),
                format!("`.` and `..` of {id} now name {id} and {parent}"),
            ),
            (_, false) => ctx.unrepaired(
                ProblemKind::DotEntry,
                Some(ino),
                format!("first block of {id} has no `.` and `..` to rewrite"),
            ),
            (false, true) => debug!(%id, %parent, "`..` follows the new parent"),
        }
    }
    Ok(())
}

fn rewrite_dots(ctx: &mut FsckContext<'_>, ino: u32, id: InodeId, parent: InodeId) -> Result<bool> {
    let dir = ctx.table.read_inode(&ctx.io, ino)?;
    let Mapping::Mapped { ord, block, .. } = file::resolve(&ctx.sb, &ctx.io, &dir, 0)? else {
        return Ok(false);
    };
    let mut bytes = match ctx.io.read(ord, block, DIR_BLK) {
        Ok(bytes) => bytes,
        Err(QfsError::Io(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    let Ok(entries) = parse_dir_block(&bytes) else {
        return Ok(false);
    };
    let (Some(dot), Some(dotdot)) = (entries.first(), entries.get(1)) else {
        return Ok(false);
    };
    if !dot.is_dot() || !dotdot.is_dotdot() {
        return Ok(false);
    }
    set_entry_target(&mut bytes, dot.offset, id)?;
    set_entry_target(&mut bytes, dotdot.offset, parent)?;
    ctx.io.write(ord, block, &bytes)?;
    Ok(true)
}

// ── Counts ──────────────────────────────────────────────────────────────────

fn count_subdirs(ctx: &mut FsckContext<'_>) {
    for ino in ctx.ledger.inodes() {
        if let Some(rec) = ctx.ledger.get_mut(ino) {
            rec.subdirs = 0;
        }
    }
    for ino in ctx.ledger.inodes() {
        if ino == InodeNumber::ROOT.0 {
            continue;
        }
        let Some(parent) = ctx
            .ledger
            .get(ino)
            .filter(|r| r.in_use() && r.is_dir())
            .map(|r| r.parent)
        else {
            continue;
        };
        if ctx.ledger.is_live_dir(parent) {
            if let Some(rec) = ctx.ledger.get_mut(parent.ino.0) {
                rec.subdirs += 1;
            }
        }
    }
}

/// Links the namespace holds on an inode, or `None` when they cannot be
/// known.
fn expected_links(ino: u32, kind: Option<InodeKind>, named: u32, subdirs: u32) -> Option<u32> {
    match kind? {
        InodeKind::Directory => {
            let from_parent = if ino == InodeNumber::ROOT.0 { 1 } else { named };
            Some(from_parent + 1 + subdirs)
        }
        InodeKind::SegmentMember => Some(1),
        InodeKind::Extension(_) => None,
        _ if named == 0 => None,
        _ => Some(named),
    }
}

fn check_counts(ctx: &mut FsckContext<'_>) -> Result<()> {
    count_subdirs(ctx);
    let worm_v2 = ctx.sb.option_mask.contains(OptionMask::WORM_V2);
    for ino in ctx.ledger.inodes() {
        ctx.options.check_cancelled()?;
        let Some(rec) = ctx.ledger.get(ino) else {
            continue;
        };
        if !rec.in_use() || rec.is_extension() || rec.flags.contains(InodeFlags::UNRESOLVED) {
            continue;
        }
        let links = expected_links(ino, rec.kind, rec.named_refs, rec.subdirs);
        let (seen, io_error) = (rec.blocks_seen, rec.flags.contains(InodeFlags::IO_ERROR));
        // A losing claimant stopped counting at the shared block.
        let dup_loser = rec.flags.contains(InodeFlags::DUP_LOSER);

        let mut inode = ctx.table.read_inode(&ctx.io, ino)?;
        let mut dirty = false;
        if let Some(links) = links.filter(|l| *l != inode.nlink) {
            ctx.problem(
                ProblemKind::LinkCount,
                Some(ino),
                format!("link count {} should be {links}", inode.nlink),
            );
            inode.nlink = links;
            dirty = true;
        }
        if !io_error && !dup_loser && inode.blocks != seen {
            ctx.problem(
                ProblemKind::BlockCount,
                Some(ino),
                format!("block count {} should be {seen}", inode.blocks),
            );
            if ctx.repairing() {
                ctx.quota.uncount(&inode);
                inode.blocks = seen;
                ctx.quota.count(&inode);
            }
            dirty = true;
        }
        if worm_v2 && ctx.repairing() && inode.needs_worm_upgrade() {
            ctx.problem(
                ProblemKind::WormUpgrade,
                Some(ino),
                "retention period converted to an expiry time".to_owned(),
            );
            inode.upgrade_worm();
            dirty = true;
        }
        if dirty && ctx.repairing() {
            ctx.table.write_inode(&ctx.io, &inode)?;
        }
    }
    Ok(())
}

// ── Purge ───────────────────────────────────────────────────────────────────

/// Remove every directory entry that names an inode this run freed.
fn purge_entries(ctx: &mut FsckContext<'_>, freed: &BTreeSet<InodeId>) -> Result<()> {
    for ino in ctx.ledger.inodes() {
        if !ctx.ledger.get(ino).is_some_and(|r| r.in_use() && r.is_dir()) {
            continue;
        }
        let dir = ctx.table.read_inode(&ctx.io, ino)?;
        for offset in file::dir_block_offsets(&dir) {
            let Mapping::Mapped { ord, block, .. } = file::resolve(&ctx.sb, &ctx.io, &dir, offset)? else {
                continue;
            };
            let Ok(mut bytes) = ctx.io.read(ord, block, DIR_BLK) else {
                continue;
            };
            let Ok(entries) = parse_dir_block(&bytes) else {
                continue;
            };
            let mut dirty = false;
            for entry in entries.iter().filter(|e| freed.contains(&e.id)) {
                if entry.is_dot() || entry.is_dotdot() {
                    continue;
                }
                remove_entry_at(&mut bytes, entry.offset)?;
                dirty = true;
                debug!(dir = ino, name = %entry.name_lossy(), id = %entry.id, "entry of freed inode removed");
            }
            if dirty {
                ctx.io.write(ord, block, &bytes)?;
            }
        }
    }
    Ok(())
}
