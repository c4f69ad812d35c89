//! Hard-link-parent lists: the extension inodes naming every directory
//! other than the parent that holds an entry for a multiply-linked inode.

use crate::context::FsckContext;
use crate::ledger::InodeKind;
use crate::report::ProblemKind;
use qfs_error::{QfsError, Result};
use qfs_ondisk::ExtensionKind;
use qfs_types::{InodeId, MAX_EXT_CHAIN};
use std::collections::BTreeSet;
use tracing::debug;

/// Proven hard-link-parents extensions on the chain of `ino`, in chain
/// order.
fn list_extensions(ctx: &FsckContext<'_>, ino: u32) -> Vec<InodeId> {
    let Some(base) = ctx.ledger.get(ino) else {
        return Vec::new();
    };
    let (base_id, mut next) = (base.id, base.ext);
    let mut found = Vec::new();
    for _ in 0..MAX_EXT_CHAIN {
        let Some(rec) = ctx
            .ledger
            .resolve(next)
            .filter(|r| r.proven && r.is_extension() && r.parent == base_id)
        else {
            break;
        };
        if rec.kind == Some(InodeKind::Extension(ExtensionKind::HardLinkParents)) {
            found.push(rec.id);
        }
        next = rec.ext;
    }
    found
}

fn listed_parents(ctx: &FsckContext<'_>, exts: &[InodeId]) -> Result<Vec<InodeId>> {
    let mut parents = Vec::new();
    for ext in exts {
        let ext = ctx.table.read_extension(&ctx.io, ext.ino.0)?;
        parents.extend(
            ext.hard_link_parents()
                .map_err(|e| QfsError::InodeTable(format!("extension {}: {e}", ext.id)))?,
        );
    }
    Ok(parents)
}

/// Spread `parents` over the list extensions; extensions past the last
/// parent are left empty. Callers keep `parents` within capacity.
fn rewrite(ctx: &FsckContext<'_>, exts: &[InodeId], parents: &[InodeId]) -> Result<()> {
    let mut rest = parents;
    for id in exts {
        let mut ext = ctx.table.read_extension(&ctx.io, id.ino.0)?;
        let take = rest.len().min(usize::from(ext.kind.capacity()));
        ext.set_hard_link_parents(&rest[..take])
            .map_err(|e| QfsError::InodeTable(format!("extension {}: {e}", ext.id)))?;
        ctx.table.write_extension(&ctx.io, &ext)?;
        rest = &rest[take..];
    }
    Ok(())
}

/// Compare the recorded list with the directories found naming `ino`.
pub(crate) fn check(ctx: &mut FsckContext<'_>, ino: u32) -> Result<()> {
    let exts = list_extensions(ctx, ino);
    if exts.is_empty() {
        return Ok(());
    }
    let listed: BTreeSet<InodeId> = listed_parents(ctx, &exts)?.into_iter().collect();
    let naming: BTreeSet<InodeId> = ctx.ledger.alt_parents(ino).iter().copied().collect();
    if listed == naming {
        return Ok(());
    }
    let stale: Vec<String> = listed.difference(&naming).map(ToString::to_string).collect();
    let missing: Vec<String> = naming.difference(&listed).map(ToString::to_string).collect();
    let want: Vec<InodeId> = naming.into_iter().collect();
    let capacity: usize = exts.len() * usize::from(ExtensionKind::HardLinkParents.capacity());
    let detail = format!(
        "hard-link parents list [{}] which do not name it and miss [{}]",
        stale.join(", "),
        missing.join(", ")
    );
    if want.len() > capacity {
        ctx.unrepaired(
            ProblemKind::Extension,
            Some(ino),
            format!("{detail}; {} parents exceed the {capacity} slots", want.len()),
        );
        return Ok(());
    }
    ctx.problem(ProblemKind::Extension, Some(ino), detail);
    if ctx.repairing() {
        rewrite(ctx, &exts, &want)?;
        debug!(ino, parents = want.len(), "hard-link parents rewritten");
    }
    Ok(())
}

/// Take `dir` off the list of `ino` once it no longer names the inode
/// through an alternate entry.
pub(crate) fn drop_parent(ctx: &mut FsckContext<'_>, ino: u32, dir: InodeId) -> Result<()> {
    if !ctx.repairing() {
        return Ok(());
    }
    let exts = list_extensions(ctx, ino);
    if exts.is_empty() {
        return Ok(());
    }
    let listed = listed_parents(ctx, &exts)?;
    if !listed.contains(&dir) {
        return Ok(());
    }
    let kept: Vec<InodeId> = listed.into_iter().filter(|p| *p != dir).collect();
    rewrite(ctx, &exts, &kept)?;
    debug!(ino, %dir, "hard-link parent dropped");
    Ok(())
}
