//! The `lost+found` directory orphans are moved into.

use crate::context::FsckContext;
use crate::file::{self, Mapping};
use crate::ledger::InodeRecord;
use crate::report::ProblemKind;
use qfs_dir::{add_entry, init_dir_block, init_empty_block};
use qfs_error::{QfsError, Result};
use qfs_extent::{DauGeometry, Location, translate};
use qfs_ondisk::{ExtentPtr, FileType, Inode};
use qfs_types::{DEV_BSIZE, DIR_BLK, InodeId, InodeNumber, Ordinal, S_IFDIR};
use tracing::{debug, info};

pub(crate) const LOST_FOUND: &str = "lost+found";

/// Where relocated orphans go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LostFound {
    Dir(InodeId),
    /// Check-only run without a usable directory; relocations are reported
    /// as they would happen.
    Simulated,
    /// No directory and none could be made.
    Unavailable,
}

/// Find `lost+found` in the root, creating it in repair mode.
pub(crate) fn locate(ctx: &mut FsckContext<'_>) -> Result<LostFound> {
    let root = ctx.table.read_inode(&ctx.io, InodeNumber::ROOT.0)?;
    if let Some(entry) = file::lookup(&ctx.sb, &ctx.io, &root, LOST_FOUND.as_bytes())? {
        if ctx.ledger.is_live_dir(entry.id) {
            debug!(id = %entry.id, "lost+found found");
            return Ok(LostFound::Dir(entry.id));
        }
    }
    if !ctx.repairing() {
        ctx.problem(ProblemKind::LostFound, None, format!("no usable {LOST_FOUND} directory"));
        return Ok(LostFound::Simulated);
    }
    match create(ctx, root)? {
        Some(id) => {
            ctx.problem(ProblemKind::LostFound, Some(id.ino.0), format!("created {LOST_FOUND}"));
            Ok(LostFound::Dir(id))
        }
        None => {
            ctx.unrepaired(
                ProblemKind::LostFound,
                None,
                format!("cannot create {LOST_FOUND}: no free inode or directory space"),
            );
            Ok(LostFound::Unavailable)
        }
    }
}

/// Claim `len` free blocks on `ord` in the working bitmap.
fn alloc_blocks(ctx: &mut FsckContext<'_>, ord: Ordinal, len: u64) -> Result<Option<u64>> {
    let Some(map) = ctx.maps.get_mut(&ord) else {
        return Ok(None);
    };
    let Some(block) = map.find_free(len)? else {
        return Ok(None);
    };
    map.claim(block, len)?;
    Ok(Some(block))
}

fn create(ctx: &mut FsckContext<'_>, mut root: Inode) -> Result<Option<InodeId>> {
    let Some(slot) = ctx
        .ledger
        .inodes()
        .filter(|ino| *ino >= InodeNumber::FIRST_USER.0)
        .find_map(|ino| ctx.ledger.get(ino).filter(|r| r.is_vacant()).map(|r| r.id))
    else {
        return Ok(None);
    };
    let id = InodeId::new(slot.ino.0, slot.generation.0.wrapping_add(1));

    let mut dir = Inode::free(id);
    dir.mode = S_IFDIR | 0o700;
    dir.parent = root.id;
    dir.nlink = 2;
    dir.size = DIR_BLK as u64;
    dir.modify_time = ctx.now;
    dir.change_time = ctx.now;
    dir.create_time = ctx.now;
    let ord = root.extents[0].ord;
    dir.extents[0].ord = ord;

    let geom = DauGeometry::for_inode(&ctx.sb, &dir);
    let len = geom.direct_unit(0) / u64::from(DEV_BSIZE);
    let Some(block) = alloc_blocks(ctx, ord, len)? else {
        return Ok(None);
    };
    let block32 = u32::try_from(block).map_err(|_| QfsError::NoSpace)?;
    dir.extents[0] = ExtentPtr::new(block32, ord.0);
    dir.blocks = len;

    let mut bytes = vec![0_u8; DIR_BLK];
    init_dir_block(&mut bytes, id, root.id, ctx.entry_hash(b".") != 0)?;
    ctx.io.write(ord, block, &bytes)?;
    ctx.table.write_inode(&ctx.io, &dir)?;

    let mut record = InodeRecord::live(&dir);
    record.proven = true;
    record.blocks_seen = len;
    ctx.ledger.set(id.ino.0, record);
    ctx.quota.count(&dir);
    ctx.report.stats.inodes_in_use += 1;
    ctx.report.stats.directories += 1;

    if !add_entry_growing(ctx, &mut root, LOST_FOUND.as_bytes(), id, FileType::Directory.dirent_code())? {
        return Ok(None);
    }
    root.nlink += 1;
    ctx.table.write_inode(&ctx.io, &root)?;
    if let Some(rec) = ctx.ledger.get_mut(id.ino.0) {
        rec.named_refs = 1;
    }
    info!(%id, ord = %ord, block, "lost+found created");
    Ok(Some(id))
}

/// Add a name to `dir`, appending a directory block when every block is
/// full. Growth stays within the direct extents. Returns `false` when the
/// directory cannot take the entry. Writes `dir` itself only when it grew.
pub(crate) fn add_entry_growing(
    ctx: &mut FsckContext<'_>,
    dir: &mut Inode,
    name: &[u8],
    id: InodeId,
    ftype: u8,
) -> Result<bool> {
    let hash = ctx.entry_hash(name);
    for offset in file::dir_block_offsets(dir) {
        let Mapping::Mapped { ord, block, .. } = file::resolve(&ctx.sb, &ctx.io, dir, offset)? else {
            continue;
        };
        let Ok(mut bytes) = ctx.io.read(ord, block, DIR_BLK) else {
            continue;
        };
        match add_entry(&mut bytes, id, name, ftype, hash) {
            Ok(_) => {
                ctx.io.write(ord, block, &bytes)?;
                return Ok(true);
            }
            Err(QfsError::NoSpace | QfsError::Corruption { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    let geom = DauGeometry::for_inode(&ctx.sb, dir);
    let t = translate(&geom, dir.size)?;
    let Location::Direct { slot, .. } = t.location else {
        debug!(dir = %dir.id, "directory would need an indirect block to grow");
        return Ok(false);
    };
    if t.within == 0 {
        let ord = dir.extents[0].ord;
        let len = t.unit / u64::from(DEV_BSIZE);
        let Some(block) = alloc_blocks(ctx, ord, len)? else {
            return Ok(false);
        };
        let block32 = u32::try_from(block).map_err(|_| QfsError::NoSpace)?;
        ctx.quota.uncount(dir);
        dir.extents[slot] = ExtentPtr::new(block32, ord.0);
        dir.blocks += len;
        ctx.quota.count(dir);
        if let Some(rec) = ctx.ledger.get_mut(dir.id.ino.0) {
            rec.blocks_seen += len;
        }
    }
    let offset = dir.size;
    dir.size += DIR_BLK as u64;
    let Mapping::Mapped { ord, block, .. } = file::resolve(&ctx.sb, &ctx.io, dir, offset)? else {
        return Err(QfsError::Corruption {
            ordinal: dir.extents[0].ord.0,
            block: 0,
            detail: format!("new block of directory {} is unmapped", dir.id),
        });
    };
    let mut bytes = vec![0_u8; DIR_BLK];
    init_empty_block(&mut bytes)?;
    add_entry(&mut bytes, id, name, ftype, hash)?;
    ctx.io.write(ord, block, &bytes)?;
    ctx.table.write_inode(&ctx.io, dir)?;
    debug!(dir = %dir.id, size = dir.size, "directory grown");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::FsckOptions;
    use crate::report::FsckReport;
    use crate::superblock::{read_copies, reconcile};
    use qfs_harness::ImageBuilder;

    fn context<'a>(image: &qfs_harness::TestImage, options: &'a FsckOptions) -> FsckContext<'a> {
        let placement = reconcile(read_copies(image.devices()).expect("read")).expect("reconcile");
        let mut ctx = FsckContext::new(placement, options, 1_800_000_000, FsckReport::new(options.repair))
            .expect("context");
        crate::pass1::run(&mut ctx).expect("pass 1");
        ctx
    }

    #[test]
    fn existing_directory_is_found() {
        let image = ImageBuilder::new().format().expect("format").commit().expect("commit");
        let options = FsckOptions::check_only();
        let mut ctx = context(&image, &options);
        let expected = image.root_entry(LOST_FOUND).expect("entry");
        assert_eq!(locate(&mut ctx).expect("locate"), LostFound::Dir(expected));
        assert!(ctx.report.problems.is_empty());
    }

    #[test]
    fn check_only_run_simulates_a_missing_directory() {
        let image = ImageBuilder::new()
            .without_lost_found()
            .format()
            .expect("format")
            .commit()
            .expect("commit");
        let options = FsckOptions::check_only();
        let mut ctx = context(&image, &options);
        assert_eq!(locate(&mut ctx).expect("locate"), LostFound::Simulated);
        assert_eq!(ctx.report.count_of(ProblemKind::LostFound), 1);
    }

    #[test]
    fn repair_creates_the_directory_under_root() {
        let image = ImageBuilder::new()
            .without_lost_found()
            .format()
            .expect("format")
            .commit()
            .expect("commit");
        let root_links = image.read_inode(2).expect("root").nlink;
        let options = FsckOptions::repairing();
        let mut ctx = context(&image, &options);
        let LostFound::Dir(id) = locate(&mut ctx).expect("locate") else {
            panic!("lost+found not created");
        };
        ctx.io.flush().expect("flush");
        assert_eq!(image.root_entry(LOST_FOUND).expect("entry"), id);
        let dir = image.read_inode(id.ino.0).expect("inode");
        assert!(dir.is_dir());
        assert_eq!(dir.nlink, 2);
        assert_eq!(image.read_inode(2).expect("root").nlink, root_links + 1);
        let entries = image.dir_entries(id.ino.0).expect("entries");
        assert!(entries[0].is_dot() && entries[1].is_dotdot());
        assert_eq!(entries[1].id.ino, InodeNumber::ROOT);
    }

    #[test]
    fn full_directory_grows_by_one_block() {
        let mut draft = ImageBuilder::new().without_quota().format().expect("format");
        let root = InodeId::new(2, 1);
        let dir = draft.mkdir(root, "full").expect("mkdir");
        let image = draft.commit().expect("commit");
        let options = FsckOptions::repairing();
        let mut ctx = context(&image, &options);

        let mut inode = ctx.table.read_inode(&ctx.io, dir.ino.0).expect("dir");
        let target = InodeId::new(3, 1);
        let mut added = 0;
        while inode.size == DIR_BLK as u64 {
            let name = format!("entry-with-a-reasonably-long-name-{added:05}");
            assert!(add_entry_growing(&mut ctx, &mut inode, name.as_bytes(), target, 1).expect("add"));
            added += 1;
        }
        ctx.io.flush().expect("flush");
        let on_disk = image.read_inode(dir.ino.0).expect("dir");
        assert_eq!(on_disk.size, 2 * DIR_BLK as u64);
        assert!(on_disk.blocks > 4);
        let names = image.dir_entries(dir.ino.0).expect("entries");
        assert_eq!(names.len(), added + 2);
    }
}
