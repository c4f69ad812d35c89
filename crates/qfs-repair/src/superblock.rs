//! Superblock selection and device reconciliation.
//!
//! Every device carries a primary and a backup copy. Devices arrive in no
//! particular order and are placed by the ordinal recorded in their own
//! best copy; the master superblock is the best copy on ordinal 0.

use crate::env::{Environment, MountState};
use crate::file;
use crate::inodes::InodeTable;
use crate::options::{FsckOptions, SharedConversion};
use qfs_alloc::{BitmapGeometry, check_system_area, validate_layout};
use qfs_block::{BlockIo, ByteDevice};
use qfs_error::{QfsError, Result};
use qfs_ondisk::{FileType, HostsTable, Inode, Superblock, SuperblockVersion};
use qfs_types::{
    BACKUP_SUPERBLK, DEV_BSIZE, InodeNumber, Ordinal, ParseError, SUPERBLK, SUPERBLOCK_SIZE,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Block numbers of the two copies, primary first.
pub(crate) const COPY_BLOCKS: [u64; 2] = [SUPERBLK, BACKUP_SUPERBLK];

/// Both copies found on one device.
pub(crate) struct DeviceCopies {
    pub device: Arc<dyn ByteDevice>,
    copies: [std::result::Result<Superblock, ParseError>; 2],
}

impl DeviceCopies {
    /// Valid copy with the newest update time; the primary wins ties.
    fn best(&self) -> Option<&Superblock> {
        let mut best: Option<&Superblock> = None;
        for sb in self.copies.iter().filter_map(|c| c.as_ref().ok()) {
            if best.is_none_or(|b| sb.update_time > b.update_time) {
                best = Some(sb);
            }
        }
        best
    }
}

/// Devices placed by ordinal, the master superblock and the copies that
/// need rewriting.
pub(crate) struct Placement {
    pub sb: Superblock,
    pub devices: Vec<Option<Arc<dyn ByteDevice>>>,
    /// (ordinal, block) of every copy that disagrees with the master.
    pub stale: Vec<(Ordinal, u64)>,
}

fn read_copy(device: &dyn ByteDevice, block: u64) -> Result<std::result::Result<Superblock, ParseError>> {
    let mut buf = vec![0_u8; SUPERBLOCK_SIZE];
    device.read_exact_at(block * u64::from(DEV_BSIZE), &mut buf)?;
    Ok(Superblock::parse_superblock_region(&buf))
}

/// Read both copies from every device.
pub(crate) fn read_copies(devices: Vec<Arc<dyn ByteDevice>>) -> Result<Vec<DeviceCopies>> {
    if devices.is_empty() {
        return Err(QfsError::Config("no devices given".to_owned()));
    }
    devices
        .into_iter()
        .enumerate()
        .map(|(idx, device)| {
            let primary = read_copy(device.as_ref(), SUPERBLK)?;
            let backup = read_copy(device.as_ref(), BACKUP_SUPERBLK)?;
            let found = DeviceCopies {
                device,
                copies: [primary, backup],
            };
            if found.best().is_none() {
                let foreign = found
                    .copies
                    .iter()
                    .find_map(|c| match c {
                        Err(e @ ParseError::ForeignByteOrder { .. }) => Some(e.to_string()),
                        _ => None,
                    });
                return Err(match foreign {
                    Some(detail) => QfsError::ByteOrder(format!("device {idx}: {detail}")),
                    None => QfsError::Superblock(format!("device {idx} has no valid superblock")),
                });
            }
            Ok(found)
        })
        .collect()
}

/// Place every device at its ordinal and choose the master superblock.
pub(crate) fn reconcile(found: Vec<DeviceCopies>) -> Result<Placement> {
    let mut master: Option<Superblock> = None;
    for copies in &found {
        if let Some(sb) = copies.best().filter(|sb| sb.ord == Ordinal(0)) {
            if master.is_some() {
                return Err(QfsError::Topology("two devices claim ordinal 0".to_owned()));
            }
            master = Some(sb.clone());
        }
    }
    let master = master.ok_or_else(|| QfsError::Topology("no device holds ordinal 0".to_owned()))?;

    let mut devices: Vec<Option<Arc<dyn ByteDevice>>> = vec![None; usize::from(master.fs_count)];
    let mut stale = Vec::new();
    for copies in found {
        let Some(best) = copies.best() else {
            continue;
        };
        if !best.same_filesystem(&master) {
            return Err(QfsError::Topology(format!(
                "device for ordinal {} belongs to filesystem {:#x}, not {:#x}",
                best.ord, best.fs_id, master.fs_id
            )));
        }
        let ord = best.ord;
        let Some(slot) = devices.get_mut(ord.index()) else {
            return Err(QfsError::Topology(format!(
                "ordinal {ord} outside the {} devices of {}",
                master.fs_count, master.name
            )));
        };
        if slot.is_some() {
            return Err(QfsError::Topology(format!("two devices claim ordinal {ord}")));
        }
        let mut expected = master.clone();
        expected.ord = ord;
        for (block, copy) in COPY_BLOCKS.iter().zip(&copies.copies) {
            if copy.as_ref().ok() != Some(&expected) {
                debug!(%ord, block, "superblock copy disagrees with the master");
                stale.push((ord, *block));
            }
        }
        *slot = Some(copies.device);
    }

    for (idx, slot) in devices.iter().enumerate() {
        let entry = &master.eq[idx];
        if slot.is_none() && !entry.is_down() {
            return Err(QfsError::Topology(format!(
                "ordinal {} (eq {}) is missing",
                entry.ord, entry.eq
            )));
        }
    }
    info!(
        name = %master.name,
        devices = devices.iter().flatten().count(),
        stale = stale.len(),
        "devices reconciled"
    );
    Ok(Placement {
        sb: master,
        devices,
        stale,
    })
}

/// Checks of the master superblock that gate any further work.
pub(crate) fn validate_master(sb: &Superblock, options: &FsckOptions) -> Result<()> {
    let unknown = sb.option_mask.unknown_bits(sb.version);
    if unknown != 0 {
        return Err(QfsError::OptionMismatch { unknown });
    }
    if let Some(name) = &options.fs_name {
        if *name != sb.name {
            return Err(QfsError::Config(format!(
                "devices hold filesystem {}, not {name}",
                sb.name
            )));
        }
    }
    if options.regen_dir_hash && sb.version != SuperblockVersion::V2a {
        return Err(QfsError::Config(format!(
            "directory hashes need a version 2A superblock, {} is {:?}",
            sb.name, sb.version
        )));
    }
    validate_layout(sb)?;
    for geom in BitmapGeometry::for_filesystem(sb)? {
        check_system_area(sb, geom.ord)?;
    }
    Ok(())
}

/// Refuse to work on a filesystem that is in use.
pub(crate) fn check_mount(sb: &Superblock, options: &FsckOptions, env: &dyn Environment) -> Result<()> {
    if options.mount_known_safe {
        return Ok(());
    }
    match env.mount_state(&sb.name)? {
        MountState::Unmounted => Ok(()),
        MountState::ReadOnly if !options.writes() => Ok(()),
        state => {
            warn!(name = %sb.name, ?state, "filesystem is mounted");
            Err(QfsError::Mounted(sb.name.clone()))
        }
    }
}

fn hosts_inode(sb: &Superblock, io: &BlockIo, table: &InodeTable) -> Result<Option<Inode>> {
    let raw = table.read_slot(io, InodeNumber::HOSTS.0)?;
    let Ok(inode) = Inode::parse_from_bytes(&raw) else {
        return Ok(None);
    };
    let usable = !inode.is_free()
        && inode.file_type() == FileType::Regular
        && inode.id.ino == InodeNumber::HOSTS
        && inode.size > 0;
    debug!(usable, shared = sb.shared, "hosts inode examined");
    Ok(usable.then_some(inode))
}

/// Shared filesystems are repaired only from the metadata server, and
/// converting to shared needs a host table.
pub(crate) fn check_hosts(
    sb: &Superblock,
    io: &BlockIo,
    table: &InodeTable,
    options: &FsckOptions,
    env: &dyn Environment,
) -> Result<()> {
    let wants_shared = options.convert_shared == Some(SharedConversion::ToShared);
    if !(sb.shared && options.writes()) && !wants_shared {
        return Ok(());
    }
    let Some(inode) = hosts_inode(sb, io, table)? else {
        return Err(QfsError::Config(format!("{} has no usable .hosts table", sb.name)));
    };
    if !sb.shared {
        return Ok(());
    }
    let bytes = file::read_range(sb, io, &inode, 0, DEV_BSIZE as usize)?
        .ok_or_else(|| QfsError::Config("cannot read the .hosts table".to_owned()))?;
    let hosts = HostsTable::parse_from_bytes(&bytes)
        .map_err(|e| QfsError::Config(format!(".hosts table: {e}")))?;
    let server = hosts.server_name().unwrap_or_default().to_owned();
    let local = env.hostname()?;
    if local != server {
        return Err(QfsError::NotMetadataServer { local, server });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfs_harness::ImageBuilder;

    #[test]
    fn devices_are_placed_by_their_own_ordinal() {
        let image = ImageBuilder::new().format().expect("format").commit().expect("commit");
        let mut devices = image.devices();
        devices.reverse();
        let placement = reconcile(read_copies(devices).expect("read")).expect("reconcile");
        assert_eq!(placement.sb, *image.superblock());
        assert_eq!(placement.devices.len(), 2);
        assert!(placement.devices.iter().all(Option::is_some));
        assert!(placement.stale.is_empty());
    }

    #[test]
    fn newer_backup_wins_and_primary_goes_stale() {
        let image = ImageBuilder::new().format().expect("format").commit().expect("commit");
        let mut newer = image.superblock().clone();
        newer.update_time += 10;
        image
            .write_superblock_bytes(0, BACKUP_SUPERBLK, &newer.to_bytes().expect("bytes"))
            .expect("write");
        let placement = reconcile(read_copies(image.devices()).expect("read")).expect("reconcile");
        assert_eq!(placement.sb.update_time, newer.update_time);
        assert!(placement.stale.contains(&(Ordinal(0), SUPERBLK)));
        assert!(placement.stale.contains(&(Ordinal(1), SUPERBLK)));
        assert!(!placement.stale.contains(&(Ordinal(0), BACKUP_SUPERBLK)));
    }

    #[test]
    fn missing_ordinal_is_a_topology_error() {
        let image = ImageBuilder::new().format().expect("format").commit().expect("commit");
        let devices = image.devices().into_iter().take(1).collect();
        let err = reconcile(read_copies(devices).expect("read")).err().expect("must fail");
        assert!(matches!(err, QfsError::Topology(_)));
    }

    #[test]
    fn foreign_device_is_a_topology_error() {
        let image = ImageBuilder::new().format().expect("format").commit().expect("commit");
        let other = ImageBuilder::new()
            .fs_id(0xBEEF)
            .format()
            .expect("format")
            .commit()
            .expect("commit");
        let devices = vec![image.devices()[0].clone(), other.devices()[1].clone()];
        let err = reconcile(read_copies(devices).expect("read")).err().expect("must fail");
        assert!(matches!(err, QfsError::Topology(_)));
    }

    #[test]
    fn byte_swapped_copies_are_a_byte_order_error() {
        let image = ImageBuilder::new().format().expect("format").commit().expect("commit");
        for block in COPY_BLOCKS {
            let mut bytes = image.superblock().to_bytes().expect("bytes");
            bytes[..4].reverse();
            image.write_superblock_bytes(0, block, &bytes).expect("write");
        }
        let err = read_copies(image.devices()).err().expect("must fail");
        assert!(matches!(err, QfsError::ByteOrder(_)));
    }

    #[test]
    fn unknown_option_bits_stop_the_run() {
        let mut image = ImageBuilder::new().format().expect("format").commit().expect("commit");
        image.set_option_bits(0x100).expect("bits");
        let placement = reconcile(read_copies(image.devices()).expect("read")).expect("reconcile");
        let err = validate_master(&placement.sb, &FsckOptions::default()).expect_err("must fail");
        assert!(matches!(err, QfsError::OptionMismatch { unknown: 0x100 }));
    }
}
