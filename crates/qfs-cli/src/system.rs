//! Host queries answered from `/proc` and the system clock.

use qfs_error::{QfsError, Result};
use qfs_repair::{Environment, MountState};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const MOUNTS: &str = "/proc/mounts";
const HOSTNAME: &str = "/proc/sys/kernel/hostname";
const HOSTNAME_FALLBACK: &str = "/etc/hostname";

#[derive(Debug, Clone)]
pub struct SystemEnvironment {
    mounts: PathBuf,
}

impl Default for SystemEnvironment {
    fn default() -> Self {
        Self {
            mounts: PathBuf::from(MOUNTS),
        }
    }
}

/// Mount state of `fs_name` in a mount table in `/proc/mounts` format.
/// The filesystem is mounted under its family-set name, which is the
/// source column.
pub fn parse_mount_table(table: &str, fs_name: &str) -> MountState {
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(_target), Some(_fstype), Some(opts)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if source != fs_name {
            continue;
        }
        if opts.split(',').any(|o| o == "ro") {
            return MountState::ReadOnly;
        }
        return MountState::ReadWrite;
    }
    MountState::Unmounted
}

fn read_trimmed(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let name = raw.trim();
    (!name.is_empty()).then(|| name.to_owned())
}

impl Environment for SystemEnvironment {
    fn mount_state(&self, fs_name: &str) -> Result<MountState> {
        match std::fs::read_to_string(&self.mounts) {
            Ok(table) => Ok(parse_mount_table(&table, fs_name)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.mounts.display(), "no mount table");
                Ok(MountState::Unmounted)
            }
            Err(e) => Err(QfsError::Io(e)),
        }
    }

    fn hostname(&self) -> Result<String> {
        read_trimmed(Path::new(HOSTNAME))
            .or_else(|| read_trimmed(Path::new(HOSTNAME_FALLBACK)))
            .ok_or_else(|| QfsError::Config("cannot determine the host name".to_owned()))
    }

    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
proc /proc proc rw,nosuid,nodev,noexec 0 0
/dev/sda1 / ext4 rw,relatime 0 0
samfs1 /sam1 samfs rw,shared 0 0
samfs2 /sam2 samfs ro,nosuid 0 0
";

    #[test]
    fn mount_state_follows_the_source_column() {
        assert_eq!(parse_mount_table(TABLE, "samfs1"), MountState::ReadWrite);
        assert_eq!(parse_mount_table(TABLE, "samfs2"), MountState::ReadOnly);
        assert_eq!(parse_mount_table(TABLE, "samfs3"), MountState::Unmounted);
        assert_eq!(parse_mount_table("short line\n", "short"), MountState::Unmounted);
    }

    #[test]
    fn missing_mount_table_means_unmounted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = SystemEnvironment {
            mounts: dir.path().join("mounts"),
        };
        assert_eq!(env.mount_state("samfs1").expect("state"), MountState::Unmounted);

        std::fs::write(&env.mounts, TABLE).expect("write");
        assert_eq!(env.mount_state("samfs1").expect("state"), MountState::ReadWrite);
    }
}
