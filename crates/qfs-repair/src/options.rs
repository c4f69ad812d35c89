use qfs_error::{QfsError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Longest filesystem name the superblock stores.
pub const MAX_FS_NAME_LEN: usize = 31;

/// Direction of a shared-filesystem conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedConversion {
    ToShared,
    ToUnshared,
}

/// What a run may do and how.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsckOptions {
    /// Write fixes. Without it nothing on the devices changes.
    pub repair: bool,
    /// Recompute every directory name hash and enable hashing.
    pub regen_dir_hash: bool,
    /// New filesystem name, applied during repair.
    pub rename: Option<String>,
    /// Report only the superblock fsck-request bits.
    pub preen: bool,
    pub convert_shared: Option<SharedConversion>,
    /// Where the working bitmaps and duplicate ledger spill; the system
    /// temporary directory when `None`.
    pub scratch_dir: Option<PathBuf>,
    /// Leave orphans whose parent may be offline where they are.
    pub allow_offline_parents: bool,
    /// The caller vouches that a mounted filesystem is quiescent.
    pub mount_known_safe: bool,
    /// Expected filesystem name; a mismatch is a configuration error.
    pub fs_name: Option<String>,
    /// Set asynchronously to stop the run at the next inode boundary.
    #[serde(skip)]
    pub shutdown: Arc<AtomicBool>,
}

impl FsckOptions {
    #[must_use]
    pub fn check_only() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn repairing() -> Self {
        Self {
            repair: true,
            ..Self::default()
        }
    }

    /// Whether the run may write to the devices at all.
    #[must_use]
    pub fn writes(&self) -> bool {
        self.repair || self.regen_dir_hash
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(QfsError::Cancelled);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.rename {
            if name.is_empty() || name.len() > MAX_FS_NAME_LEN {
                return Err(QfsError::Config(format!(
                    "filesystem name must be 1 to {MAX_FS_NAME_LEN} bytes, got {}",
                    name.len()
                )));
            }
            if name.bytes().any(|b| b == 0 || b == b'/' || b.is_ascii_whitespace()) {
                return Err(QfsError::Config(format!("invalid filesystem name {name:?}")));
            }
            if !self.repair {
                return Err(QfsError::Config("renaming requires repair mode".into()));
            }
        }
        if self.convert_shared.is_some() && !self.repair {
            return Err(QfsError::Config(
                "shared conversion requires repair mode".into(),
            ));
        }
        if let Some(dir) = &self.scratch_dir {
            if !dir.is_dir() {
                return Err(QfsError::Config(format!(
                    "scratch directory {} does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_needs_repair_and_a_sane_name() {
        let mut opts = FsckOptions {
            rename: Some("samfs2".into()),
            ..FsckOptions::default()
        };
        assert!(matches!(opts.validate(), Err(QfsError::Config(_))));
        opts.repair = true;
        opts.validate().expect("valid rename");
        opts.rename = Some("x".repeat(MAX_FS_NAME_LEN + 1));
        assert!(matches!(opts.validate(), Err(QfsError::Config(_))));
        opts.rename = Some(String::new());
        assert!(matches!(opts.validate(), Err(QfsError::Config(_))));
    }

    #[test]
    fn conversion_needs_repair() {
        let mut opts = FsckOptions {
            convert_shared: Some(SharedConversion::ToShared),
            ..FsckOptions::default()
        };
        assert!(opts.validate().is_err());
        opts.repair = true;
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn missing_scratch_dir_is_config_error() {
        let opts = FsckOptions {
            scratch_dir: Some(PathBuf::from("/nonexistent/qfsck-scratch")),
            ..FsckOptions::default()
        };
        assert!(matches!(opts.validate(), Err(QfsError::Config(_))));
    }

    #[test]
    fn shutdown_flag_cancels() {
        let opts = FsckOptions::repairing();
        assert!(opts.writes());
        opts.check_cancelled().expect("not cancelled");
        opts.shutdown.store(true, Ordering::Relaxed);
        assert!(matches!(opts.check_cancelled(), Err(QfsError::Cancelled)));
    }

    #[test]
    fn options_serialize_without_the_flag() {
        let opts = FsckOptions {
            preen: true,
            ..FsckOptions::default()
        };
        let json = serde_json::to_string(&opts).expect("json");
        assert!(!json.contains("shutdown"));
        let back: FsckOptions = serde_json::from_str(&json).expect("parse");
        assert!(back.preen);
    }
}
