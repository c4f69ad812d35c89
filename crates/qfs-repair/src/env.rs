//! What the engine needs to know about the host it runs on.

use qfs_error::Result;
use serde::{Deserialize, Serialize};

/// How the filesystem is currently mounted, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Unmounted,
    ReadOnly,
    ReadWrite,
}

/// Host queries, injected so runs are reproducible in tests.
pub trait Environment {
    fn mount_state(&self, fs_name: &str) -> Result<MountState>;

    fn hostname(&self) -> Result<String>;

    /// Seconds since the epoch, stamped into rewritten superblocks and
    /// created inodes.
    fn now(&self) -> u64;
}

/// Fixed answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticEnvironment {
    pub mount: MountState,
    pub host: String,
    pub now: u64,
}

impl Default for StaticEnvironment {
    fn default() -> Self {
        Self {
            mount: MountState::Unmounted,
            host: "localhost".to_owned(),
            now: 1_800_000_000,
        }
    }
}

impl StaticEnvironment {
    #[must_use]
    pub fn host(mut self, host: &str) -> Self {
        host.clone_into(&mut self.host);
        self
    }

    #[must_use]
    pub fn mounted(mut self, mount: MountState) -> Self {
        self.mount = mount;
        self
    }
}

impl Environment for StaticEnvironment {
    fn mount_state(&self, _fs_name: &str) -> Result<MountState> {
        Ok(self.mount)
    }

    fn hostname(&self) -> Result<String> {
        Ok(self.host.clone())
    }

    fn now(&self) -> u64 {
        self.now
    }
}
