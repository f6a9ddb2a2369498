//! [`HostProbe`] answered from the live filesystem.

use crate::parse::distro_id;
use fastluks_core::provider::HostProbe;
use log::debug;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

pub const OS_RELEASE_PATHS: &[&str] = &["/etc/os-release", "/usr/lib/os-release"];

#[derive(Debug, Clone)]
pub struct SystemHost {
    os_release: Vec<PathBuf>,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            os_release: OS_RELEASE_PATHS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl SystemHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the distribution from `path` instead of the standard locations.
    pub fn with_os_release(path: impl Into<PathBuf>) -> Self {
        Self {
            os_release: vec![path.into()],
        }
    }
}

/// True when the effective user is root.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

impl HostProbe for SystemHost {
    /// A directory is a mount point when it sits on a different device than
    /// its parent, or shares its parent's inode (the root directory).
    fn is_mount_point(&self, path: &Path) -> bool {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return false;
        };
        if !meta.is_dir() {
            return false;
        }
        let Ok(parent) = fs::metadata(path.join("..")) else {
            return false;
        };
        meta.dev() != parent.dev() || meta.ino() == parent.ino()
    }

    fn is_block_device(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|meta| meta.file_type().is_block_device())
            .unwrap_or(false)
    }

    fn distro_id(&self) -> Option<String> {
        self.os_release.iter().find_map(|path| match fs::read_to_string(path) {
            Ok(contents) => distro_id(&contents),
            Err(err) => {
                debug!("unable to read {}: {err}", path.display());
                None
            }
        })
    }
}
