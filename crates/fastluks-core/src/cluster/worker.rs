//! Worker node agent: keeps the master's NFS exports mounted locally.

use super::{NfsState, WorkerConfig};
use crate::provider::{CommandRunner, HostProbe};
use log::{debug, info, warn};
use std::path::Path;

pub struct WorkerNode<R, H> {
    config: WorkerConfig,
    runner: R,
    host: H,
}

impl<R, H> WorkerNode<R, H>
where
    R: CommandRunner,
    H: HostProbe,
{
    pub fn new(config: WorkerConfig, runner: R, host: H) -> Self {
        Self {
            config,
            runner,
            host,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// True when every configured mountpoint is mounted.
    pub fn check_status(&self) -> bool {
        self.config.mountpoints.iter().all(|mountpoint| {
            let mounted = self.host.is_mount_point(Path::new(mountpoint));
            debug!("{mountpoint} mounted: {mounted}");
            mounted
        })
    }

    pub fn status(&self) -> NfsState {
        if self.check_status() {
            NfsState::Mounted
        } else {
            NfsState::Unmounted
        }
    }

    /// Mount every configured mountpoint in order. Individual failures are
    /// logged and the next mountpoint is still attempted.
    pub fn mount(&self) -> NfsState {
        if self.check_status() {
            info!("NFS already mounted");
            return NfsState::Mounted;
        }

        let sudo = format!("{}/sudo", self.config.sudo_path);
        for mountpoint in &self.config.mountpoints {
            let out = self.runner.run(&sudo, &["mount", mountpoint], None);
            if out.success() {
                info!("mounted {mountpoint}");
            } else {
                warn!(
                    "mount {mountpoint} exited with {}: {}",
                    out.status,
                    out.diagnostic()
                );
            }
        }
        self.status()
    }
}
