//! Local control of a registered volume: report, open, and close it.
//!
//! These are the operations the control plane invokes through
//! `fastluks status|open|close`; none of them take a workflow lock.

use crate::config::FastluksConfig;
use crate::error::{LuksError, LuksResult};
use crate::luks::{check_tool, Cryptsetup, ToolExit};
use crate::provider::{CommandRunner, HostProbe};
use crate::registry::CryptdevRecord;
use log::{debug, info};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalVolumeStatus {
    Mounted,
    Unmounted,
}

impl LocalVolumeStatus {
    /// Exit status of `fastluks status`.
    pub fn exit_code(self) -> i32 {
        match self {
            LocalVolumeStatus::Mounted => 0,
            LocalVolumeStatus::Unmounted => 1,
        }
    }
}

pub struct LocalVolume<R, H> {
    config: Arc<FastluksConfig>,
    record: CryptdevRecord,
    runner: R,
    host: H,
}

impl<R, H> LocalVolume<R, H>
where
    R: CommandRunner,
    H: HostProbe,
{
    pub fn new(config: Arc<FastluksConfig>, record: CryptdevRecord, runner: R, host: H) -> Self {
        Self {
            config,
            record,
            runner,
            host,
        }
    }

    pub fn record(&self) -> &CryptdevRecord {
        &self.record
    }

    fn cryptsetup(&self) -> Cryptsetup<'_, R> {
        Cryptsetup::new(&self.runner, self.config.cryptsetup_binary())
    }

    fn mapping_open(&self) -> bool {
        self.host.is_block_device(Path::new(&self.record.mapper))
    }

    fn mounted(&self) -> bool {
        self.host.is_mount_point(Path::new(&self.record.mountpoint))
    }

    /// Mounted only when the mapping is active and its mountpoint is mounted.
    pub fn status(&self) -> LocalVolumeStatus {
        let out = self.cryptsetup().status(&self.record.cryptdev);
        debug!(
            "cryptsetup status {} exited with {}: {}",
            self.record.cryptdev,
            out.status,
            out.diagnostic()
        );
        if out.success() && self.mounted() {
            LocalVolumeStatus::Mounted
        } else {
            LocalVolumeStatus::Unmounted
        }
    }

    /// Open the mapping with `secret` when needed and mount it.
    pub fn open(&self, secret: &str) -> LuksResult<LocalVolumeStatus> {
        let record = &self.record;
        if !self.mapping_open() {
            let out = self
                .cryptsetup()
                .open(&record.device, &record.cryptdev, secret);
            if ToolExit::from_code(out.status) == ToolExit::BadPassphrase {
                return Err(LuksError::BadPassphrase);
            }
            check_tool("cryptsetup luksOpen", &out)?;
            info!("opened {} as {}", record.device, record.mapper);
        }

        if !self.mounted() {
            let out = self.runner.run(
                &self.config.binaries.mount,
                &[&record.mapper, &record.mountpoint],
                None,
            );
            check_tool("mount", &out)?;
            info!("mounted {} on {}", record.mapper, record.mountpoint);
        }
        Ok(self.status())
    }

    /// Unmount the filesystem and remove the mapping.
    pub fn close(&self) -> LuksResult<LocalVolumeStatus> {
        let record = &self.record;
        if self.mounted() {
            let out = self
                .runner
                .run(&self.config.binaries.umount, &[&record.mountpoint], None);
            check_tool("umount", &out)?;
            info!("unmounted {}", record.mountpoint);
        }
        if self.mapping_open() {
            check_tool("cryptsetup luksClose", &self.cryptsetup().close(&record.cryptdev))?;
            info!("closed {}", record.mapper);
        }
        Ok(self.status())
    }
}
