//! Filesystem creation and first mount of a freshly opened LUKS mapping.

use super::encrypt::{EncryptOptions, EncryptReport, VolumeEncryptor};
use super::{write_marker, WorkflowLog, WorkflowReport};
use crate::config::FastluksConfig;
use crate::error::{LuksError, LuksResult};
use crate::lock::ProcessLock;
use crate::provider::{CommandRunner, HostProbe};
use crate::registry::{CryptdevRecord, Registry};
use std::path::Path;
use std::sync::Arc;

/// Exact contents of the volume-setup success file.
pub const SETUP_COMPLETED: &str = "Volume setup completed.";

const TARGET: &str = "fastluks::volume_setup";

pub struct VolumeSetup<R, H> {
    config: Arc<FastluksConfig>,
    runner: R,
    host: H,
}

impl<R, H> VolumeSetup<R, H>
where
    R: CommandRunner,
    H: HostProbe,
{
    pub fn new(config: Arc<FastluksConfig>, runner: R, host: H) -> Self {
        Self {
            config,
            runner,
            host,
        }
    }

    /// Set up the volume described by the registry.
    pub fn run(&self) -> LuksResult<WorkflowReport> {
        let registry = Registry::load(self.config.registry_path())?;
        self.run_for(registry.record()?)
    }

    /// Create the filesystem on `record`'s mapping and mount it.
    pub fn run_for(&self, record: &CryptdevRecord) -> LuksResult<WorkflowReport> {
        let cfg = &self.config;
        let mut log = WorkflowLog::new(TARGET);
        let lock = ProcessLock::acquire(&cfg.paths.setup_lock)?;

        self.require_mapping(record, &mut log)?;

        if self.host.is_mount_point(Path::new(&record.mountpoint)) {
            log.info(format!(
                "{} is already mounted; leaving the filesystem untouched",
                record.mountpoint
            ));
        } else {
            if cfg.paranoid {
                self.wipe(record, &mut log);
            }
            self.create_filesystem(record, &mut log)?;
            self.mount(record, &mut log);
        }

        write_marker(&cfg.paths.setup_success, SETUP_COMPLETED)?;
        log.success(SETUP_COMPLETED);
        lock.release()?;
        Ok(log.into_report(format!("Set up {}", record.mapper)))
    }

    /// Mount an existing filesystem on `record`'s mapping without formatting.
    pub fn mount_existing(&self, record: &CryptdevRecord) -> LuksResult<WorkflowReport> {
        let mut log = WorkflowLog::new(TARGET);
        let lock = ProcessLock::acquire(&self.config.paths.setup_lock)?;
        self.require_mapping(record, &mut log)?;
        if self.host.is_mount_point(Path::new(&record.mountpoint)) {
            log.info(format!("{} is already mounted", record.mountpoint));
        } else {
            self.mount(record, &mut log);
        }
        lock.release()?;
        Ok(log.into_report(format!("Mounted {}", record.mapper)))
    }

    fn require_mapping(&self, record: &CryptdevRecord, log: &mut WorkflowLog) -> LuksResult<()> {
        if self.host.is_block_device(Path::new(&record.mapper)) {
            return Ok(());
        }
        log.error(format!("{} does not exist; open the volume first", record.mapper));
        Err(LuksError::VolumeNotReady(format!(
            "{} is not an open mapping",
            record.mapper
        )))
    }

    fn wipe(&self, record: &CryptdevRecord, log: &mut WorkflowLog) {
        log.security(format!(
            "Paranoid mode: overwriting {} with zeros, this may take a while",
            record.mapper
        ));
        let target = format!("of={}", record.mapper);
        let out = self.runner.run(
            &self.config.binaries.dd,
            &["if=/dev/zero", &target, "bs=1M", "status=progress"],
            None,
        );
        // dd stops with "No space left on device" once the mapping is full.
        log.command("dd", &out);
        log.info("Wiping done");
    }

    fn create_filesystem(&self, record: &CryptdevRecord, log: &mut WorkflowLog) -> LuksResult<()> {
        log.info(format!(
            "Creating {} filesystem on {}",
            record.filesystem, record.mapper
        ));
        let out = self.runner.run(
            &self.config.binaries.mkfs,
            &["-t", &record.filesystem, &record.mapper],
            None,
        );
        log.command("mkfs", &out);
        if !out.success() {
            log.error(format!(
                "mkfs -t {} failed with exit code {}: {}",
                record.filesystem,
                out.status,
                out.diagnostic()
            ));
            return Err(LuksError::FilesystemCreation(record.mapper.clone()));
        }
        Ok(())
    }

    fn mount(&self, record: &CryptdevRecord, log: &mut WorkflowLog) {
        let cfg = &self.config;
        let out = self.runner.run(
            &cfg.binaries.mount,
            &[&record.mapper, &record.mountpoint],
            None,
        );
        log.command("mount", &out);
        if out.success() {
            log.success(format!("Mounted {} on {}", record.mapper, record.mountpoint));
        } else {
            log.warn(format!(
                "mount {} {} exited with {}: {}",
                record.mapper,
                record.mountpoint,
                out.status,
                out.diagnostic()
            ));
        }
        log.command("df -Hv", &self.runner.run(&cfg.binaries.df, &["-Hv"], None));
    }
}

/// Encrypt the configured device, then set up its filesystem.
///
/// A device that was already encrypted keeps its data: its mapping is only
/// mounted.
pub fn encrypt_and_setup<R, H>(
    encryptor: &VolumeEncryptor<R, H>,
    options: EncryptOptions,
) -> LuksResult<(EncryptReport, WorkflowReport)>
where
    R: CommandRunner,
    H: HostProbe,
{
    let encrypted = encryptor.encrypt(options)?;
    let setup = VolumeSetup::new(
        Arc::clone(encryptor.config()),
        encryptor.runner(),
        encryptor.host(),
    );
    let report = if encrypted.already_encrypted {
        setup.mount_existing(&encrypted.record)?
    } else {
        setup.run_for(&encrypted.record)?
    };
    Ok((encrypted, report))
}
