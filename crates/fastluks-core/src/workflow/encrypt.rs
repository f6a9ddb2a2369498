//! One-shot LUKS encryption of a block device.
//!
//! The run holds the encryption lock from start to finish. Every failing step
//! returns an error and the lock guard is released on the way out; a volume
//! that already carries a LUKS header is never formatted again.

use super::{write_marker, WorkflowLog, WorkflowReport};
use crate::config::FastluksConfig;
use crate::error::{LuksError, LuksResult};
use crate::lock::{release_and_abort_if_false, ProcessLock};
use crate::luks::{check_tool, df_source, lsblk_reports_luks, mapper_path, Cryptsetup, ToolExit};
use crate::passphrase::{random_cryptdev_name, resolve_secret, Secret};
use crate::provider::{CommandRunner, HostProbe};
use crate::registry::{write_device_record, CryptdevRecord, Registry};
use crate::secret::{SecretCoordinates, SecretStore};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Exact contents of the encryption success file.
pub const ENCRYPTION_COMPLETED: &str = "LUKS encryption completed.";

const TARGET: &str = "fastluks::encrypt";

/// Caller-supplied secret material for one run.
#[derive(Default)]
pub struct EncryptOptions {
    /// Explicit passphrase. Also used to reopen an already encrypted volume.
    pub passphrase: Option<Secret>,
    pub confirmation: Option<Secret>,
}

/// Outcome of a successful encryption run.
#[derive(Debug, Clone)]
pub struct EncryptReport {
    pub record: CryptdevRecord,
    /// The device was already LUKS formatted; no new header was written.
    pub already_encrypted: bool,
    /// A new `/dev/mapper` entry was created by this run.
    pub mapping_created: bool,
    pub report: WorkflowReport,
}

pub struct VolumeEncryptor<R, H> {
    config: Arc<FastluksConfig>,
    runner: R,
    host: H,
    escrow: Option<(Box<dyn SecretStore>, SecretCoordinates)>,
}

impl<R, H> VolumeEncryptor<R, H>
where
    R: CommandRunner,
    H: HostProbe,
{
    pub fn new(config: Arc<FastluksConfig>, runner: R, host: H) -> Self {
        Self {
            config,
            runner,
            host,
            escrow: None,
        }
    }

    /// Escrow newly created passphrases in `store` at `coordinates`.
    pub fn with_secret_store(
        mut self,
        store: Box<dyn SecretStore>,
        coordinates: SecretCoordinates,
    ) -> Self {
        self.escrow = Some((store, coordinates));
        self
    }

    pub fn config(&self) -> &Arc<FastluksConfig> {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn encrypt(&self, options: EncryptOptions) -> LuksResult<EncryptReport> {
        let cfg = &self.config;
        let device = cfg.device.device.as_str();
        let mut log = WorkflowLog::new(TARGET);

        let lock = ProcessLock::acquire(&cfg.paths.encryption_lock)?;

        let cryptdev = self.cryptdev_name();
        let mapper = mapper_path(&cryptdev);
        log.info(format!("Using {device} with mapping {mapper}"));

        self.check_volume(&mut log)?;

        let already_encrypted = self.is_encrypted(&mut log)?;
        let (secret, lock) = if already_encrypted {
            log.info(format!(
                "{device} already carries a LUKS header; skipping format"
            ));
            (options.passphrase, lock)
        } else {
            self.unmount(&mut log);
            let secret = self.format_device(&options, &mut log)?;
            self.escrow_secret(&secret, &mut log);
            let backed_up = self.backup_header(&mut log)?;
            let lock = release_and_abort_if_false(
                backed_up,
                lock,
                "Device setup procedure failed.",
            )?;
            (Some(secret), lock)
        };

        let secret = secret.as_deref().map(String::as_str);
        let mapping_created = self.open_mapping(&cryptdev, secret, &mut log)?;

        let cryptsetup = Cryptsetup::new(&self.runner, cfg.cryptsetup_binary());
        log.command("cryptsetup status", &cryptsetup.status(&cryptdev));

        let record = self.register(&cryptdev, secret, &mut log)?;

        write_marker(&cfg.paths.encryption_success, ENCRYPTION_COMPLETED)?;
        log.success(ENCRYPTION_COMPLETED);
        lock.release()?;

        Ok(EncryptReport {
            record,
            already_encrypted,
            mapping_created,
            report: log.into_report(format!("Encrypted {device}")),
        })
    }

    /// Configured name, else the name already registered for this device,
    /// else a fresh random one.
    fn cryptdev_name(&self) -> String {
        if let Some(name) = &self.config.device.cryptdev {
            return name.clone();
        }
        Registry::load(self.config.registry_path())
            .ok()
            .and_then(|registry| registry.luks)
            .filter(|record| record.device == self.config.device.device)
            .map(|record| record.cryptdev)
            .unwrap_or_else(random_cryptdev_name)
    }

    fn check_volume(&self, log: &mut WorkflowLog) -> LuksResult<()> {
        let cfg = &self.config;
        let mountpoint = Path::new(&cfg.device.mountpoint);

        if self.host.is_mount_point(mountpoint) {
            let out = self
                .runner
                .run(&cfg.binaries.df, &["-P", &cfg.device.mountpoint], None);
            log.command("df -P", &out);
            if let Some(source) = df_source(&out.stdout) {
                log.info(format!("{} is backed by {source}", mountpoint.display()));
            }
            return Ok(());
        }

        if !self.host.is_block_device(Path::new(&cfg.device.device)) {
            log.command("df -h", &self.runner.run(&cfg.binaries.df, &["-h"], None));
            log.error(format!("No device mounted to {}", mountpoint.display()));
            return Err(LuksError::VolumeNotReady(format!(
                "nothing is mounted on {} and {} is not a block device",
                mountpoint.display(),
                cfg.device.device
            )));
        }

        log.info(format!(
            "External volume on {}; using it for encryption",
            cfg.device.device
        ));
        if !mountpoint.is_dir() {
            fs::create_dir_all(mountpoint)?;
        }
        Ok(())
    }

    fn is_encrypted(&self, log: &mut WorkflowLog) -> LuksResult<bool> {
        let out = self.runner.run(
            &self.config.binaries.lsblk,
            &["-l", "-p", "-n", "-o", "NAME,FSTYPE"],
            None,
        );
        log.command("lsblk", &out);
        check_tool("lsblk", &out)?;
        Ok(lsblk_reports_luks(&out.stdout, &self.config.device.device))
    }

    fn unmount(&self, log: &mut WorkflowLog) {
        let cfg = &self.config;
        let out = self
            .runner
            .run(&cfg.binaries.umount, &[&cfg.device.mountpoint], None);
        log.command("umount", &out);
        log.info(format!(
            "{} unmounted, ready for encryption",
            cfg.device.device
        ));
    }

    fn format_device(&self, options: &EncryptOptions, log: &mut WorkflowLog) -> LuksResult<Secret> {
        let cfg = &self.config;
        let secret = resolve_secret(
            cfg.passphrase.length,
            options.passphrase.as_deref().map(String::as_str),
            options.confirmation.as_deref().map(String::as_str),
        )?;

        log.info(format!(
            "Formatting {} with {} ({} bit, {})",
            cfg.device.device, cfg.crypto.cipher_algorithm, cfg.crypto.keysize, cfg.crypto.hash_algorithm
        ));
        let cryptsetup = Cryptsetup::new(&self.runner, cfg.cryptsetup_binary());
        let out = cryptsetup.format(&cfg.device.device, &secret, &cfg.crypto);
        check_tool("cryptsetup luksFormat", &out)?;
        log.security(format!("{} is now LUKS formatted", cfg.device.device));
        Ok(secret)
    }

    fn escrow_secret(&self, secret: &str, log: &mut WorkflowLog) {
        let Some((store, coordinates)) = &self.escrow else {
            return;
        };
        match store.write_secret(coordinates, secret) {
            Ok(()) => log.security("Passphrase stored in Vault"),
            Err(err) => log.warn(format!("Passphrase was not stored in Vault: {err}")),
        }
    }

    /// Returns false when cryptsetup refused the backup.
    fn backup_header(&self, log: &mut WorkflowLog) -> LuksResult<bool> {
        let cfg = &self.config;
        let dir = Path::new(&cfg.paths.header_backup_dir);
        if !dir.is_dir() {
            fs::create_dir_all(dir)?;
        }
        let file = cfg.header_backup_path();
        let cryptsetup = Cryptsetup::new(&self.runner, cfg.cryptsetup_binary());
        let out = cryptsetup.header_backup(&cfg.device.device, &file);
        log.command("cryptsetup luksHeaderBackup", &out);

        if let Err(err) = check_tool("cryptsetup luksHeaderBackup", &out) {
            log.error(err.to_string());
            if ToolExit::from_code(out.status) == ToolExit::BadPassphrase {
                log.error("Bad passphrase. Please try again.");
            }
            return Ok(false);
        }

        match fs::read(&file) {
            Ok(bytes) => log.security(format!(
                "Header backup written to {} (sha256 {})",
                file.display(),
                hex::encode(Sha256::digest(&bytes))
            )),
            Err(err) => log.warn(format!(
                "Header backup reported success but {} is unreadable: {err}",
                file.display()
            )),
        }
        Ok(true)
    }

    /// Create `/dev/mapper/<cryptdev>` unless it already exists.
    fn open_mapping(
        &self,
        cryptdev: &str,
        secret: Option<&str>,
        log: &mut WorkflowLog,
    ) -> LuksResult<bool> {
        let cfg = &self.config;
        let mapper = mapper_path(cryptdev);
        if self.host.is_block_device(Path::new(&mapper)) {
            log.info(format!("{mapper} already open"));
            return Ok(false);
        }

        let secret = secret.ok_or(LuksError::PassphraseMissing("passphrase"))?;
        let cryptsetup = Cryptsetup::new(&self.runner, cfg.cryptsetup_binary());
        let out = cryptsetup.open(&cfg.device.device, cryptdev, secret);
        match ToolExit::from_code(out.status) {
            ToolExit::Success => {
                log.success(format!("Opened {} as {mapper}", cfg.device.device));
                Ok(true)
            }
            ToolExit::BadPassphrase => {
                log.error("Bad passphrase. Please try again.");
                Err(LuksError::BadPassphrase)
            }
            exit => {
                log.error(format!("Unable to luksOpen {}: {exit}", cfg.device.device));
                log.error(format!(
                    "Mounting {} to {} again",
                    cfg.device.device, cfg.device.mountpoint
                ));
                let remount = self.runner.run(
                    &cfg.binaries.mount,
                    &[&cfg.device.device, &cfg.device.mountpoint],
                    None,
                );
                log.command("mount", &remount);
                Err(LuksError::Tool {
                    tool: "cryptsetup luksOpen".to_string(),
                    exit,
                    diagnostic: format!(
                        "{}; {mapper} may already exist, please check logs",
                        out.diagnostic()
                    ),
                })
            }
        }
    }

    fn register(
        &self,
        cryptdev: &str,
        secret: Option<&str>,
        log: &mut WorkflowLog,
    ) -> LuksResult<CryptdevRecord> {
        let cfg = &self.config;
        let mapper = mapper_path(cryptdev);
        let cryptsetup = Cryptsetup::new(&self.runner, cfg.cryptsetup_binary());
        let uuid = cryptsetup.uuid(&cfg.device.device)?;

        let record = CryptdevRecord {
            cipher_algorithm: cfg.crypto.cipher_algorithm.clone(),
            hash_algorithm: cfg.crypto.hash_algorithm.clone(),
            keysize: cfg.crypto.keysize,
            device: cfg.device.device.clone(),
            uuid,
            cryptdev: cryptdev.to_string(),
            mapper: mapper.clone(),
            mountpoint: cfg.device.mountpoint.clone(),
            filesystem: cfg.device.filesystem.clone(),
            header_path: cfg.header_backup_path().to_string_lossy().into_owned(),
            passphrase: secret
                .filter(|_| cfg.passphrase.save_locally)
                .map(str::to_string),
        };

        let registry_path = cfg.registry_path();
        write_device_record(&registry_path, record.clone())?;
        if record.passphrase.is_some() {
            log.security(format!(
                "Device information and passphrase saved in {}",
                registry_path.display()
            ));
        } else {
            log.info(format!(
                "Device information saved in {}",
                registry_path.display()
            ));
        }

        log.command(
            "dmsetup info",
            &self.runner.run(&cfg.binaries.dmsetup, &["info", &mapper], None),
        );
        log.command("cryptsetup luksDump", &cryptsetup.dump(&cfg.device.device));
        Ok(record)
    }
}
