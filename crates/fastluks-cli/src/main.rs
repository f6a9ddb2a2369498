//! fastluks command-line interface: encrypt and set up volumes, drive them
//! locally, and write the control-plane configuration.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fastluks_core::{
    cluster::{self, write_exports, ApiConfig, MasterConfig, WorkerConfig},
    logging,
    registry::{write_api_section, InfrastructureMode, VirtualizationType},
    workflow::{
        self, EncryptOptions, EncryptReport, LocalVolume, LocalVolumeStatus, VolumeEncryptor,
        VolumeSetup, WorkflowLevel, WorkflowReport,
    },
    FastluksConfig, LuksError, Registry, Secret, SecretCoordinates, VaultClient,
    DEFAULT_CONFIG_PATH,
};
use fastluks_system::{running_as_root, with_discovered_binaries, SystemCommandRunner, SystemHost};
use log::{error, info};
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "fastluks",
    version,
    about = "LUKS volume encryption and cluster unlock tooling."
)]
struct Cli {
    /// Path to the fastluks configuration file (TOML or YAML).
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt the device with LUKS, back up its header, and open it.
    Encrypt(EncryptArgs),

    /// Create a filesystem on the opened mapping and mount it.
    VolumeSetup {
        /// Overwrite the mapping with zeros before creating the filesystem.
        #[arg(long)]
        paranoid: bool,
    },

    /// Run `encrypt` followed by `volume-setup`.
    EncryptAndSetup(EncryptArgs),

    /// Exit 0 when the registered volume is open and mounted, 1 otherwise.
    Status,

    /// Open and mount the registered volume; the passphrase is read from stdin.
    Open {
        /// Prompt on the terminal instead of reading stdin.
        #[arg(long)]
        prompt: bool,
    },

    /// Unmount and close the registered volume.
    Close,

    /// Write the `[luksctl_api]` section of the registry.
    ApiConfig {
        #[command(subcommand)]
        role: ApiRole,
    },

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG_PATH)]
        file: PathBuf,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },
}

/// Overrides for the configuration's device, crypto, passphrase, and vault
/// sections.
#[derive(Args, Debug, Default)]
struct EncryptArgs {
    #[arg(long)]
    device: Option<String>,

    /// Mapping name under /dev/mapper; random when neither set nor registered.
    #[arg(long)]
    cryptdev: Option<String>,

    #[arg(long)]
    mountpoint: Option<String>,

    #[arg(long)]
    filesystem: Option<String>,

    #[arg(long)]
    cipher: Option<String>,

    #[arg(long)]
    keysize: Option<u32>,

    #[arg(long)]
    hash: Option<String>,

    /// Length of the generated passphrase.
    #[arg(long)]
    passphrase_length: Option<usize>,

    /// Prompt for the passphrase and its confirmation instead of generating one.
    #[arg(long)]
    prompt_passphrase: bool,

    /// Keep the passphrase in the registry.
    #[arg(long)]
    save_passphrase_locally: bool,

    /// Overwrite the mapping with zeros before creating the filesystem.
    #[arg(long)]
    paranoid: bool,

    /// Store the passphrase in Vault.
    #[arg(long)]
    vault: bool,

    #[arg(long)]
    vault_url: Option<String>,

    /// One-time wrapping token granting access to the Vault secret.
    #[arg(long, env = "FASTLUKS_VAULT_TOKEN", hide_env_values = true)]
    wrapping_token: Option<String>,

    #[arg(long)]
    secret_path: Option<String>,

    #[arg(long)]
    user_key: Option<String>,
}

impl EncryptArgs {
    fn apply(&self, config: &mut FastluksConfig) {
        let set = |target: &mut String, value: &Option<String>| {
            if let Some(value) = value {
                *target = value.clone();
            }
        };
        set(&mut config.device.device, &self.device);
        set(&mut config.device.mountpoint, &self.mountpoint);
        set(&mut config.device.filesystem, &self.filesystem);
        set(&mut config.crypto.cipher_algorithm, &self.cipher);
        set(&mut config.crypto.hash_algorithm, &self.hash);
        if let Some(cryptdev) = &self.cryptdev {
            config.device.cryptdev = Some(cryptdev.clone());
        }
        if let Some(keysize) = self.keysize {
            config.crypto.keysize = keysize;
        }
        if let Some(length) = self.passphrase_length {
            config.passphrase.length = Some(length);
        }
        config.passphrase.save_locally |= self.save_passphrase_locally;
        config.paranoid |= self.paranoid;
        config.vault.enabled |= self.vault;
        if let Some(url) = &self.vault_url {
            config.vault.url = Some(url.clone());
        }
        if let Some(path) = &self.secret_path {
            config.vault.secret_path = Some(path.clone());
        }
        if let Some(key) = &self.user_key {
            config.vault.user_key = Some(key.clone());
        }
    }

    fn options(&self) -> Result<EncryptOptions> {
        if !self.prompt_passphrase {
            return Ok(EncryptOptions::default());
        }
        let passphrase: Secret = Zeroizing::new(prompt_password("Passphrase: ")?);
        let confirmation: Secret = Zeroizing::new(prompt_password("Confirm passphrase: ")?);
        Ok(EncryptOptions {
            passphrase: Some(passphrase),
            confirmation: Some(confirmation),
        })
    }

    /// Where the passphrase is escrowed, when Vault is enabled.
    fn coordinates(&self, config: &FastluksConfig) -> Result<Option<SecretCoordinates>> {
        if !config.vault.enabled {
            return Ok(None);
        }
        let Some(wrapping_token) = self.wrapping_token.clone() else {
            bail!("vault is enabled but no wrapping token was given (--wrapping-token or FASTLUKS_VAULT_TOKEN)");
        };
        let (Some(vault_url), Some(secret_path), Some(secret_key)) = (
            config.vault.url.clone(),
            config.vault.secret_path.clone(),
            config.vault.user_key.clone(),
        ) else {
            bail!("vault is enabled but vault.url, vault.secret_path or vault.user_key is missing");
        };
        Ok(Some(SecretCoordinates {
            vault_url,
            wrapping_token,
            secret_root: config.vault.secret_root.clone(),
            secret_path,
            secret_key,
        }))
    }
}

#[derive(Subcommand, Debug)]
enum ApiRole {
    /// Configure this node as the master that owns the encrypted volume.
    Master {
        #[arg(long, value_enum, default_value_t = Infrastructure::SingleVm)]
        infrastructure: Infrastructure,

        /// Restart this container runtime after a successful open.
        #[arg(long, value_enum)]
        virtualization: Option<Virtualization>,

        /// Worker address; repeat for every worker, in fan-out order.
        #[arg(long = "worker")]
        workers: Vec<String>,

        #[arg(long, default_value = cluster::DEFAULT_SUDO_PATH)]
        sudo_path: String,

        /// Prefix of the installation holding `bin/fastluks`.
        #[arg(long, default_value = cluster::DEFAULT_ENV_PATH)]
        env_path: String,

        /// NFS server unit; detected from the distribution when omitted.
        #[arg(long)]
        nfs_service: Option<String>,

        #[arg(long, default_value_t = cluster::DEFAULT_API_PORT)]
        worker_port: u16,

        #[arg(long, default_value_t = cluster::DEFAULT_WORKER_TIMEOUT_SECS)]
        worker_timeout_secs: u64,

        /// Append NFS export entries for every worker to this file.
        #[arg(long)]
        exports: Option<PathBuf>,

        /// Directory to export; defaults to the configured mountpoint.
        #[arg(long = "export-dir")]
        export_dirs: Vec<String>,
    },

    /// Configure this node as a worker mounting the master's exports.
    Worker {
        /// NFS mountpoint listed in /etc/fstab; repeat for each.
        #[arg(long = "mountpoint", required = true)]
        mountpoints: Vec<String>,

        #[arg(long, default_value = cluster::DEFAULT_SUDO_PATH)]
        sudo_path: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Infrastructure {
    SingleVm,
    Cluster,
}

impl From<Infrastructure> for InfrastructureMode {
    fn from(value: Infrastructure) -> Self {
        match value {
            Infrastructure::SingleVm => InfrastructureMode::SingleVm,
            Infrastructure::Cluster => InfrastructureMode::Cluster,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Virtualization {
    Docker,
}

impl From<Virtualization> for VirtualizationType {
    fn from(value: Virtualization) -> Self {
        match value {
            Virtualization::Docker => VirtualizationType::Docker,
        }
    }
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    logging::init("fastluks", "info");
    let cli = Cli::parse();
    let volume_query = matches!(cli.command, Commands::Status | Commands::Open { .. });
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(exit_code_for(&err, volume_query));
        }
    }
}

/// `status` and `open` answer the control plane, which reads 0 as mounted and
/// 1 as unmounted; any other failure of theirs must not look like either.
fn exit_code_for(err: &anyhow::Error, volume_query: bool) -> i32 {
    let luks = err.downcast_ref::<LuksError>();
    if let Some(luks) = luks {
        error!("{luks}");
    }
    match (volume_query, luks) {
        (true, Some(LuksError::BadPassphrase | LuksError::Tool { .. })) => 1,
        (true, _) => 2,
        (false, Some(luks)) => luks.exit_code(),
        (false, None) => 1,
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config_path = cli.config;

    match cli.command {
        Commands::Encrypt(args) => {
            require_root("encrypt")?;
            let encryptor = encryptor(&config_path, &args)?;
            let report = encryptor.encrypt(args.options()?)?;
            print_encrypt_report(&report);
        }
        Commands::VolumeSetup { paranoid } => {
            require_root("volume-setup")?;
            let mut config = load_config(&config_path)?;
            config.paranoid |= paranoid;
            let config = Arc::new(with_discovered_binaries(&config)?);
            let runner = SystemCommandRunner::new(config.command_timeout());
            let report = VolumeSetup::new(config, runner, SystemHost::new()).run()?;
            print_report(report);
        }
        Commands::EncryptAndSetup(args) => {
            require_root("encrypt-and-setup")?;
            let encryptor = encryptor(&config_path, &args)?;
            let (encrypted, setup) = workflow::encrypt_and_setup(&encryptor, args.options()?)?;
            print_encrypt_report(&encrypted);
            print_report(setup);
        }
        Commands::Status => {
            let status = local_volume(&config_path)?.status();
            println!("{}", describe(status));
            return Ok(status.exit_code());
        }
        Commands::Open { prompt } => {
            let secret = if prompt {
                Zeroizing::new(prompt_password("Passphrase: ")?)
            } else {
                read_stdin_secret()?
            };
            let status = local_volume(&config_path)?.open(&secret)?;
            println!("{}", describe(status));
            return Ok(status.exit_code());
        }
        Commands::Close => {
            let status = local_volume(&config_path)?.close()?;
            println!("{}", describe(status));
        }
        Commands::ApiConfig { role } => {
            let config = load_config(&config_path)?;
            write_api_config(&config, role)?;
        }
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(FastluksConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(0);
            }

            let cfg = FastluksConfig::load(&file)
                .with_context(|| format!("failed to load configuration from {}", file.display()))?;

            let issues = cfg.validate();
            if issues.is_empty() {
                println!(
                    "Configuration valid (device {}, mountpoint {}).",
                    cfg.device.device, cfg.device.mountpoint
                );
            } else {
                eprintln!("Configuration validation failed:");
                for issue in issues {
                    eprintln!("  - {issue}");
                }
                return Ok(1);
            }
        }
    }

    Ok(0)
}

fn load_config(path: &Path) -> Result<FastluksConfig> {
    FastluksConfig::load_or_default(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn require_root(command: &str) -> Result<()> {
    if !running_as_root() {
        bail!("{command} must be run as root");
    }
    Ok(())
}

fn encryptor(
    config_path: &Path,
    args: &EncryptArgs,
) -> Result<VolumeEncryptor<SystemCommandRunner, SystemHost>> {
    let mut config = load_config(config_path)?;
    args.apply(&mut config);
    let issues = config.validate();
    if !issues.is_empty() {
        return Err(LuksError::InvalidConfig(issues.join("; ")).into());
    }
    let coordinates = args.coordinates(&config)?;
    let config = Arc::new(with_discovered_binaries(&config)?);
    let runner = SystemCommandRunner::new(config.command_timeout());
    let vault_timeout = Duration::from_secs(config.vault.timeout_secs);

    let encryptor = VolumeEncryptor::new(config, runner, SystemHost::new());
    Ok(match coordinates {
        Some(coordinates) => {
            encryptor.with_secret_store(Box::new(VaultClient::new(vault_timeout)), coordinates)
        }
        None => encryptor,
    })
}

fn local_volume(config_path: &Path) -> Result<LocalVolume<SystemCommandRunner, SystemHost>> {
    let config = load_config(config_path)?;
    let registry = Registry::load(config.registry_path()).with_context(|| {
        format!(
            "failed to read volume registry {}",
            config.registry_path().display()
        )
    })?;
    let record = registry.record()?.clone();
    let config = Arc::new(with_discovered_binaries(&config)?);
    let runner = SystemCommandRunner::new(config.command_timeout());
    Ok(LocalVolume::new(config, record, runner, SystemHost::new()))
}

/// One passphrase line from stdin, without its line ending.
fn read_stdin_secret() -> Result<Secret> {
    let mut line = Zeroizing::new(String::new());
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read passphrase from stdin")?;
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Err(LuksError::PassphraseMissing("passphrase").into());
    }
    Ok(Zeroizing::new(trimmed.to_string()))
}

fn write_api_config(config: &FastluksConfig, role: ApiRole) -> Result<()> {
    let registry = config.registry_path();
    match role {
        ApiRole::Master {
            infrastructure,
            virtualization,
            workers,
            sudo_path,
            env_path,
            nfs_service,
            worker_port,
            worker_timeout_secs,
            exports,
            export_dirs,
        } => {
            let master = MasterConfig {
                infrastructure: infrastructure.into(),
                virtualization: virtualization.map(Into::into),
                workers,
                sudo_path,
                env_path,
                nfs_service,
                worker_port,
                worker_timeout: Duration::from_secs(worker_timeout_secs),
            };
            if let Some(exports) = exports {
                let dirs = if export_dirs.is_empty() {
                    vec![config.device.mountpoint.clone()]
                } else {
                    export_dirs
                };
                write_exports(&exports, &dirs, &master.workers)
                    .with_context(|| format!("write {}", exports.display()))?;
                println!("Exports written to {}", exports.display());
            }
            let api = ApiConfig::Master(master);
            write_api_section(&registry, api.to_section())?;
        }
        ApiRole::Worker {
            mountpoints,
            sudo_path,
        } => {
            let api = ApiConfig::Worker(WorkerConfig {
                mountpoints,
                sudo_path,
            });
            write_api_section(&registry, api.to_section())?;
        }
    }
    info!("control plane configuration written to {}", registry.display());
    println!("Control plane configuration written to {}", registry.display());
    Ok(())
}

fn describe(status: LocalVolumeStatus) -> &'static str {
    match status {
        LocalVolumeStatus::Mounted => "mounted",
        LocalVolumeStatus::Unmounted => "unmounted",
    }
}

fn print_encrypt_report(report: &EncryptReport) {
    print_report(report.report.clone());
    let record = &report.record;
    println!(
        "{} -> {} (uuid {}, {} {} bit)",
        record.device, record.mapper, record.uuid, record.cipher_algorithm, record.keysize
    );
}

/// Pretty-print a workflow report so humans can follow along.
fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
        WorkflowLevel::Security => "SEC",
    }
}
