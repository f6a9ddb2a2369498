use crate::error::{LuksError, LuksResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/luks/fastluks.toml";
pub const DEFAULT_REGISTRY_PATH: &str = "/etc/luks/luks-cryptdev.toml";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeviceCfg {
    #[serde(default = "default_device")]
    pub device: String,

    /// Mapping name under /dev/mapper; generated when unset.
    #[serde(default)]
    pub cryptdev: Option<String>,

    #[serde(default = "default_mountpoint")]
    pub mountpoint: String,

    #[serde(default = "default_filesystem")]
    pub filesystem: String,
}

fn default_device() -> String {
    "/dev/vdb".to_string()
}

fn default_mountpoint() -> String {
    "/export".to_string()
}

fn default_filesystem() -> String {
    "ext4".to_string()
}

impl Default for DeviceCfg {
    fn default() -> Self {
        Self {
            device: default_device(),
            cryptdev: None,
            mountpoint: default_mountpoint(),
            filesystem: default_filesystem(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CryptoCfg {
    #[serde(default = "default_cipher")]
    pub cipher_algorithm: String,

    #[serde(default = "default_keysize")]
    pub keysize: u32,

    #[serde(default = "default_hash")]
    pub hash_algorithm: String,

    #[serde(default = "default_iter_time_ms")]
    pub iter_time_ms: u32,
}

fn default_cipher() -> String {
    "aes-xts-plain64".to_string()
}

fn default_keysize() -> u32 {
    256
}

fn default_hash() -> String {
    "sha256".to_string()
}

fn default_iter_time_ms() -> u32 {
    2000
}

impl Default for CryptoCfg {
    fn default() -> Self {
        Self {
            cipher_algorithm: default_cipher(),
            keysize: default_keysize(),
            hash_algorithm: default_hash(),
            iter_time_ms: default_iter_time_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PassphraseCfg {
    /// Length of generated passphrases. `None` requires an explicit passphrase.
    #[serde(default = "default_passphrase_length")]
    pub length: Option<usize>,

    /// Store the plaintext passphrase in the registry (testing only).
    #[serde(default)]
    pub save_locally: bool,
}

fn default_passphrase_length() -> Option<usize> {
    Some(8)
}

impl Default for PassphraseCfg {
    fn default() -> Self {
        Self {
            length: default_passphrase_length(),
            save_locally: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PathsCfg {
    #[serde(default = "default_header_backup_dir")]
    pub header_backup_dir: String,

    #[serde(default = "default_header_backup_file")]
    pub header_backup_file: String,

    #[serde(default = "default_registry")]
    pub registry: String,

    #[serde(default = "default_encryption_lock")]
    pub encryption_lock: String,

    #[serde(default = "default_encryption_success")]
    pub encryption_success: String,

    #[serde(default = "default_setup_lock")]
    pub setup_lock: String,

    #[serde(default = "default_setup_success")]
    pub setup_success: String,
}

fn default_header_backup_dir() -> String {
    "/etc/luks".to_string()
}

fn default_header_backup_file() -> String {
    "luks-header.bck".to_string()
}

fn default_registry() -> String {
    DEFAULT_REGISTRY_PATH.to_string()
}

fn default_encryption_lock() -> String {
    "/var/run/fast-luks-encryption.lock".to_string()
}

fn default_encryption_success() -> String {
    "/var/run/fast-luks-encryption.success".to_string()
}

fn default_setup_lock() -> String {
    "/var/run/fast-luks-volume-setup.lock".to_string()
}

fn default_setup_success() -> String {
    "/var/run/fast-luks-volume-setup.success".to_string()
}

impl Default for PathsCfg {
    fn default() -> Self {
        Self {
            header_backup_dir: default_header_backup_dir(),
            header_backup_file: default_header_backup_file(),
            registry: default_registry(),
            encryption_lock: default_encryption_lock(),
            encryption_success: default_encryption_success(),
            setup_lock: default_setup_lock(),
            setup_success: default_setup_success(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VaultCfg {
    /// Store freshly generated passphrases in Vault during encryption.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_secret_root")]
    pub secret_root: String,

    #[serde(default)]
    pub secret_path: Option<String>,

    #[serde(default)]
    pub user_key: Option<String>,

    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_secret_root() -> String {
    "secrets".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

impl Default for VaultCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            secret_root: default_secret_root(),
            secret_path: None,
            user_key: None,
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

/// Executable names or absolute paths used by the workflows.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BinariesCfg {
    #[serde(default)]
    pub cryptsetup: Option<String>,

    #[serde(default = "default_lsblk")]
    pub lsblk: String,

    #[serde(default = "default_mount")]
    pub mount: String,

    #[serde(default = "default_umount")]
    pub umount: String,

    #[serde(default = "default_mkfs")]
    pub mkfs: String,

    #[serde(default = "default_dmsetup")]
    pub dmsetup: String,

    #[serde(default = "default_df")]
    pub df: String,

    #[serde(default = "default_dd")]
    pub dd: String,
}

fn default_lsblk() -> String {
    "lsblk".to_string()
}

fn default_mount() -> String {
    "mount".to_string()
}

fn default_umount() -> String {
    "umount".to_string()
}

fn default_mkfs() -> String {
    "mkfs".to_string()
}

fn default_dmsetup() -> String {
    "dmsetup".to_string()
}

fn default_df() -> String {
    "df".to_string()
}

fn default_dd() -> String {
    "dd".to_string()
}

impl Default for BinariesCfg {
    fn default() -> Self {
        Self {
            cryptsetup: None,
            lsblk: default_lsblk(),
            mount: default_mount(),
            umount: default_umount(),
            mkfs: default_mkfs(),
            dmsetup: default_dmsetup(),
            df: default_df(),
            dd: default_dd(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FastluksConfig {
    #[serde(default)]
    pub device: DeviceCfg,

    #[serde(default)]
    pub crypto: CryptoCfg,

    #[serde(default)]
    pub passphrase: PassphraseCfg,

    #[serde(default)]
    pub paths: PathsCfg,

    #[serde(default)]
    pub vault: VaultCfg,

    #[serde(default)]
    pub binaries: BinariesCfg,

    /// Per-command timeout; `0` waits indefinitely (large mkfs/dd runs).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Overwrite the opened mapping with zeros before creating the filesystem.
    #[serde(default)]
    pub paranoid: bool,

    #[serde(skip)]
    pub path: PathBuf,
}

fn default_timeout_secs() -> u64 {
    3600
}

impl Default for FastluksConfig {
    fn default() -> Self {
        Self {
            device: DeviceCfg::default(),
            crypto: CryptoCfg::default(),
            passphrase: PassphraseCfg::default(),
            paths: PathsCfg::default(),
            vault: VaultCfg::default(),
            binaries: BinariesCfg::default(),
            timeout_secs: default_timeout_secs(),
            paranoid: false,
            path: PathBuf::new(),
        }
    }
}

impl FastluksConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> LuksResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();

        let issues = cfg.validate();
        if let Some(first) = issues.into_iter().next() {
            return Err(LuksError::InvalidConfig(first));
        }

        Ok(cfg)
    }

    /// Load `path` if it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> LuksResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        log::info!(
            "no configuration at {}; using built-in defaults",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            ..Self::default()
        })
    }

    /// Collect human-readable problems with the configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.device.device.trim().is_empty() {
            issues.push("device.device must not be empty".to_string());
        }
        if !Path::new(&self.device.mountpoint).is_absolute() {
            issues.push(format!(
                "device.mountpoint must be an absolute path (got `{}`)",
                self.device.mountpoint
            ));
        }
        if let Some(name) = &self.device.cryptdev {
            if name.is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
                issues.push(format!("device.cryptdev `{name}` is not a valid mapping name"));
            }
        }
        if self.crypto.keysize == 0 || self.crypto.keysize % 8 != 0 {
            issues.push(format!(
                "crypto.keysize must be a positive multiple of 8 (got {})",
                self.crypto.keysize
            ));
        }
        if self.passphrase.length == Some(0) {
            issues.push("passphrase.length must be greater than zero".to_string());
        }
        if self.vault.enabled {
            if self.vault.url.is_none() {
                issues.push("vault.enabled requires vault.url".to_string());
            }
            if self.vault.secret_path.is_none() || self.vault.user_key.is_none() {
                issues.push("vault.enabled requires vault.secret_path and vault.user_key".to_string());
            }
        }
        issues
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn cryptsetup_binary(&self) -> &str {
        self.binaries.cryptsetup.as_deref().unwrap_or("cryptsetup")
    }

    pub fn header_backup_path(&self) -> PathBuf {
        Path::new(&self.paths.header_backup_dir).join(&self.paths.header_backup_file)
    }

    pub fn registry_path(&self) -> PathBuf {
        PathBuf::from(&self.paths.registry)
    }
}
