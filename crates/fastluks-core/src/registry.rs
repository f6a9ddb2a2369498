//! The cryptdev registry: durable description of the encrypted volume plus
//! the control-plane section written when a node is provisioned.
//!
//! Layout (TOML):
//!
//! ```toml
//! [luks]        # device record, written by a successful encryption run
//! [logs]        # log file locations for each component
//! [luksctl_api] # master or worker control-plane settings
//! ```

use crate::error::{LuksError, LuksResult};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Everything needed to reopen and remount the encrypted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptdevRecord {
    pub cipher_algorithm: String,
    pub hash_algorithm: String,
    pub keysize: u32,
    pub device: String,
    pub uuid: String,
    pub cryptdev: String,
    pub mapper: String,
    pub mountpoint: String,
    pub filesystem: String,
    pub header_path: String,

    /// Plaintext passphrase, only present when explicitly saved locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPaths {
    pub fastluks: String,
    pub luksctl: String,
    pub luksctl_api: String,
}

impl Default for LogPaths {
    fn default() -> Self {
        Self {
            fastluks: "/var/log/fastluks/fastluks.log".to_string(),
            luksctl: "/var/log/fastluks/luksctl.log".to_string(),
            luksctl_api: "/var/log/fastluks/luksctl-api.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfrastructureMode {
    SingleVm,
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtualizationType {
    Docker,
}

/// Raw `[luksctl_api]` section. Master nodes fill the infrastructure fields,
/// workers the NFS mountpoint list; `cluster::ApiConfig` gives the typed view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_configuration: Option<InfrastructureMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtualization_type: Option<VirtualizationType>,

    #[serde(
        default,
        with = "json_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub wn_ips: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_path: Option<String>,

    #[serde(
        default,
        with = "json_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub nfs_mountpoint_list: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs_service: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub luks: Option<CryptdevRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<LogPaths>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub luksctl_api: Option<ApiSection>,

    #[serde(skip)]
    pub path: PathBuf,
}

impl Registry {
    pub fn load<P: AsRef<Path>>(path: P) -> LuksResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut registry: Self = toml::from_str(&contents)?;
        registry.path = path.to_path_buf();
        Ok(registry)
    }

    /// Load `path`, or start an empty registry bound to it when absent.
    pub fn load_or_empty<P: AsRef<Path>>(path: P) -> LuksResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        Ok(Self {
            path: path.to_path_buf(),
            ..Self::default()
        })
    }

    /// Write the registry atomically with owner-only permissions.
    pub fn save(&self) -> LuksResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let encoded = toml::to_string(self)?;
        let tmp = self.path.with_extension("tmp");
        match fs::remove_file(&tmp) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }
        // The mode applies at creation, so the passphrase is never readable
        // by anyone else, even before the rename.
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(encoded.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn record(&self) -> LuksResult<&CryptdevRecord> {
        self.luks
            .as_ref()
            .ok_or_else(|| LuksError::RegistryMissing(self.path.clone(), "luks"))
    }

    pub fn api_section(&self) -> LuksResult<&ApiSection> {
        self.luksctl_api
            .as_ref()
            .ok_or_else(|| LuksError::RegistryMissing(self.path.clone(), "luksctl_api"))
    }
}

/// Store the device record and default log paths, keeping any existing
/// control-plane section.
pub fn write_device_record(path: &Path, record: CryptdevRecord) -> LuksResult<Registry> {
    let mut registry = Registry::load_or_empty(path)?;
    registry.luks = Some(record);
    registry.logs = Some(LogPaths::default());
    registry.save()?;
    Ok(registry)
}

/// Replace the `[luksctl_api]` section, keeping the device record.
pub fn write_api_section(path: &Path, section: ApiSection) -> LuksResult<Registry> {
    let mut registry = Registry::load_or_empty(path)?;
    registry.luksctl_api = Some(section);
    registry.save()?;
    Ok(registry)
}

/// Address and mountpoint lists are stored as JSON-encoded strings; native
/// TOML arrays are accepted on read.
mod json_list {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Encoded(String),
        Native(Vec<String>),
    }

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<String>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(list) => {
                let encoded = serde_json::to_string(list).map_err(S::Error::custom)?;
                serializer.serialize_some(&encoded)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<String>>, D::Error> {
        match Option::<Repr>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Repr::Native(list)) => Ok(Some(list)),
            Some(Repr::Encoded(text)) => serde_json::from_str(&text)
                .map(Some)
                .map_err(D::Error::custom),
        }
    }
}
