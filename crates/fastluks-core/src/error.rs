use std::path::PathBuf;
use thiserror::Error;

use crate::luks::ToolExit;

/// Result alias for core operations.
pub type LuksResult<T> = Result<T, LuksError>;

#[derive(Error, Debug)]
pub enum LuksError {
    #[error("[FL1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[FL1001] toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[FL1002] toml encode error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("[FL1003] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[FL1004] json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[FL1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[FL1101] cryptdev registry {0} has no [{1}] section")]
    RegistryMissing(PathBuf, &'static str),

    #[error("[FL2000] another instance is active: PID {pid} on {hostname} holds {path}; if you are sure no other run is active, remove the lock file and retry")]
    LockHeld {
        path: PathBuf,
        pid: u32,
        hostname: String,
    },

    #[error("[FL2001] {0}")]
    Aborted(String),

    #[error("[FL2100] volume not ready: {0}")]
    VolumeNotReady(String),

    #[error("[FL2200] passphrases do not match")]
    PassphraseMismatch,

    #[error("[FL2201] missing {0}")]
    PassphraseMissing(&'static str),

    #[error("[FL2202] bad passphrase, please try again")]
    BadPassphrase,

    #[error("[FL2300] {tool} failed ({exit}): {diagnostic}")]
    Tool {
        tool: String,
        exit: ToolExit,
        diagnostic: String,
    },

    #[error("[FL2400] filesystem creation failed on {0}, please check logs")]
    FilesystemCreation(String),

    #[error("[FL3000] secret store error: {0}")]
    SecretStore(String),

    #[error("[FL3100] orchestration error: {0}")]
    Orchestration(String),
}

impl LuksError {
    pub fn code(&self) -> &'static str {
        match self {
            LuksError::Io(_) => "FL1000",
            LuksError::Toml(_) => "FL1001",
            LuksError::TomlSer(_) => "FL1002",
            LuksError::Yaml(_) => "FL1003",
            LuksError::Json(_) => "FL1004",
            LuksError::InvalidConfig(_) => "FL1100",
            LuksError::RegistryMissing(..) => "FL1101",
            LuksError::LockHeld { .. } => "FL2000",
            LuksError::Aborted(_) => "FL2001",
            LuksError::VolumeNotReady(_) => "FL2100",
            LuksError::PassphraseMismatch => "FL2200",
            LuksError::PassphraseMissing(_) => "FL2201",
            LuksError::BadPassphrase => "FL2202",
            LuksError::Tool { .. } => "FL2300",
            LuksError::FilesystemCreation(_) => "FL2400",
            LuksError::SecretStore(_) => "FL3000",
            LuksError::Orchestration(_) => "FL3100",
        }
    }

    /// Process exit status a binary should use when this error ends a run.
    ///
    /// Lock contention and every workflow abort exit with `2`; configuration
    /// and plumbing failures exit with `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            LuksError::LockHeld { .. }
            | LuksError::Aborted(_)
            | LuksError::VolumeNotReady(_)
            | LuksError::PassphraseMismatch
            | LuksError::PassphraseMissing(_)
            | LuksError::BadPassphrase
            | LuksError::Tool { .. }
            | LuksError::FilesystemCreation(_) => 2,
            _ => 1,
        }
    }
}
