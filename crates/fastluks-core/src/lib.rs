//! Core library for fastluks: LUKS volume encryption workflows, the cryptdev
//! registry, and the cluster control plane that reopens volumes on demand.

pub mod cluster;
pub mod config;
pub mod error;
pub mod lock;
pub mod logging;
pub mod luks;
pub mod passphrase;
pub mod provider;
pub mod registry;
pub mod secret;
pub mod workflow;

pub use cluster::{ApiConfig, MasterConfig, NfsState, VolumeState, WorkerConfig};
pub use config::{FastluksConfig, DEFAULT_CONFIG_PATH, DEFAULT_REGISTRY_PATH};
pub use error::{LuksError, LuksResult};
pub use lock::ProcessLock;
pub use luks::ToolExit;
pub use passphrase::Secret;
pub use provider::{CommandOutput, CommandRunner, HostProbe};
pub use registry::{CryptdevRecord, Registry};
pub use secret::{SecretCoordinates, SecretStore, VaultClient};
