//! Cluster control plane: the master that owns the encrypted volume and the
//! workers that mount it over NFS.

pub mod client;
pub mod master;
pub mod worker;

use crate::error::{LuksError, LuksResult};
use crate::provider::CommandOutput;
use crate::registry::{ApiSection, InfrastructureMode, Registry, VirtualizationType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub use client::{HttpWorkerClient, WorkerClient};
pub use master::{write_exports, MasterNode, NodeReport, OpenOutcome};
pub use worker::WorkerNode;

pub const MASTER_API_PREFIX: &str = "/luksctl_api/v1.0";
pub const WORKER_API_PREFIX: &str = "/luksctl_api_wn/v1.0";
pub const DEFAULT_API_PORT: u16 = 5000;
pub const DEFAULT_SUDO_PATH: &str = "/usr/bin";
pub const DEFAULT_ENV_PATH: &str = "/usr/local";
pub const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 30;

/// Tri-state answer of the master's volume queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "volume_state", rename_all = "snake_case")]
pub enum VolumeState {
    Mounted,
    Unmounted,
    /// `fastluks status|open` exited with an unrecognised status.
    Unavailable { output: String, stderr: String },
}

impl VolumeState {
    /// Map `fastluks status|open`: 0 mounted, 1 unmounted, else unavailable.
    pub fn from_output(output: &CommandOutput) -> Self {
        match output.status {
            0 => VolumeState::Mounted,
            1 => VolumeState::Unmounted,
            _ => VolumeState::Unavailable {
                output: output.stdout.clone(),
                stderr: output.stderr.clone(),
            },
        }
    }

    pub fn is_mounted(&self) -> bool {
        matches!(self, VolumeState::Mounted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NfsState {
    Mounted,
    Unmounted,
}

/// Worker wire format: `{"nfs_state": "mounted"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsReply {
    pub nfs_state: NfsState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterConfig {
    pub infrastructure: InfrastructureMode,
    pub virtualization: Option<VirtualizationType>,
    /// Worker addresses in fan-out order.
    pub workers: Vec<String>,
    pub sudo_path: String,
    pub env_path: String,
    /// Overrides the distribution-based NFS service name.
    pub nfs_service: Option<String>,
    pub worker_port: u16,
    pub worker_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            infrastructure: InfrastructureMode::SingleVm,
            virtualization: None,
            workers: Vec::new(),
            sudo_path: DEFAULT_SUDO_PATH.to_string(),
            env_path: DEFAULT_ENV_PATH.to_string(),
            nfs_service: None,
            worker_port: DEFAULT_API_PORT,
            worker_timeout: Duration::from_secs(DEFAULT_WORKER_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub mountpoints: Vec<String>,
    pub sudo_path: String,
}

/// Typed view of the `[luksctl_api]` registry section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiConfig {
    Master(MasterConfig),
    Worker(WorkerConfig),
}

impl ApiConfig {
    /// A section listing NFS mountpoints describes a worker; anything else
    /// must name an infrastructure mode.
    pub fn from_section(section: &ApiSection) -> LuksResult<Self> {
        let sudo_path = section
            .sudo_path
            .clone()
            .unwrap_or_else(|| DEFAULT_SUDO_PATH.to_string());

        if let Some(mountpoints) = &section.nfs_mountpoint_list {
            return Ok(ApiConfig::Worker(WorkerConfig {
                mountpoints: mountpoints.clone(),
                sudo_path,
            }));
        }

        let infrastructure = section.infrastructure_configuration.ok_or_else(|| {
            LuksError::InvalidConfig(
                "luksctl_api needs infrastructure_configuration or nfs_mountpoint_list".into(),
            )
        })?;
        Ok(ApiConfig::Master(MasterConfig {
            infrastructure,
            virtualization: section.virtualization_type,
            workers: section.wn_ips.clone().unwrap_or_default(),
            sudo_path,
            env_path: section
                .env_path
                .clone()
                .unwrap_or_else(|| DEFAULT_ENV_PATH.to_string()),
            nfs_service: section.nfs_service.clone(),
            worker_port: section.worker_port.unwrap_or(DEFAULT_API_PORT),
            worker_timeout: Duration::from_secs(
                section
                    .worker_timeout_secs
                    .unwrap_or(DEFAULT_WORKER_TIMEOUT_SECS),
            ),
        }))
    }

    pub fn load(registry_path: &Path) -> LuksResult<Self> {
        let registry = Registry::load(registry_path)?;
        Self::from_section(registry.api_section()?)
    }

    pub fn to_section(&self) -> ApiSection {
        match self {
            ApiConfig::Master(master) => ApiSection {
                infrastructure_configuration: Some(master.infrastructure),
                virtualization_type: master.virtualization,
                wn_ips: (!master.workers.is_empty()).then(|| master.workers.clone()),
                sudo_path: Some(master.sudo_path.clone()),
                env_path: Some(master.env_path.clone()),
                nfs_service: master.nfs_service.clone(),
                worker_port: (master.worker_port != DEFAULT_API_PORT).then_some(master.worker_port),
                worker_timeout_secs: (master.worker_timeout.as_secs()
                    != DEFAULT_WORKER_TIMEOUT_SECS)
                    .then(|| master.worker_timeout.as_secs()),
                ..ApiSection::default()
            },
            ApiConfig::Worker(worker) => ApiSection {
                nfs_mountpoint_list: Some(worker.mountpoints.clone()),
                sudo_path: Some(worker.sudo_path.clone()),
                ..ApiSection::default()
            },
        }
    }
}
