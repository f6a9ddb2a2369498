//! Master node: reports and restores the encrypted volume, then brings the
//! rest of the cluster back in line.
//!
//! Volume operations are delegated to `fastluks status|open` run through sudo,
//! so the daemon itself never needs root.

use super::{MasterConfig, NfsState, VolumeState, WorkerClient};
use crate::error::LuksResult;
use crate::passphrase::stdin_line;
use crate::provider::{CommandRunner, HostProbe};
use crate::registry::{InfrastructureMode, VirtualizationType};
use crate::secret::{SecretCoordinates, SecretStore};
use log::{debug, info, warn};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Per-worker result of an NFS mount fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nfs_state: Option<NfsState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of `open`: the volume state plus the fan-out report when workers
/// were contacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenOutcome {
    #[serde(flatten)]
    pub state: VolumeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nfs_nodes: Option<Vec<NodeReport>>,
}

pub struct MasterNode<R, H> {
    config: MasterConfig,
    runner: R,
    host: H,
    secrets: Box<dyn SecretStore>,
    workers: Box<dyn WorkerClient>,
}

impl<R, H> MasterNode<R, H>
where
    R: CommandRunner,
    H: HostProbe,
{
    pub fn new(
        config: MasterConfig,
        runner: R,
        host: H,
        secrets: Box<dyn SecretStore>,
        workers: Box<dyn WorkerClient>,
    ) -> Self {
        Self {
            config,
            runner,
            host,
            secrets,
            workers,
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    fn sudo(&self) -> String {
        format!("{}/sudo", self.config.sudo_path)
    }

    fn fastluks(&self) -> String {
        format!("{}/bin/fastluks", self.config.env_path)
    }

    pub fn status(&self) -> VolumeState {
        let fastluks = self.fastluks();
        let out = self.runner.run(&self.sudo(), &[fastluks.as_str(), "status"], None);
        debug!(
            "volume status exited with {}; stdout: {}; stderr: {}",
            out.status,
            out.stdout.trim(),
            out.stderr.trim()
        );
        VolumeState::from_output(&out)
    }

    /// Reopen the volume with the passphrase held at `coordinates`.
    ///
    /// An already mounted volume is reported as such without contacting the
    /// secret store. Failing to read the secret is an error; everything after
    /// that is reported through the returned state.
    pub fn open(&self, coordinates: &SecretCoordinates) -> LuksResult<OpenOutcome> {
        if self.status().is_mounted() {
            return Ok(OpenOutcome {
                state: VolumeState::Mounted,
                nfs_nodes: None,
            });
        }

        let secret = self.secrets.read_secret(coordinates)?;
        let input = stdin_line(&secret);
        let fastluks = self.fastluks();
        let out = self
            .runner
            .run(&self.sudo(), &[fastluks.as_str(), "open"], Some(input.as_slice()));
        debug!(
            "volume open exited with {}; stdout: {}; stderr: {}",
            out.status,
            out.stdout.trim(),
            out.stderr.trim()
        );

        let state = VolumeState::from_output(&out);
        let mut nfs_nodes = None;
        if state.is_mounted() {
            if self.config.infrastructure == InfrastructureMode::Cluster {
                self.nfs_restart();
                nfs_nodes = Some(self.fan_out());
            } else if self.config.virtualization == Some(VirtualizationType::Docker) {
                self.docker_restart();
            }
        }
        Ok(OpenOutcome { state, nfs_nodes })
    }

    /// NFS server unit for this host, if it can be determined.
    pub fn nfs_service(&self) -> Option<String> {
        if let Some(service) = &self.config.nfs_service {
            return Some(service.clone());
        }
        let distro = self.host.distro_id()?;
        match distro.as_str() {
            "centos" | "rhel" | "rocky" | "almalinux" | "fedora" => Some("nfs-server".into()),
            "ubuntu" | "debian" => Some("nfs-kernel-server".into()),
            _ => None,
        }
    }

    pub fn nfs_restart(&self) {
        let Some(service) = self.nfs_service() else {
            warn!("unknown distribution; not restarting NFS (set nfs_service to override)");
            return;
        };
        self.restart_unit(&service);
    }

    pub fn docker_restart(&self) {
        self.restart_unit("docker");
    }

    fn restart_unit(&self, unit: &str) {
        let out = self
            .runner
            .run(&self.sudo(), &["systemctl", "restart", unit], None);
        if out.success() {
            info!("restarted {unit}");
        } else {
            warn!(
                "systemctl restart {unit} exited with {}: {}",
                out.status,
                out.diagnostic()
            );
        }
    }

    /// Ask every worker, in list order, to mount NFS. A failing worker is
    /// reported and does not stop the remaining ones.
    pub fn fan_out(&self) -> Vec<NodeReport> {
        self.config
            .workers
            .iter()
            .map(|node| match self.workers.nfs_mount(node) {
                Ok(state) => {
                    info!("worker {node} reports nfs {state:?}");
                    NodeReport {
                        node: node.clone(),
                        nfs_state: Some(state),
                        error: None,
                    }
                }
                Err(err) => {
                    warn!("worker {node} mount request failed: {err}");
                    NodeReport {
                        node: node.clone(),
                        nfs_state: None,
                        error: Some(err.to_string()),
                    }
                }
            })
            .collect()
    }

    /// Append an export line per directory and worker to `exports`.
    pub fn write_exports(&self, exports: &Path, export_dirs: &[String]) -> LuksResult<()> {
        write_exports(exports, export_dirs, &self.config.workers)
    }
}

/// Append `<dir> <node>(rw,sync,no_root_squash)` for every directory and
/// worker.
pub fn write_exports(exports: &Path, export_dirs: &[String], workers: &[String]) -> LuksResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(exports)?;
    for dir in export_dirs {
        for node in workers {
            writeln!(file, "{dir} {node}(rw,sync,no_root_squash)")?;
        }
    }
    info!(
        "exported {} directories to {} workers in {}",
        export_dirs.len(),
        workers.len(),
        exports.display()
    );
    Ok(())
}
