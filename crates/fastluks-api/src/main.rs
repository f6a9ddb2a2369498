use anyhow::{Context, Result};
use fastluks_core::cluster::{HttpWorkerClient, MasterNode, WorkerNode};
use fastluks_core::{logging, ApiConfig, VaultClient, DEFAULT_REGISTRY_PATH};
use fastluks_system::{SystemCommandRunner, SystemHost};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

mod routes;

use routes::{router, AppState, Node};

const REGISTRY_ENV: &str = "FASTLUKS_REGISTRY";
const ADDR_ENV: &str = "FASTLUKS_API_ADDR";
const DEFAULT_ADDR: &str = "0.0.0.0:5000";
/// Local `fastluks` invocations (open can run luksOpen) get this long.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

type SystemNode = Node<SystemCommandRunner, SystemHost>;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("fastluks-api", "info");
    let registry = PathBuf::from(
        std::env::var(REGISTRY_ENV).unwrap_or_else(|_| DEFAULT_REGISTRY_PATH.to_string()),
    );
    let addr: SocketAddr = std::env::var(ADDR_ENV)
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()
        .with_context(|| format!("parse {ADDR_ENV}"))?;

    let node = build_node(&registry)?;
    info!(
        "fastluks control plane booting as {} (registry: {})",
        node.role(),
        registry.display()
    );
    let state = AppState::new(node);

    tokio::spawn(reload_on_hangup(state.clone(), registry));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown())
        .await
        .context("serve control plane")?;
    info!("control plane stopped");
    Ok(())
}

fn build_node(registry: &Path) -> Result<SystemNode> {
    let config = ApiConfig::load(registry)
        .with_context(|| format!("load [luksctl_api] from {}", registry.display()))?;
    let runner = SystemCommandRunner::new(Some(COMMAND_TIMEOUT));
    let host = SystemHost::new();
    Ok(match config {
        ApiConfig::Master(master) => {
            let secrets = VaultClient::new(master.worker_timeout);
            let workers = HttpWorkerClient::new(master.worker_port, master.worker_timeout);
            Node::Master(MasterNode::new(
                master,
                runner,
                host,
                Box::new(secrets),
                Box::new(workers),
            ))
        }
        ApiConfig::Worker(worker) => Node::Worker(WorkerNode::new(worker, runner, host)),
    })
}

/// Re-read the registry on every SIGHUP. A registry that fails to load keeps
/// the current node in service.
async fn reload_on_hangup(state: AppState<SystemCommandRunner, SystemHost>, registry: PathBuf) {
    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("SIGHUP reload unavailable: {err}");
            return;
        }
    };
    while hangups.recv().await.is_some() {
        let path = registry.clone();
        match tokio::task::spawn_blocking(move || build_node(&path)).await {
            Ok(Ok(node)) => {
                state.replace(node).await;
                info!("reloaded {}", registry.display());
            }
            Ok(Err(err)) => warn!("reload failed, keeping current configuration: {err:#}"),
            Err(err) => warn!("reload task failed: {err}"),
        }
    }
}

async fn shutdown() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("unable to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}
