//! HTTP surface of the control plane.
//!
//! Both route families are mounted; a request for the role this node does not
//! play is answered with 404 so a role change on reload needs no rebuild.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fastluks_core::cluster::{
    MasterNode, NfsReply, OpenOutcome, VolumeState, WorkerNode, MASTER_API_PREFIX,
    WORKER_API_PREFIX,
};
use fastluks_core::{CommandRunner, HostProbe, LuksError, SecretCoordinates};
use log::{info, warn};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Role-specific engine currently served by the daemon.
pub enum Node<R, H> {
    Master(MasterNode<R, H>),
    Worker(WorkerNode<R, H>),
}

impl<R, H> Node<R, H> {
    pub fn role(&self) -> &'static str {
        match self {
            Node::Master(_) => "master",
            Node::Worker(_) => "worker",
        }
    }
}

pub struct AppState<R, H> {
    node: Arc<RwLock<Arc<Node<R, H>>>>,
}

impl<R, H> Clone for AppState<R, H> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<R, H> AppState<R, H> {
    pub fn new(node: Node<R, H>) -> Self {
        Self {
            node: Arc::new(RwLock::new(Arc::new(node))),
        }
    }

    pub async fn current(&self) -> Arc<Node<R, H>> {
        Arc::clone(&*self.node.read().await)
    }

    /// Swap the served node; in-flight requests finish on the old one.
    pub async fn replace(&self, node: Node<R, H>) {
        let mut guard = self.node.write().await;
        if guard.role() != node.role() {
            info!("role changed from {} to {}", guard.role(), node.role());
        }
        *guard = Arc::new(node);
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn wrong_role(expected: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "FL3101",
            message: format!("this node is not a {expected}"),
        }
    }
}

impl From<LuksError> for ApiError {
    fn from(err: LuksError) -> Self {
        let status = match &err {
            LuksError::SecretStore(_) | LuksError::Orchestration(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "FL1000",
            message: format!("worker task failed: {err}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!("request failed with {}: {}", self.code, self.message);
        (
            self.status,
            Json(json!({ "error": self.message, "code": self.code })),
        )
            .into_response()
    }
}

pub fn router<R, H>(state: AppState<R, H>) -> Router
where
    R: CommandRunner + Send + Sync + 'static,
    H: HostProbe + Send + Sync + 'static,
{
    Router::new()
        .route(
            &format!("{MASTER_API_PREFIX}/status"),
            get(master_status::<R, H>),
        )
        .route(&format!("{MASTER_API_PREFIX}/open"), post(master_open::<R, H>))
        .route(
            &format!("{WORKER_API_PREFIX}/status"),
            get(worker_status::<R, H>),
        )
        .route(
            &format!("{WORKER_API_PREFIX}/nfs-mount"),
            post(worker_mount::<R, H>),
        )
        .with_state(state)
}

/// Run `f` against the master engine on the blocking pool.
async fn on_master<R, H, T, F>(state: &AppState<R, H>, f: F) -> Result<T, ApiError>
where
    R: CommandRunner + Send + Sync + 'static,
    H: HostProbe + Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&MasterNode<R, H>) -> Result<T, ApiError> + Send + 'static,
{
    let node = state.current().await;
    tokio::task::spawn_blocking(move || match &*node {
        Node::Master(master) => f(master),
        Node::Worker(_) => Err(ApiError::wrong_role("master")),
    })
    .await?
}

async fn on_worker<R, H, T, F>(state: &AppState<R, H>, f: F) -> Result<T, ApiError>
where
    R: CommandRunner + Send + Sync + 'static,
    H: HostProbe + Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&WorkerNode<R, H>) -> T + Send + 'static,
{
    let node = state.current().await;
    tokio::task::spawn_blocking(move || match &*node {
        Node::Worker(worker) => Ok(f(worker)),
        Node::Master(_) => Err(ApiError::wrong_role("worker")),
    })
    .await?
}

async fn master_status<R, H>(
    State(state): State<AppState<R, H>>,
) -> Result<Json<VolumeState>, ApiError>
where
    R: CommandRunner + Send + Sync + 'static,
    H: HostProbe + Send + Sync + 'static,
{
    let volume = on_master(&state, |master| Ok(master.status())).await?;
    Ok(Json(volume))
}

async fn master_open<R, H>(
    State(state): State<AppState<R, H>>,
    Json(coordinates): Json<SecretCoordinates>,
) -> Result<Json<OpenOutcome>, ApiError>
where
    R: CommandRunner + Send + Sync + 'static,
    H: HostProbe + Send + Sync + 'static,
{
    info!("open requested for {}", coordinates.secret_path);
    let outcome = on_master(&state, move |master| Ok(master.open(&coordinates)?)).await?;
    Ok(Json(outcome))
}

async fn worker_status<R, H>(
    State(state): State<AppState<R, H>>,
) -> Result<Json<NfsReply>, ApiError>
where
    R: CommandRunner + Send + Sync + 'static,
    H: HostProbe + Send + Sync + 'static,
{
    let nfs_state = on_worker(&state, |worker| worker.status()).await?;
    Ok(Json(NfsReply { nfs_state }))
}

async fn worker_mount<R, H>(
    State(state): State<AppState<R, H>>,
) -> Result<Json<NfsReply>, ApiError>
where
    R: CommandRunner + Send + Sync + 'static,
    H: HostProbe + Send + Sync + 'static,
{
    info!("nfs mount requested");
    let nfs_state = on_worker(&state, |worker| worker.mount()).await?;
    Ok(Json(NfsReply { nfs_state }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use fastluks_core::cluster::{MasterConfig, NfsState, WorkerClient, WorkerConfig};
    use fastluks_core::registry::InfrastructureMode;
    use fastluks_core::{CommandOutput, LuksResult, Secret, SecretStore};
    use serde_json::Value;
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tower::ServiceExt;
    use zeroize::Zeroizing;

    /// Answers `<program> <args...>` lines by substring with a fixed status.
    #[derive(Default)]
    struct ScriptedRunner {
        statuses: Vec<(&'static str, i32)>,
        calls: Mutex<Vec<String>>,
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[&str], _input: Option<&[u8]>) -> CommandOutput {
            let line = format!("{program} {}", args.join(" "));
            self.calls.lock().unwrap().push(line.clone());
            let status = self
                .statuses
                .iter()
                .find(|(pattern, _)| line.contains(pattern))
                .map(|(_, status)| *status)
                .unwrap_or(0);
            CommandOutput {
                stdout: String::new(),
                stderr: if status == 0 { String::new() } else { "boom".into() },
                status,
            }
        }
    }

    #[derive(Default)]
    struct MountTable(HashSet<PathBuf>);

    impl HostProbe for MountTable {
        fn is_mount_point(&self, path: &Path) -> bool {
            self.0.contains(path)
        }

        fn is_block_device(&self, _path: &Path) -> bool {
            false
        }

        fn distro_id(&self) -> Option<String> {
            Some("ubuntu".into())
        }
    }

    struct StaticSecret(Option<&'static str>);

    impl SecretStore for StaticSecret {
        fn write_secret(&self, _: &SecretCoordinates, _: &str) -> LuksResult<()> {
            Ok(())
        }

        fn read_secret(&self, _: &SecretCoordinates) -> LuksResult<Secret> {
            self.0
                .map(|text| Zeroizing::new(text.to_string()))
                .ok_or_else(|| LuksError::SecretStore("permission denied".into()))
        }
    }

    struct AlwaysMounted;

    impl WorkerClient for AlwaysMounted {
        fn nfs_mount(&self, _node: &str) -> LuksResult<NfsState> {
            Ok(NfsState::Mounted)
        }

        fn status(&self, _node: &str) -> LuksResult<NfsState> {
            Ok(NfsState::Mounted)
        }
    }

    fn master(
        runner: ScriptedRunner,
        secret: Option<&'static str>,
        config: MasterConfig,
    ) -> AppState<ScriptedRunner, MountTable> {
        AppState::new(Node::Master(MasterNode::new(
            config,
            runner,
            MountTable::default(),
            Box::new(StaticSecret(secret)),
            Box::new(AlwaysMounted),
        )))
    }

    fn worker(mounted: &[&str]) -> AppState<ScriptedRunner, MountTable> {
        let table = MountTable(mounted.iter().map(PathBuf::from).collect());
        AppState::new(Node::Worker(WorkerNode::new(
            WorkerConfig {
                mountpoints: vec!["/home".into()],
                sudo_path: "/usr/bin".into(),
            },
            ScriptedRunner::default(),
            table,
        )))
    }

    async fn call<R, H>(state: AppState<R, H>, method: &str, uri: &str, body: Body) -> (StatusCode, Value)
    where
        R: CommandRunner + Send + Sync + 'static,
        H: HostProbe + Send + Sync + 'static,
    {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn open_body() -> Body {
        Body::from(
            json!({
                "vault_url": "https://vault.example:8200",
                "wrapping_token": "s.wrapped",
                "secret_root": "secrets",
                "secret_path": "cluster-1",
                "secret_key": "luks"
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn master_status_reports_tri_state() {
        let state = master(ScriptedRunner::default(), None, MasterConfig::default());
        let (status, body) = call(state, "GET", "/luksctl_api/v1.0/status", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"volume_state": "mounted"}));

        let runner = ScriptedRunner {
            statuses: vec![("fastluks status", 3)],
            ..ScriptedRunner::default()
        };
        let state = master(runner, None, MasterConfig::default());
        let (_, body) = call(state, "GET", "/luksctl_api/v1.0/status", Body::empty()).await;
        assert_eq!(body["volume_state"], "unavailable");
        assert_eq!(body["stderr"], "boom");
    }

    #[tokio::test]
    async fn master_open_fans_out_in_cluster_mode() {
        let runner = ScriptedRunner {
            statuses: vec![("fastluks status", 1)],
            ..ScriptedRunner::default()
        };
        let config = MasterConfig {
            infrastructure: InfrastructureMode::Cluster,
            workers: vec!["10.0.0.2".into()],
            ..MasterConfig::default()
        };
        let state = master(runner, Some("s3cret"), config);
        let (status, body) = call(state, "POST", "/luksctl_api/v1.0/open", open_body()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["volume_state"], "mounted");
        assert_eq!(body["nfs_nodes"][0]["node"], "10.0.0.2");
        assert_eq!(body["nfs_nodes"][0]["nfs_state"], "mounted");
    }

    #[tokio::test]
    async fn unreadable_secret_is_a_bad_gateway() {
        let runner = ScriptedRunner {
            statuses: vec![("fastluks status", 1)],
            ..ScriptedRunner::default()
        };
        let state = master(runner, None, MasterConfig::default());
        let (status, body) = call(state, "POST", "/luksctl_api/v1.0/open", open_body()).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "FL3000");
    }

    #[tokio::test]
    async fn worker_routes_report_nfs_state() {
        let (status, body) =
            call(worker(&["/home"]), "GET", "/luksctl_api_wn/v1.0/status", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"nfs_state": "mounted"}));

        let (_, body) =
            call(worker(&[]), "POST", "/luksctl_api_wn/v1.0/nfs-mount", Body::empty()).await;
        assert_eq!(body, json!({"nfs_state": "unmounted"}));
    }

    #[tokio::test]
    async fn wrong_role_is_not_found() {
        let (status, _) =
            call(worker(&[]), "GET", "/luksctl_api/v1.0/status", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let state = master(ScriptedRunner::default(), None, MasterConfig::default());
        let (status, body) =
            call(state, "POST", "/luksctl_api_wn/v1.0/nfs-mount", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "FL3101");
    }

    #[tokio::test]
    async fn replace_swaps_the_served_role() {
        let state = worker(&["/home"]);
        state
            .replace(Node::Master(MasterNode::new(
                MasterConfig::default(),
                ScriptedRunner::default(),
                MountTable::default(),
                Box::new(StaticSecret(None)),
                Box::new(AlwaysMounted),
            )))
            .await;
        assert_eq!(state.current().await.role(), "master");
        let (status, _) =
            call(state, "GET", "/luksctl_api/v1.0/status", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
    }
}
