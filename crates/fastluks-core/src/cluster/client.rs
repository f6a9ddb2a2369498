use super::{NfsReply, NfsState, WORKER_API_PREFIX};
use crate::error::{LuksError, LuksResult};
use std::time::Duration;

/// Calls a worker node's control-plane endpoints.
pub trait WorkerClient: Send + Sync {
    /// `POST /nfs-mount` on `node`.
    fn nfs_mount(&self, node: &str) -> LuksResult<NfsState>;

    /// `GET /status` on `node`.
    fn status(&self, node: &str) -> LuksResult<NfsState>;
}

pub struct HttpWorkerClient {
    agent: ureq::Agent,
    port: u16,
}

impl HttpWorkerClient {
    pub fn new(port: u16, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self { agent, port }
    }

    /// Bare addresses get the configured port; full URLs are used as given.
    pub fn endpoint(&self, node: &str, action: &str) -> String {
        let base = if node.starts_with("http://") || node.starts_with("https://") {
            node.trim_end_matches('/').to_string()
        } else {
            format!("http://{node}:{}", self.port)
        };
        format!("{base}{WORKER_API_PREFIX}/{action}")
    }

    fn decode(
        node: &str,
        response: Result<ureq::Response, ureq::Error>,
    ) -> LuksResult<NfsState> {
        match response {
            Ok(resp) => resp
                .into_json::<NfsReply>()
                .map(|reply| reply.nfs_state)
                .map_err(|err| {
                    LuksError::Orchestration(format!("{node}: malformed reply: {err}"))
                }),
            Err(ureq::Error::Status(code, resp)) => {
                let text = resp.into_string().unwrap_or_default();
                Err(LuksError::Orchestration(format!(
                    "{node}: HTTP {code}: {}",
                    text.trim()
                )))
            }
            Err(err) => Err(LuksError::Orchestration(format!("{node}: {err}"))),
        }
    }
}

impl WorkerClient for HttpWorkerClient {
    fn nfs_mount(&self, node: &str) -> LuksResult<NfsState> {
        let url = self.endpoint(node, "nfs-mount");
        Self::decode(node, self.agent.post(&url).call())
    }

    fn status(&self, node: &str) -> LuksResult<NfsState> {
        let url = self.endpoint(node, "status");
        Self::decode(node, self.agent.get(&url).call())
    }
}
