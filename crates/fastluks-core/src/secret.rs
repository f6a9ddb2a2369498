//! Passphrase escrow in a HashiCorp Vault KV v2 engine.
//!
//! Every operation starts from a single-use wrapping token: it is unwrapped
//! into a client token, used once, and the client token is revoked again.

use crate::error::{LuksError, LuksResult};
use crate::passphrase::Secret;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

/// Where a passphrase lives and how to get access to it.
#[derive(Clone, Deserialize)]
pub struct SecretCoordinates {
    pub vault_url: String,
    pub wrapping_token: String,
    #[serde(default = "default_secret_root")]
    pub secret_root: String,
    pub secret_path: String,
    pub secret_key: String,
}

fn default_secret_root() -> String {
    "secrets".to_string()
}

impl fmt::Debug for SecretCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCoordinates")
            .field("vault_url", &self.vault_url)
            .field("wrapping_token", &"<redacted>")
            .field("secret_root", &self.secret_root)
            .field("secret_path", &self.secret_path)
            .field("secret_key", &self.secret_key)
            .finish()
    }
}

impl SecretCoordinates {
    fn data_url(&self) -> String {
        format!(
            "{}/v1/{}/data/{}",
            base(&self.vault_url),
            self.secret_root.trim_matches('/'),
            self.secret_path.trim_matches('/')
        )
    }
}

/// Remote storage for volume passphrases.
pub trait SecretStore: Send + Sync {
    fn write_secret(&self, coordinates: &SecretCoordinates, secret: &str) -> LuksResult<()>;
    fn read_secret(&self, coordinates: &SecretCoordinates) -> LuksResult<Secret>;
}

pub struct VaultClient {
    agent: ureq::Agent,
}

impl VaultClient {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self { agent }
    }

    fn unwrap_token(&self, coordinates: &SecretCoordinates) -> LuksResult<Zeroizing<String>> {
        let url = format!("{}/v1/sys/wrapping/unwrap", base(&coordinates.vault_url));
        let body = into_json(
            self.agent
                .post(&url)
                .set("X-Vault-Token", &coordinates.wrapping_token)
                .call(),
            "unwrap wrapping token",
        )?;
        body.pointer("/auth/client_token")
            .and_then(Value::as_str)
            .map(|token| Zeroizing::new(token.to_string()))
            .ok_or_else(|| {
                LuksError::SecretStore("unwrap response carries no client token".to_string())
            })
    }

    fn revoke(&self, vault_url: &str, token: &str) {
        let url = format!("{}/v1/auth/token/revoke-self", base(vault_url));
        match self.agent.post(&url).set("X-Vault-Token", token).call() {
            Ok(_) => debug!("vault client token revoked"),
            Err(err) => warn!("failed to revoke vault client token: {err}"),
        }
    }
}

impl SecretStore for VaultClient {
    fn write_secret(&self, coordinates: &SecretCoordinates, secret: &str) -> LuksResult<()> {
        if let Err(err) = self.agent.get(&coordinates.vault_url).call() {
            if !matches!(err, ureq::Error::Status(..)) {
                return Err(LuksError::SecretStore(format!(
                    "vault at {} is unreachable: {err}",
                    coordinates.vault_url
                )));
            }
        }

        let token = self.unwrap_token(coordinates)?;
        let payload = json!({
            "options": { "cas": 0 },
            "data": { coordinates.secret_key.as_str(): secret },
        });
        let result = into_json(
            self.agent
                .post(&coordinates.data_url())
                .set("X-Vault-Token", &token)
                .send_json(payload),
            "write secret",
        )
        .and_then(|body| validate_write_response(&body));
        self.revoke(&coordinates.vault_url, &token);
        result
    }

    fn read_secret(&self, coordinates: &SecretCoordinates) -> LuksResult<Secret> {
        let token = self.unwrap_token(coordinates)?;
        let result = into_json(
            self.agent
                .get(&coordinates.data_url())
                .set("X-Vault-Token", &token)
                .call(),
            "read secret",
        )
        .and_then(|body| extract_secret(&body, &coordinates.secret_key));
        self.revoke(&coordinates.vault_url, &token);
        result
    }
}

fn base(url: &str) -> &str {
    url.trim_end_matches('/')
}

fn into_json(
    response: Result<ureq::Response, ureq::Error>,
    action: &str,
) -> LuksResult<Value> {
    match response {
        Ok(resp) => resp
            .into_json()
            .map_err(|err| LuksError::SecretStore(format!("{action}: invalid response: {err}"))),
        Err(ureq::Error::Status(code, resp)) => {
            let text = resp.into_string().unwrap_or_default();
            Err(LuksError::SecretStore(format!(
                "{action}: vault returned {code}: {}",
                text.trim()
            )))
        }
        Err(err) => Err(LuksError::SecretStore(format!("{action}: {err}"))),
    }
}

/// A fresh check-and-set write must come back as version 1, live, with a
/// creation time.
pub fn validate_write_response(body: &Value) -> LuksResult<()> {
    let data = body
        .get("data")
        .ok_or_else(|| LuksError::SecretStore("write response has no data".to_string()))?;

    let mut problems = Vec::new();
    if data
        .get("created_time")
        .and_then(Value::as_str)
        .map_or(true, str::is_empty)
    {
        problems.push("missing created_time");
    }
    if data.get("destroyed").and_then(Value::as_bool) != Some(false) {
        problems.push("secret marked destroyed");
    }
    if data.get("version").and_then(Value::as_u64) != Some(1) {
        problems.push("unexpected version (secret already existed?)");
    }
    if !data
        .get("deletion_time")
        .and_then(Value::as_str)
        .map_or(true, str::is_empty)
    {
        problems.push("deletion_time set");
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(LuksError::SecretStore(format!(
            "vault rejected write: {}",
            problems.join(", ")
        )))
    }
}

pub fn extract_secret(body: &Value, key: &str) -> LuksResult<Secret> {
    body.pointer("/data/data")
        .and_then(|data| data.get(key))
        .and_then(Value::as_str)
        .map(|secret| Zeroizing::new(secret.to_string()))
        .ok_or_else(|| LuksError::SecretStore(format!("secret has no key `{key}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinates() -> SecretCoordinates {
        SecretCoordinates {
            vault_url: "https://vault.example.org:8200/".into(),
            wrapping_token: "s.wrapped".into(),
            secret_root: "/secrets/".into(),
            secret_path: "cluster-a".into(),
            secret_key: "luks".into(),
        }
    }

    #[test]
    fn data_url_normalises_slashes() {
        assert_eq!(
            coordinates().data_url(),
            "https://vault.example.org:8200/v1/secrets/data/cluster-a"
        );
    }

    #[test]
    fn debug_hides_wrapping_token() {
        let text = format!("{:?}", coordinates());
        assert!(!text.contains("s.wrapped"));
    }

    #[test]
    fn accepts_fresh_write() {
        let body = json!({"data": {
            "created_time": "2024-01-01T00:00:00Z",
            "deletion_time": "",
            "destroyed": false,
            "version": 1
        }});
        assert!(validate_write_response(&body).is_ok());
    }

    #[test]
    fn rejects_overwrite() {
        let body = json!({"data": {
            "created_time": "2024-01-01T00:00:00Z",
            "deletion_time": "",
            "destroyed": false,
            "version": 2
        }});
        let err = validate_write_response(&body).unwrap_err();
        assert!(err.to_string().contains("version"));
        assert!(validate_write_response(&json!({})).is_err());
    }

    #[test]
    fn extracts_nested_key() {
        let body = json!({"data": {"data": {"luks": "s3cret"}, "metadata": {}}});
        assert_eq!(extract_secret(&body, "luks").unwrap().as_str(), "s3cret");
        assert!(matches!(
            extract_secret(&body, "other"),
            Err(LuksError::SecretStore(_))
        ));
    }

    #[test]
    fn request_body_defaults_secret_root() {
        let coords: SecretCoordinates = serde_json::from_str(
            r#"{"vault_url":"http://v","wrapping_token":"t","secret_path":"p","secret_key":"k"}"#,
        )
        .unwrap();
        assert_eq!(coords.secret_root, "secrets");
    }
}
