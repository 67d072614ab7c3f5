//! Secret hashing for key lookup.
//!
//! Raw API keys never reach the mirror; they are hashed first and the hash
//! is the lookup key. Production deployments delegate hashing to an
//! encryption sidecar so the secret never leaves a trusted boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::net::HttpClient;

#[derive(Debug, thiserror::Error)]
pub enum EncryptError {
    #[error("encryption sidecar request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("encryption sidecar returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait Encryptor: Send + Sync {
    async fn encrypt(&self, secret: &str) -> Result<String, EncryptError>;
}

/// Hex SHA-256 of the secret. Used when no sidecar is configured.
pub struct LocalEncryptor;

pub fn sha256_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl Encryptor for LocalEncryptor {
    async fn encrypt(&self, secret: &str) -> Result<String, EncryptError> {
        Ok(sha256_key(secret))
    }
}

#[derive(Serialize)]
struct EncryptRequest<'a> {
    secret: &'a str,
}

#[derive(Deserialize)]
struct EncryptResponse {
    encrypted: String,
}

/// Client for the external encryption sidecar.
pub struct SidecarEncryptor {
    client: HttpClient,
    url: String,
    audience_token: String,
}

impl SidecarEncryptor {
    pub fn new(client: HttpClient, url: impl Into<String>, audience_token: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            audience_token: audience_token.into(),
        }
    }
}

#[async_trait]
impl Encryptor for SidecarEncryptor {
    async fn encrypt(&self, secret: &str) -> Result<String, EncryptError> {
        let mut req = self
            .client
            .inner()
            .post(&self.url)
            .json(&EncryptRequest { secret });
        if !self.audience_token.is_empty() {
            req = req.bearer_auth(&self.audience_token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EncryptError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body: EncryptResponse = resp.json().await?;
        Ok(body.encrypted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_local_is_hex_sha256() {
        let hash = LocalEncryptor.encrypt("abc").await.unwrap();
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_sidecar_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/secrets/encrypt"))
            .and(header("authorization", "Bearer aud"))
            .and(body_json(json!({"secret": "sk-raw"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"encrypted": "h1"})))
            .mount(&server)
            .await;

        let enc = SidecarEncryptor::new(
            HttpClient::new(),
            format!("{}/api/secrets/encrypt", server.uri()),
            "aud",
        );
        assert_eq!(enc.encrypt("sk-raw").await.unwrap(), "h1");
    }

    #[tokio::test]
    async fn test_sidecar_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let enc = SidecarEncryptor::new(HttpClient::new(), server.uri(), "");
        let err = enc.encrypt("x").await.unwrap_err();
        assert!(matches!(err, EncryptError::Status { status: 503, .. }));
    }
}
