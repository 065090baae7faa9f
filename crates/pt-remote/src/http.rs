//! HTTP client for the remote coordination service.

use async_trait::async_trait;
use pt_types::RemoteError;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::backend::{
    CreateSessionRequest, FinalizeRequest, RemoteBackend, RemoteSessionId, TrialSubmission,
};

/// Endpoint settings. Credentials are passed separately so this can be
/// loaded from a settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Bearer token for the remote service.
#[derive(Clone)]
pub struct RemoteCredentials {
    api_key: String,
}

impl RemoteCredentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }
}

impl fmt::Debug for RemoteCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCredentials")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    session_id: RemoteSessionId,
}

/// [`RemoteBackend`] speaking JSON over HTTP with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpRemoteBackend {
    config: RemoteConfig,
    credentials: RemoteCredentials,
    client: reqwest::Client,
}

impl HttpRemoteBackend {
    pub fn new(config: RemoteConfig, credentials: RemoteCredentials) -> Self {
        Self {
            config,
            credentials,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, RemoteError> {
        let url = self.config.endpoint(path);
        debug!(url = %url, "remote request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.credentials.api_key)
            .timeout(self.config.request_timeout())
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(classify_status(status, message))
    }

    fn transport_error(&self, error: reqwest::Error) -> RemoteError {
        if error.is_timeout() {
            RemoteError::Timeout {
                timeout_ms: self.config.request_timeout_ms,
            }
        } else {
            RemoteError::Unreachable(error.to_string())
        }
    }
}

/// Map a non-success HTTP status onto the remote error taxonomy.
fn classify_status(status: StatusCode, message: String) -> RemoteError {
    let code = status.as_u16();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::Authentication { status: code }
        }
        s if s.is_server_error() => RemoteError::Server {
            status: code,
            message,
        },
        _ => RemoteError::UnexpectedStatus { status: code },
    }
}

#[async_trait]
impl RemoteBackend for HttpRemoteBackend {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<RemoteSessionId, RemoteError> {
        let response = self.post("sessions", request).await?;
        let body: CreateSessionResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::MalformedResponse(e.to_string()))?;
        Ok(body.session_id)
    }

    async fn report_trial(
        &self,
        session: &RemoteSessionId,
        trial: &TrialSubmission,
    ) -> Result<(), RemoteError> {
        self.post(&format!("sessions/{session}/trials"), trial)
            .await
            .map(|_| ())
    }

    async fn finalize(
        &self,
        session: &RemoteSessionId,
        request: &FinalizeRequest,
    ) -> Result<(), RemoteError> {
        self.post(&format!("sessions/{session}/finalize"), request)
            .await
            .map(|_| ())
    }

    fn name(&self) -> &str {
        "http"
    }
}
