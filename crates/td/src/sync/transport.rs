//! Transport seam for the ordering server.
//!
//! The engine talks to [`SyncTransport`] so tests can run against an
//! in-memory server; [`HttpTransport`] is the real JSON-over-HTTPS client.
//! Error mapping follows the taxonomy: 401 is the authentication sentinel,
//! structured 4xx is a server rejection, 5xx and I/O are transient.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use td_core::{
    protocol::{ProjectStatus, PullResponse, PushRequest, PushResponse, SnapshotDownload},
    Error, Result,
};

use super::auth;

/// Base URL override for the ordering server.
pub const ENV_SYNC_URL: &str = "TD_SYNC_URL";

/// Default ordering server.
pub const DEFAULT_BASE_URL: &str = "https://sync.todos.dev";

/// Header carrying the API key.
pub const AUTH_HEADER: &str = "X-TD-Auth-Key";

/// Header carrying `snapshot_seq` on snapshot downloads.
pub const SNAPSHOT_SEQ_HEADER: &str = "X-TD-Snapshot-Seq";

/// Timeout used by interactive sync commands.
pub const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Short timeout used by auto-sync so a dead network never stalls a command.
pub const AUTO_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Typed calls against the remote ordering server.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Whether credentials are available at all. Auto-sync checks this before
    /// spending a network round trip.
    fn has_credentials(&self) -> bool;

    /// `POST /v1/projects/{pid}/events`.
    async fn push_events(&self, project_id: &str, request: &PushRequest)
        -> Result<PushResponse>;

    /// `GET /v1/projects/{pid}/events?since=&limit=&device_id=`.
    async fn pull_events(
        &self,
        project_id: &str,
        since: i64,
        limit: usize,
        device_id: &str,
    ) -> Result<PullResponse>;

    /// `GET /v1/projects/{pid}/status`.
    async fn project_status(&self, project_id: &str) -> Result<ProjectStatus>;

    /// `GET /v1/projects/{pid}/snapshot`. `None` when the server has no
    /// snapshot (404).
    async fn fetch_snapshot(&self, project_id: &str) -> Result<Option<SnapshotDownload>>;
}

/// JSON-over-HTTPS transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

impl HttpTransport {
    /// Build a transport with the given per-request timeout. The base URL
    /// comes from `TD_SYNC_URL` and credentials from the auth resolution.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` when the HTTP client cannot be constructed.
    pub fn new(timeout: Duration) -> Result<Self> {
        let base_url = std::env::var(ENV_SYNC_URL)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: auth::load_api_key(),
        })
    }

    fn url(&self, project_id: &str, tail: &str) -> String {
        format!("{}/v1/projects/{project_id}/{tail}", self.base_url)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let key = self.api_key.as_ref().ok_or(Error::NotAuthenticated)?;
        Ok(request.header(AUTH_HEADER, key))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::NotAuthenticated);
        }
        if status.is_client_error() {
            let code = status.as_u16();
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                // 4xx without a structured body is indistinguishable from a
                // misbehaving proxy; treat as transient.
                Err(_) => return Err(Error::transport(format!("HTTP {code}"))),
            };
            return Err(Error::ServerRejected {
                status: code,
                message,
            });
        }
        Err(Error::transport(format!("HTTP {status}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .authed(self.client.get(url))?
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    async fn push_events(
        &self,
        project_id: &str,
        request: &PushRequest,
    ) -> Result<PushResponse> {
        let url = self.url(project_id, "events");
        let response = self
            .authed(self.client.post(&url))?
            .json(request)
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))
    }

    async fn pull_events(
        &self,
        project_id: &str,
        since: i64,
        limit: usize,
        device_id: &str,
    ) -> Result<PullResponse> {
        let url = format!(
            "{}?since={since}&limit={limit}&device_id={device_id}",
            self.url(project_id, "events")
        );
        self.get_json(&url).await
    }

    async fn project_status(&self, project_id: &str) -> Result<ProjectStatus> {
        self.get_json(&self.url(project_id, "status")).await
    }

    async fn fetch_snapshot(&self, project_id: &str) -> Result<Option<SnapshotDownload>> {
        let url = self.url(project_id, "snapshot");
        let response = self
            .authed(self.client.get(&url))?
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        let snapshot_seq = response
            .headers()
            .get(SNAPSHOT_SEQ_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Parse("snapshot response missing sequence header".into()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        Ok(Some(SnapshotDownload {
            snapshot_seq,
            bytes: bytes.to_vec(),
        }))
    }
}
