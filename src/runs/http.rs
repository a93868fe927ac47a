//! runs::http
//!
//! Runs API client over HTTPS.
//!
//! # Design
//!
//! Every endpoint lives under `https://<hostname>/api/v2`. Bodies are plain
//! JSON documents matching the types in [`super::traits`]. The advertised API
//! version comes from the `X-Stratus-Api-Version` header on `GET /ping`.
//!
//! Errors are mapped from HTTP status codes in one place
//! ([`HttpRunsApi::handle_error_response`]) so callers only ever see
//! [`ApiError`].
//!
//! # Rate Limiting
//!
//! A 429 maps to [`ApiError::RateLimited`]. Retrying is the caller's
//! responsibility; the polling loops in the engine back off naturally.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::traits::{
    ApiError, ApiVersion, ConfigurationVersion, CostEstimate, CreateRunRequest, LogChunk,
    LogSource, PolicyCheck, Run, RunsApi, Workspace,
};
use crate::core::state::StateSnapshot;

/// Header carrying the advertised API version.
pub const API_VERSION_HEADER: &str = "X-Stratus-Api-Version";

const USER_AGENT_VALUE: &str = concat!("stratus/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Serialize)]
struct ActionBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct LockBody<'a> {
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct NewConfigurationVersion {
    speculative: bool,
}

#[derive(Debug, Deserialize)]
struct LogChunkBody {
    data: String,
    complete: bool,
}

/// HTTP implementation of [`RunsApi`].
pub struct HttpRunsApi {
    client: Client,
    hostname: String,
    token: String,
    api_base: String,
}

// Custom Debug to avoid exposing the token
impl std::fmt::Debug for HttpRunsApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRunsApi")
            .field("hostname", &self.hostname)
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl HttpRunsApi {
    pub fn new(hostname: impl Into<String>, token: impl Into<String>) -> Self {
        let hostname = hostname.into();
        let api_base = format!("https://{}/api/v2", hostname);
        Self {
            client: Client::new(),
            hostname,
            token: token.into(),
            api_base,
        }
    }

    /// Point the client at a different base URL (tests, proxies).
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.token)) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ApiError> {
        tracing::trace!(path, "GET");
        let response = self
            .client
            .get(self.url(path))
            .headers(self.headers())
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        self.handle_response(response).await
    }

    async fn post<B: Serialize + ?Sized, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        tracing::trace!(path, "POST");
        let response = self
            .client
            .post(self.url(path))
            .headers(self.headers())
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        self.handle_response(response).await
    }

    async fn post_empty<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        tracing::trace!(path, "POST");
        let response = self
            .client
            .post(self.url(path))
            .headers(self.headers())
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            self.handle_error_response(response, status).await
        }
    }

    /// Handle a response, parsing JSON on success.
    async fn handle_response<T: for<'de> Deserialize<'de>>(
        &self,
        response: Response,
    ) -> Result<T, ApiError> {
        let status = response.status();

        if status.is_success() {
            response.json().await.map_err(|e| ApiError::Api {
                status: status.as_u16(),
                message: format!("Failed to parse response: {}", e),
            })
        } else {
            self.handle_error_response(response, status).await
        }
    }

    /// Handle an error response from the API.
    async fn handle_error_response<T>(
        &self,
        response: Response,
        status: StatusCode,
    ) -> Result<T, ApiError> {
        let message = match response.json::<ErrorBody>().await {
            Ok(err) => err.message,
            Err(_) => "Unknown error".to_string(),
        };

        Err(match status {
            StatusCode::UNAUTHORIZED => ApiError::AuthFailed("Invalid or expired token".into()),
            StatusCode::FORBIDDEN => ApiError::AuthFailed(format!("Permission denied: {}", message)),
            StatusCode::NOT_FOUND => ApiError::NotFound(message),
            StatusCode::CONFLICT => ApiError::Conflict(message),
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
            StatusCode::NOT_IMPLEMENTED => ApiError::NotImplemented(message),
            _ if status.is_server_error() => ApiError::Api {
                status: status.as_u16(),
                message: format!("server error: {}", message),
            },
            _ => ApiError::Api {
                status: status.as_u16(),
                message,
            },
        })
    }

    fn log_path(run_id: &str, source: &LogSource) -> String {
        match source {
            LogSource::Plan => format!("/runs/{}/logs/plan", run_id),
            LogSource::Apply => format!("/runs/{}/logs/apply", run_id),
            LogSource::PolicyCheck(id) => format!("/policy-checks/{}/log", id),
        }
    }
}

#[async_trait]
impl RunsApi for HttpRunsApi {
    fn name(&self) -> &'static str {
        "http"
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn api_version(&self) -> Result<ApiVersion, ApiError> {
        let response = self
            .client
            .get(self.url("/ping"))
            .headers(self.headers())
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return self.handle_error_response(response, status).await;
        }
        let header = response
            .headers()
            .get(API_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        ApiVersion::parse(&header).ok_or_else(|| ApiError::Api {
            status: status.as_u16(),
            message: format!("invalid {} header: '{}'", API_VERSION_HEADER, header),
        })
    }

    async fn read_workspace(&self, organization: &str, name: &str) -> Result<Workspace, ApiError> {
        self.get(&format!("/organizations/{}/workspaces/{}", organization, name))
            .await
    }

    async fn create_configuration_version(
        &self,
        workspace_id: &str,
        speculative: bool,
    ) -> Result<ConfigurationVersion, ApiError> {
        self.post(
            &format!("/workspaces/{}/configuration-versions", workspace_id),
            &NewConfigurationVersion { speculative },
        )
        .await
    }

    async fn upload_configuration(
        &self,
        cv: &ConfigurationVersion,
        archive: Vec<u8>,
    ) -> Result<(), ApiError> {
        tracing::debug!(cv_id = %cv.id, bytes = archive.len(), "uploading configuration");
        let response = self
            .client
            .put(&cv.upload_url)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(archive)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            self.handle_error_response(response, status).await
        }
    }

    async fn read_configuration_version(&self, id: &str) -> Result<ConfigurationVersion, ApiError> {
        self.get(&format!("/configuration-versions/{}", id)).await
    }

    async fn create_run(&self, request: CreateRunRequest) -> Result<Run, ApiError> {
        self.post("/runs", &request).await
    }

    async fn read_run(&self, run_id: &str) -> Result<Run, ApiError> {
        self.get(&format!("/runs/{}", run_id)).await
    }

    async fn list_runs(&self, workspace_id: &str) -> Result<Vec<Run>, ApiError> {
        self.get(&format!("/workspaces/{}/runs", workspace_id)).await
    }

    async fn apply_run(&self, run_id: &str, comment: Option<&str>) -> Result<(), ApiError> {
        self.post_empty(
            &format!("/runs/{}/actions/apply", run_id),
            &ActionBody { comment },
        )
        .await
    }

    async fn discard_run(&self, run_id: &str, comment: Option<&str>) -> Result<(), ApiError> {
        self.post_empty(
            &format!("/runs/{}/actions/discard", run_id),
            &ActionBody { comment },
        )
        .await
    }

    async fn cancel_run(&self, run_id: &str, comment: Option<&str>) -> Result<(), ApiError> {
        self.post_empty(
            &format!("/runs/{}/actions/cancel", run_id),
            &ActionBody { comment },
        )
        .await
    }

    async fn read_logs(
        &self,
        run_id: &str,
        source: &LogSource,
        offset: usize,
    ) -> Result<LogChunk, ApiError> {
        let path = format!("{}?offset={}", Self::log_path(run_id, source), offset);
        let body: LogChunkBody = self.get(&path).await?;
        Ok(LogChunk {
            data: body.data,
            complete: body.complete,
        })
    }

    async fn read_cost_estimate(&self, id: &str) -> Result<CostEstimate, ApiError> {
        self.get(&format!("/cost-estimates/{}", id)).await
    }

    async fn read_policy_check(&self, id: &str) -> Result<PolicyCheck, ApiError> {
        self.get(&format!("/policy-checks/{}", id)).await
    }

    async fn override_policy_check(&self, id: &str) -> Result<PolicyCheck, ApiError> {
        self.post(
            &format!("/policy-checks/{}/actions/override", id),
            &ActionBody { comment: None },
        )
        .await
    }

    async fn lock_workspace(&self, workspace_id: &str, reason: &str) -> Result<(), ApiError> {
        self.post_empty(
            &format!("/workspaces/{}/actions/lock", workspace_id),
            &LockBody { reason },
        )
        .await
    }

    async fn unlock_workspace(&self, workspace_id: &str) -> Result<(), ApiError> {
        self.post_empty(
            &format!("/workspaces/{}/actions/unlock", workspace_id),
            &ActionBody { comment: None },
        )
        .await
    }

    async fn read_current_state(
        &self,
        workspace_id: &str,
    ) -> Result<Option<StateSnapshot>, ApiError> {
        match self
            .get(&format!("/workspaces/{}/current-state-version", workspace_id))
            .await
        {
            Ok(state) => Ok(Some(state)),
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
