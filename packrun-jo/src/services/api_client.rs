//! Backend pipeline API client
//!
//! The orchestrator talks to the backend only through `PipelineApi`, so
//! tests can swap in a scripted fake. `HttpPipelineClient` is the real
//! implementation on reqwest.
//!
//! Endpoints:
//! - `GET  /sources/{id}/status`, `GET /jobs/{job_id}/status`
//! - `GET  /sources/{id}/credit-check`
//! - `POST /sources/{id}/start-analysis` `{ max_chunks? }`
//! - `POST /sources/{id}/cancel`, `POST /cancel/{job_id}`
//! - `GET  /` (health probe)

use crate::config::ApiSettings;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{CreditCheckResponse, StatusReport};
use async_trait::async_trait;
use packrun_common::{JobId, SourceId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = concat!("packrun-jo/", env!("CARGO_PKG_VERSION"));

/// What a status poll is issued against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PollTarget {
    Source(SourceId),
    /// Used when resuming from a persisted job id
    Job(JobId),
}

impl PollTarget {
    pub fn status_path(&self) -> String {
        match self {
            PollTarget::Source(id) => format!("/sources/{}/status", id),
            PollTarget::Job(id) => format!("/jobs/{}/status", id),
        }
    }
}

impl fmt::Display for PollTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollTarget::Source(id) => write!(f, "source {}", id),
            PollTarget::Job(id) => write!(f, "job {}", id),
        }
    }
}

/// Body of `POST /sources/{id}/start-analysis`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAnalysisRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_chunks: Option<u64>,
}

/// 202 response of start-analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAnalysisAccepted {
    pub job_id: JobId,
}

/// Cancel acknowledgement; the backend may report progress at cancel time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAck {
    #[serde(default)]
    pub processed_chunks: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// Backend operations used by the orchestrator
#[async_trait]
pub trait PipelineApi: Send + Sync {
    /// Idempotent status query
    async fn fetch_status(&self, target: &PollTarget) -> OrchestratorResult<StatusReport>;

    /// Lightweight request to the service root to wake a cold backend
    async fn probe_health(&self) -> OrchestratorResult<()>;

    async fn fetch_credit_check(&self, source_id: &SourceId)
        -> OrchestratorResult<CreditCheckResponse>;

    async fn start_analysis(
        &self,
        source_id: &SourceId,
        max_chunks: Option<u64>,
    ) -> OrchestratorResult<StartAnalysisAccepted>;

    /// Job-scoped when `job_id` is known
    async fn cancel(
        &self,
        source_id: &SourceId,
        job_id: Option<&JobId>,
    ) -> OrchestratorResult<CancelAck>;
}

/// Supplies credentials for each request
///
/// Token refresh lives outside this crate; an expired token surfaces as
/// `OrchestratorError::Auth` and the caller restarts polling after refreshing.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> OrchestratorResult<Option<String>>;
}

/// Fixed token (or none)
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token)
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn bearer_token(&self) -> OrchestratorResult<Option<String>> {
        Ok(self.0.clone())
    }
}

/// reqwest-backed `PipelineApi`
#[derive(Clone)]
pub struct HttpPipelineClient {
    http: reqwest::Client,
    settings: ApiSettings,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpPipelineClient {
    pub fn new(settings: ApiSettings) -> OrchestratorResult<Self> {
        let credentials = Arc::new(StaticToken::new(settings.token.clone()));
        Self::with_credentials(settings, credentials)
    }

    pub fn with_credentials(
        settings: ApiSettings,
        credentials: Arc<dyn CredentialProvider>,
    ) -> OrchestratorResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            settings,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url, path)
    }

    async fn authorized(
        &self,
        request: reqwest::RequestBuilder,
    ) -> OrchestratorResult<reqwest::RequestBuilder> {
        Ok(match self.credentials.bearer_token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> OrchestratorResult<reqwest::Response> {
        let request = self.authorized(request.timeout(timeout)).await?;
        let response = request.send().await.map_err(transport_error)?;
        check_status(response).await
    }
}

#[async_trait]
impl PipelineApi for HttpPipelineClient {
    async fn fetch_status(&self, target: &PollTarget) -> OrchestratorResult<StatusReport> {
        let url = self.url(&target.status_path());
        tracing::debug!(poll_target = %target, url = %url, "Fetching status");

        let response = self
            .send(self.http.get(&url), self.settings.request_timeout)
            .await?;
        decode_json(response).await
    }

    async fn probe_health(&self) -> OrchestratorResult<()> {
        let url = self.url("/");
        tracing::debug!(url = %url, "Probing backend health");

        self.send(self.http.get(&url), self.settings.request_timeout)
            .await
            .map(|_| ())
    }

    async fn fetch_credit_check(
        &self,
        source_id: &SourceId,
    ) -> OrchestratorResult<CreditCheckResponse> {
        let url = self.url(&format!("/sources/{}/credit-check", source_id));
        let response = self
            .send(self.http.get(&url), self.settings.request_timeout)
            .await?;
        decode_json(response).await
    }

    async fn start_analysis(
        &self,
        source_id: &SourceId,
        max_chunks: Option<u64>,
    ) -> OrchestratorResult<StartAnalysisAccepted> {
        let url = self.url(&format!("/sources/{}/start-analysis", source_id));
        tracing::info!(source_id = %source_id, ?max_chunks, "Submitting start-analysis");

        let request = self
            .http
            .post(&url)
            .json(&StartAnalysisRequest { max_chunks });
        let response = self.send(request, self.settings.submission_timeout).await?;
        decode_json(response).await
    }

    async fn cancel(
        &self,
        source_id: &SourceId,
        job_id: Option<&JobId>,
    ) -> OrchestratorResult<CancelAck> {
        let path = match job_id {
            Some(job_id) => format!("/cancel/{}", job_id),
            None => format!("/sources/{}/cancel", source_id),
        };
        let url = self.url(&path);
        tracing::info!(source_id = %source_id, url = %url, "Sending cancel");

        let response = self
            .send(self.http.post(&url), self.settings.request_timeout)
            .await?;
        let body = response.text().await.map_err(transport_error)?;
        if body.trim().is_empty() {
            return Ok(CancelAck::default());
        }
        match serde_json::from_str(&body) {
            Ok(ack) => Ok(ack),
            Err(e) => {
                tracing::debug!(error = %e, "Cancel acknowledged with non-JSON body");
                Ok(CancelAck::default())
            }
        }
    }
}

fn transport_error(err: reqwest::Error) -> OrchestratorError {
    if err.is_timeout() {
        OrchestratorError::Transport(format!("request timed out: {}", err))
    } else {
        OrchestratorError::Transport(err.to_string())
    }
}

/// Map non-2xx responses onto the error taxonomy
async fn check_status(response: reqwest::Response) -> OrchestratorResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = error_detail(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    });

    Err(match status.as_u16() {
        401 | 403 => OrchestratorError::Auth(detail),
        402 => OrchestratorError::InsufficientCredits { detail },
        code => OrchestratorError::Server {
            status: code,
            message: detail,
        },
    })
}

/// `{ "detail": ... }` or a plain text body
fn error_detail(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<ErrorBody>(trimmed) {
        Ok(ErrorBody {
            detail: serde_json::Value::String(text),
        }) => Some(text),
        Ok(ErrorBody { detail }) => Some(detail.to_string()),
        Err(_) => Some(trimmed.chars().take(300).collect()),
    }
}

async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> OrchestratorResult<T> {
    let body = response.text().await.map_err(transport_error)?;
    serde_json::from_str(&body).map_err(|e| OrchestratorError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_paths() {
        assert_eq!(
            PollTarget::Source(SourceId::new("s1")).status_path(),
            "/sources/s1/status"
        );
        assert_eq!(PollTarget::Job(JobId::new("j1")).status_path(), "/jobs/j1/status");
    }

    #[test]
    fn test_error_detail_variants() {
        assert_eq!(error_detail(r#"{"detail":"need 30 more credits"}"#).as_deref(), Some("need 30 more credits"));
        assert_eq!(error_detail("Bad Gateway").as_deref(), Some("Bad Gateway"));
        assert_eq!(error_detail("  "), None);
        assert!(error_detail(r#"{"detail":{"code":"x"}}"#).unwrap().contains("code"));
    }

    #[test]
    fn test_start_request_omits_absent_max_chunks() {
        let json = serde_json::to_string(&StartAnalysisRequest { max_chunks: None }).unwrap();
        assert_eq!(json, "{}");
        let json = serde_json::to_string(&StartAnalysisRequest { max_chunks: Some(20) }).unwrap();
        assert_eq!(json, r#"{"max_chunks":20}"#);
    }
}
