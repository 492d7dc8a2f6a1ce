//! Transport to the remote authority

use std::fmt;
use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use crate::util::{compact_text, is_http_url, normalize_text_option};

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Network failure, timeout, or 5xx
    #[error("Remote unavailable: {0}")]
    Unavailable(String),
    /// 429 from the relay's ingress guard
    #[error("Rate limited by remote (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },
    /// Other 4xx; the request itself was refused
    #[error("Remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The response did not match the protocol
    #[error("Remote protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether retrying later could succeed without changing the request
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RateLimited { .. })
    }
}

/// The remote authority as seen by a device
pub trait Remote: Send + Sync + 'static {
    fn push(
        &self,
        request: PushRequest,
    ) -> impl Future<Output = Result<PushResponse, TransportError>> + Send;

    fn pull(
        &self,
        request: PullRequest,
    ) -> impl Future<Output = Result<PullResponse, TransportError>> + Send;
}

/// JSON-over-HTTP client for `ebb-relay`
#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    api_token: String,
    client: reqwest::Client,
}

impl fmt::Debug for HttpRemote {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field("api_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Result<Self, TransportError> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .filter(|url| is_http_url(url))
            .ok_or_else(|| {
                TransportError::Protocol("relay URL must include http:// or https://".to_string())
            })?;
        let api_token = normalize_text_option(Some(api_token.into()))
            .ok_or_else(|| TransportError::Protocol("API token must not be empty".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|error| TransportError::Protocol(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            client,
        })
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, TransportError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|error| TransportError::Unavailable(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, retry_after_secs, &body));
        }

        response
            .json::<R>()
            .await
            .map_err(|error| TransportError::Protocol(format!("invalid response body: {error}")))
    }
}

impl Remote for HttpRemote {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, TransportError> {
        self.post("/v1/sync/push", &request).await
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        self.post("/v1/sync/pull", &request).await
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn classify_failure(status: StatusCode, retry_after_secs: Option<u64>, body: &str) -> TransportError {
    let message = parse_api_error(body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        return TransportError::RateLimited {
            retry_after_secs: retry_after_secs.unwrap_or(1),
        };
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return TransportError::Unavailable(format!("HTTP {}: {message}", status.as_u16()));
    }
    TransportError::Rejected {
        status: status.as_u16(),
        message,
    }
}

fn parse_api_error(body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return compact_text(&message);
        }
    }
    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        "no response body".to_string()
    } else {
        trimmed
    }
}
