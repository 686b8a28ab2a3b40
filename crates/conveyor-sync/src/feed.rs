//! Transport to the production service.
//!
//! [`StatusFeed`] is the seam between the status channel and the network: a
//! live stream of snapshots or patches for one project plus the two operator
//! calls. [`HttpFeed`] implements it by polling the service's REST API.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_types::{Answers, ArtifactPatch, ConveyorError, PipelineSnapshot, Result};
use futures_core::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// One update from the production service.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Full replacement of the pipeline.
    Snapshot(PipelineSnapshot),
    /// Incremental change to the last snapshot.
    Patch(ArtifactPatch),
}

/// Live updates for one project. The stream ending, or yielding an error,
/// means the connection is lost.
pub type FeedStream = Pin<Box<dyn Stream<Item = Result<FeedMessage>> + Send>>;

#[async_trait]
pub trait StatusFeed: Send + Sync {
    /// Open a live update stream for `project_id`.
    async fn connect(&self, project_id: &str) -> Result<FeedStream>;

    /// Submit operator answers for an interrupt.
    ///
    /// Returns [`ConveyorError::StaleInterrupt`] when the service reports the
    /// interrupt as already closed.
    async fn resolve_interrupt(&self, interrupt_id: &str, answers: &Answers) -> Result<()>;

    /// Ask the service to begin producing an artifact.
    async fn start_production(&self, project_id: &str, artifact_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// FeedConfig
// ---------------------------------------------------------------------------

const DEFAULT_BASE_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub base_url: String,
    /// Sent as a bearer token when present.
    pub api_token: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: None,
            poll_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl FeedConfig {
    /// Defaults overridden by `CONVEYOR_BASE_URL` and `CONVEYOR_API_TOKEN`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("CONVEYOR_BASE_URL") {
            if !url.trim().is_empty() {
                config.base_url = url;
            }
        }
        config.api_token = std::env::var("CONVEYOR_API_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());
        config
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

// ---------------------------------------------------------------------------
// HttpFeed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpFeed {
    client: reqwest::Client,
    config: FeedConfig,
}

impl HttpFeed {
    pub fn new(config: FeedConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConveyorError::Other(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(FeedConfig::from_env())
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// `base_url` with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let base = &self.config.base_url;
        let mut url = reqwest::Url::parse(base)
            .map_err(|e| ConveyorError::Other(format!("Invalid base URL '{base}': {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ConveyorError::Other(format!("Base URL '{base}' cannot carry a path")))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: reqwest::Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn transport_error(&self, url: &reqwest::Url, err: reqwest::Error) -> ConveyorError {
        if err.is_timeout() {
            ConveyorError::Timeout {
                url: url.to_string(),
                timeout_ms: self.config.request_timeout.as_millis() as u64,
            }
        } else {
            ConveyorError::Connection {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }

    /// Fetch the current pipeline of `project_id`.
    pub async fn fetch_snapshot(&self, project_id: &str) -> Result<PipelineSnapshot> {
        let url = self.endpoint(&["api", "projects", project_id, "pipeline"])?;
        let resp = self
            .request(reqwest::Method::GET, url.clone())
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| self.transport_error(&url, e))?;
        if !status.is_success() {
            return Err(map_status(status, &body));
        }

        let snapshot: PipelineSnapshot = serde_json::from_str(&body)?;
        Ok(snapshot)
    }

    /// POST `body` to `url`. Success and 404/409 return the status; every other
    /// failure becomes a submission error.
    async fn submit(
        &self,
        operation: &str,
        url: reqwest::Url,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::StatusCode> {
        let mut req = self.request(reqwest::Method::POST, url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| ConveyorError::Submission {
            operation: operation.to_string(),
            message: e.to_string(),
        })?;

        let status = resp.status();
        if status.is_success() || is_stale_status(status) {
            return Ok(status);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ConveyorError::Submission {
            operation: operation.to_string(),
            message: format!("HTTP {}: {}", status.as_u16(), extract_message(status, &body)),
        })
    }
}

#[async_trait]
impl StatusFeed for HttpFeed {
    async fn connect(&self, project_id: &str) -> Result<FeedStream> {
        let first = self.fetch_snapshot(project_id).await?;
        tracing::debug!(project = %project_id, artifacts = first.documents.len(), "Fetched initial pipeline");

        let (tx, rx) = mpsc::channel(4);
        let _ = tx.send(Ok(FeedMessage::Snapshot(first))).await;

        let feed = self.clone();
        let project = project_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(feed.config.poll_interval) => {}
                }
                match feed.fetch_snapshot(&project).await {
                    Ok(snapshot) => {
                        if tx.send(Ok(FeedMessage::Snapshot(snapshot))).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            tracing::debug!(project = %project, "Pipeline poller stopped");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn resolve_interrupt(&self, interrupt_id: &str, answers: &Answers) -> Result<()> {
        let url = self.endpoint(&["api", "interrupts", interrupt_id, "resolve"])?;
        let status = self
            .submit("resolve_interrupt", url, Some(json!({ "answers": answers })))
            .await?;
        if is_stale_status(status) {
            return Err(ConveyorError::StaleInterrupt {
                interrupt_id: interrupt_id.to_string(),
            });
        }
        Ok(())
    }

    async fn start_production(&self, project_id: &str, artifact_id: &str) -> Result<()> {
        let url =
            self.endpoint(&["api", "projects", project_id, "artifacts", artifact_id, "start"])?;
        let status = self.submit("start_production", url, None).await?;
        if is_stale_status(status) {
            return Err(ConveyorError::Submission {
                operation: "start_production".into(),
                message: format!(
                    "HTTP {}: artifact '{artifact_id}' cannot be started",
                    status.as_u16()
                ),
            });
        }
        Ok(())
    }
}

/// 404 and 409 on a submission mean the target already moved on.
fn is_stale_status(status: reqwest::StatusCode) -> bool {
    matches!(
        status,
        reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::CONFLICT
    )
}

fn map_status(status: reqwest::StatusCode, body: &str) -> ConveyorError {
    ConveyorError::Http {
        status: status.as_u16(),
        message: extract_message(status, body),
        retryable: status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT,
    }
}

fn extract_message(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let message = value["message"]
            .as_str()
            .or_else(|| value["error"]["message"].as_str())
            .or_else(|| value["error"].as_str())
            .or_else(|| value["detail"].as_str());
        if let Some(message) = message {
            return message.to_string();
        }
    }
    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    } else {
        body.to_string()
    }
}
