use crate::sse::{SseCodec, StreamEvent};
use crate::{ClientError, Result};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use genq_core::{GenerationParams, ParamOverrides, SafeTask};
use reqwest::header::ACCEPT;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub owner_identity: String,
    #[serde(flatten)]
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    pub task_id: String,
    pub owner_identity: String,
    #[serde(flatten)]
    pub overrides: ParamOverrides,
}

/// Acknowledgement for an accepted submission or retry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submitted {
    pub task_id: String,
    pub status: String,
    #[serde(default)]
    pub retry_count: Option<u32>,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Envelope<T> {
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the generation queue ingress.
#[derive(Clone)]
pub struct GenQueueClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GenQueueClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        // No client-wide timeout: event streams are long-lived.
        let http = reqwest::Client::builder().build()?;
        Ok(GenQueueClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<Submitted> {
        let response = self
            .http
            .post(self.url("/api/generate"))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;
        read_envelope(response).await
    }

    pub async fn retry(&self, request: &RetryRequest) -> Result<Submitted> {
        let response = self
            .http
            .post(self.url("/api/generate/retry"))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;
        read_envelope(response).await
    }

    pub async fn status(&self, task_id: &str) -> Result<SafeTask> {
        let response = self
            .http
            .get(self.url(&format!("/api/generate/task/{}", task_id)))
            .timeout(self.timeout)
            .send()
            .await?;
        read_envelope(response).await
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(self.url("/health"))
            .timeout(self.timeout)
            .send()
            .await?;
        read_envelope(response).await
    }

    /// Opens the event stream, scoped to one task when `task_id` is given.
    pub async fn events(
        &self,
        task_id: Option<&str>,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let mut request = self
            .http
            .get(self.url("/events"))
            .header(ACCEPT, "text/event-stream");
        if let Some(id) = task_id {
            request = request.query(&[("taskId", id)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }

        let body = response.bytes_stream().map_err(std::io::Error::other);
        let frames = FramedRead::new(StreamReader::new(body), SseCodec::default());
        Ok(frames
            .map(|frame| frame.and_then(StreamEvent::try_from))
            .boxed())
    }

    /// Poll the task until it reaches a terminal status or `timeout` elapses.
    pub async fn wait_for_terminal(
        &self,
        task_id: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<SafeTask> {
        let deadline = Instant::now() + timeout;
        loop {
            let task = self.status(task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            debug!(task_id, status = %task.status, "Waiting for task");
            if Instant::now() + poll_interval > deadline {
                return Err(ClientError::Timeout(task_id.to_string()));
            }
            sleep(poll_interval).await;
        }
    }
}

async fn read_envelope<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(error_from(response).await);
    }
    let envelope: Envelope<T> = response.json().await?;
    envelope.data.ok_or_else(|| {
        ClientError::InvalidResponse(
            envelope
                .error
                .unwrap_or_else(|| "response carried no data".to_string()),
        )
    })
}

async fn error_from(response: Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
        .ok()
        .and_then(|e| e.error)
        .unwrap_or(body);

    if status == StatusCode::NOT_FOUND {
        ClientError::NotFound(message)
    } else {
        ClientError::Api {
            status: status.as_u16(),
            message,
        }
    }
}
