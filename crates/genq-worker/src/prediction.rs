//! External prediction provider: submit a job, poll it, read the output.

use crate::PredictionConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionMetrics {
    #[serde(default)]
    pub predict_time: Option<f64>,
}

/// Provider job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub metrics: Option<PredictionMetrics>,
}

impl Prediction {
    /// Result URLs; `None` unless the output is a non-empty list of strings.
    pub fn output_urls(&self) -> Option<Vec<String>> {
        let items = self.output.as_ref()?.as_array()?;
        let urls: Option<Vec<String>> = items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect();
        urls.filter(|u| !u.is_empty())
    }

    pub fn predict_time(&self) -> Option<f64> {
        self.metrics.as_ref().and_then(|m| m.predict_time)
    }

    fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => "Unknown error".to_string(),
            Some(other) => other.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned {status}: {body}")]
    Api { status: u16, body: String },

    /// The job itself ended unsuccessfully
    #[error("Prediction {status:?}: {message}")]
    JobFailed {
        status: PredictionStatus,
        message: String,
    },

    #[error("Prediction timed out after {attempts} polls")]
    TimedOut { attempts: u32 },

    #[error("Prediction status unavailable after {errors} consecutive errors: {last}")]
    Unavailable { errors: u32, last: String },
}

pub type Result<T> = std::result::Result<T, PredictionError>;

/// Asynchronous job capability; alternate providers plug in here.
#[async_trait]
pub trait PredictionProvider: Send + Sync {
    async fn create_prediction(&self, input: Value) -> Result<Prediction>;

    async fn get_prediction(&self, id: &str) -> Result<Prediction>;

    async fn cancel_prediction(&self, id: &str) -> Result<()>;
}

/// Replicate-style HTTP API client.
pub struct ReplicateClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
    model_version: String,
}

impl ReplicateClient {
    pub fn new(config: &PredictionConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(ReplicateClient {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            model_version: config.model_version.clone(),
        })
    }

    async fn parse(response: reqwest::Response) -> Result<Prediction> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PredictionError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PredictionProvider for ReplicateClient {
    async fn create_prediction(&self, input: Value) -> Result<Prediction> {
        let response = self
            .http
            .post(format!("{}/predictions", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&json!({ "version": self.model_version, "input": input }))
            .send()
            .await?;
        let prediction = Self::parse(response).await?;
        debug!(prediction_id = %prediction.id, "Prediction created");
        Ok(prediction)
    }

    async fn get_prediction(&self, id: &str) -> Result<Prediction> {
        let response = self
            .http
            .get(format!("{}/predictions/{}", self.base_url, id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn cancel_prediction(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/predictions/{}/cancel", self.base_url, id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        Self::parse(response).await.map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval_ms: u64,
    /// Ceiling for the doubled interval after fetch errors
    pub max_interval_ms: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            max_attempts: 60,
            interval_ms: 2_000,
            max_interval_ms: 30_000,
        }
    }
}

impl PollPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Consecutive fetch errors tolerated before giving up.
    pub fn error_budget(&self) -> u32 {
        (self.max_attempts / 2).max(1)
    }
}

/// Poll `id` until it finishes.
///
/// Fetch errors double the interval and still count against
/// `max_attempts`; only a run of `error_budget()` consecutive errors is
/// fatal. A job that outlives the budget is cancelled on a best-effort basis.
pub async fn wait_for_prediction(
    provider: &dyn PredictionProvider,
    id: &str,
    policy: &PollPolicy,
) -> Result<Prediction> {
    let base = policy.interval();
    let ceiling = Duration::from_millis(policy.max_interval_ms).max(base);
    let mut interval = base;
    let mut errors = 0u32;

    for attempt in 1..=policy.max_attempts {
        match provider.get_prediction(id).await {
            Ok(prediction) => {
                errors = 0;
                interval = base;
                match prediction.status {
                    PredictionStatus::Succeeded => return Ok(prediction),
                    PredictionStatus::Failed | PredictionStatus::Canceled => {
                        return Err(PredictionError::JobFailed {
                            status: prediction.status,
                            message: prediction.error_message(),
                        });
                    }
                    _ => debug!(prediction_id = id, attempt, status = ?prediction.status, "Prediction pending"),
                }
            }
            Err(e) => {
                errors += 1;
                warn!(prediction_id = id, attempt, error = %e, "Prediction status fetch failed");
                if errors >= policy.error_budget() {
                    return Err(PredictionError::Unavailable {
                        errors,
                        last: e.to_string(),
                    });
                }
                interval = (interval * 2).min(ceiling);
            }
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(interval).await;
        }
    }

    if let Err(e) = provider.cancel_prediction(id).await {
        warn!(prediction_id = id, error = %e, "Failed to cancel timed-out prediction");
    }
    Err(PredictionError::TimedOut {
        attempts: policy.max_attempts,
    })
}
