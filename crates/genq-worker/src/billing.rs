//! Credit checks before work starts and cost deduction after it finishes.

use crate::BillingConfig;
use async_trait::async_trait;
use genq_core::{Billing, BillingStatus};
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Ledger returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid ledger response: {0}")]
    InvalidResponse(String),

    #[error("Invalid ledger URL: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// External credit ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn balance(&self, owner: &str) -> Result<f64>;

    async fn deduct(&self, owner: &str, amount: f64) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    credits: Option<f64>,
}

/// Ledger reached over HTTP.
pub struct HttpLedger {
    http: reqwest::Client,
    base_url: Url,
    admin_token: String,
}

impl HttpLedger {
    pub fn new(config: &BillingConfig) -> Result<Self> {
        let base = format!("{}/", config.base_url.trim_end_matches('/'));
        let base_url = Url::parse(&base).map_err(|e| LedgerError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(LedgerError::InvalidUrl(config.base_url.clone()));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(HttpLedger {
            http,
            base_url,
            admin_token: config.admin_token.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| LedgerError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LedgerError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn balance(&self, owner: &str) -> Result<f64> {
        let url = self.endpoint(&["balance", owner])?;
        let response = Self::check(self.http.get(url).send().await?).await?;
        let body: BalanceResponse = response.json().await?;
        body.credits
            .ok_or_else(|| LedgerError::InvalidResponse("missing credits".to_string()))
    }

    async fn deduct(&self, owner: &str, amount: f64) -> Result<()> {
        let url = self.endpoint(&["deduct"])?;
        let request = self
            .http
            .post(url)
            .header("X-Admin-Token", &self.admin_token)
            .json(&json!({ "email": owner, "amount": amount }));
        Self::check(request.send().await?).await?;
        Ok(())
    }
}

/// Policy around the ledger: a failing balance check lets work through,
/// a failing deduction never takes a delivered result back.
pub struct BillingGate {
    ledger: Arc<dyn Ledger>,
    min_credits: f64,
    cost_per_second: f64,
}

impl BillingGate {
    pub fn new(ledger: Arc<dyn Ledger>, config: &BillingConfig) -> Self {
        BillingGate {
            ledger,
            min_credits: config.min_credits,
            cost_per_second: config.cost_per_second,
        }
    }

    pub async fn has_sufficient_balance(&self, owner: &str) -> bool {
        match self.ledger.balance(owner).await {
            Ok(credits) => {
                debug!(owner, credits, required = self.min_credits, "Balance checked");
                credits >= self.min_credits
            }
            Err(e) => {
                warn!(owner, error = %e, "Balance check failed, allowing request");
                true
            }
        }
    }

    pub async fn deduct_credits(&self, owner: &str, amount: f64) -> bool {
        match self.ledger.deduct(owner, amount).await {
            Ok(()) => {
                info!(owner, amount, "Credits deducted");
                true
            }
            Err(e) => {
                warn!(owner, amount, error = %e, "Credit deduction failed");
                false
            }
        }
    }

    /// Execution time times rate, never below the one-second minimum charge.
    pub fn calculate_cost(&self, predict_time: Option<f64>) -> f64 {
        let raw = match predict_time {
            Some(t) if t.is_finite() && t > 0.0 => (t * self.cost_per_second).max(self.cost_per_second),
            _ => self.cost_per_second,
        };
        (raw * 100.0).round() / 100.0
    }

    /// Charge the owner for a finished job and report how it went.
    pub async fn settle(&self, owner: &str, predict_time: Option<f64>) -> Billing {
        let cost = self.calculate_cost(predict_time);
        let status = if self.deduct_credits(owner, cost).await {
            BillingStatus::Succeeded
        } else {
            BillingStatus::Failed
        };
        Billing {
            cost,
            status,
            predict_time,
        }
    }
}
