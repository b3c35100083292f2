use crate::PollPolicy;
use genq_core::GenerationDefaults;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the consumer loop inside one worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub prediction: PredictionConfig,
    pub billing: BillingConfig,
    pub generation: GenerationDefaults,
    /// Interrupted deliveries (the consumer went away before settling) that
    /// are requeued for free; one more counts as a failed attempt
    pub max_interruptions: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            prediction: PredictionConfig::default(),
            billing: BillingConfig::default(),
            generation: GenerationDefaults::default(),
            max_interruptions: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub base_url: String,
    pub api_token: String,
    pub model_version: String,
    pub request_timeout_ms: u64,
    pub poll: PollPolicy,
}

impl PredictionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        PredictionConfig {
            base_url: "https://api.replicate.com/v1".to_string(),
            api_token: String::new(),
            model_version: String::new(),
            request_timeout_ms: 30_000,
            poll: PollPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub base_url: String,
    pub admin_token: String,
    /// Balance required before work is accepted
    pub min_credits: f64,
    /// Also the minimum charge per job
    pub cost_per_second: f64,
    pub request_timeout_ms: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        BillingConfig {
            base_url: "http://localhost:3001/api/license".to_string(),
            admin_token: String::new(),
            min_credits: 1.0,
            cost_per_second: 0.01,
            request_timeout_ms: 5_000,
        }
    }
}

impl BillingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// 0 means one per available CPU
    pub workers: usize,
    pub restart_delay_ms: u64,
    /// How long children get to exit on their own at shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            workers: 0,
            restart_delay_ms: 1_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl SupervisorConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
