use config::{Config, Environment, File};
use genq_broker::BrokerConfig;
use genq_core::{GenerationDefaults, RetryPolicy};
use genq_persistence::RocksConfig;
use genq_worker::{BillingConfig, PredictionConfig, SupervisorConfig, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything one `gq-server` process needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub retry: RetryPolicy,
    pub prediction: PredictionConfig,
    pub billing: BillingConfig,
    pub generation: GenerationDefaults,
    pub notifier: NotifierConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub supervisor: SupervisorConfig,
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Take the client address from `X-Forwarded-For`
    pub trust_proxy: bool,
    pub body_limit_bytes: usize,
    pub api_requests_per_minute: u32,
    pub event_connections_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 3000,
            trust_proxy: false,
            body_limit_bytes: 1024 * 1024,
            api_requests_per_minute: 60,
            event_connections_per_minute: 20,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub heartbeat_interval_ms: u64,
    /// Clients without a successful delivery for this long are evicted
    pub client_timeout_ms: u64,
    pub client_buffer: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        NotifierConfig {
            heartbeat_interval_ms: 30_000,
            client_timeout_ms: 120_000,
            client_buffer: 64,
        }
    }
}

impl NotifierConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub data_dir: PathBuf,
    pub finished_retention_days: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: StoreBackend::Memory,
            data_dir: PathBuf::from("./data"),
            finished_retention_days: 7,
            cleanup_interval_secs: 3_600,
        }
    }
}

impl StoreConfig {
    pub fn rocks(&self) -> RocksConfig {
        RocksConfig {
            data_dir: self.data_dir.clone(),
            finished_retention_days: self.finished_retention_days,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Also write daily-rotated log files here
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Interrupted deliveries requeued before one counts as a failed attempt
    pub max_interruptions: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            max_interruptions: 3,
        }
    }
}

impl ServiceConfig {
    /// Defaults, then the YAML file (if any), then `GENQ_*` variables
    /// (`GENQ_BROKER__URL`, `GENQ_SERVER__PORT`, ...).
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&ServiceConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config = builder
            .add_source(
                Environment::with_prefix("GENQ")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            prediction: self.prediction.clone(),
            billing: self.billing.clone(),
            generation: self.generation.clone(),
            max_interruptions: self.consumer.max_interruptions,
        }
    }
}
