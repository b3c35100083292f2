//! Wiring of one service process: ingress, notifier and consumer loop.

use crate::api::{self, AppState, RateLimits};
use crate::config::StoreBackend;
use crate::{Notifier, ServiceConfig, ServiceMetrics};
use axum::Router;
use genq_broker::{connector_for, BrokerClient, Connector};
use genq_persistence::{MemoryRepository, RocksRepository, TaskRepository, TaskStore};
use genq_worker::{
    BillingGate, GenerationProcessor, HttpLedger, Ledger, PredictionProvider, ReplicateClient,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// External capabilities a service process runs against.
pub struct Components {
    pub connector: Arc<dyn Connector>,
    pub ledger: Arc<dyn Ledger>,
    pub provider: Arc<dyn PredictionProvider>,
    pub repository: Arc<dyn TaskRepository>,
    /// Set when the repository is RocksDB, for retention cleanup
    pub rocks: Option<Arc<RocksRepository>>,
}

impl Components {
    /// Production capabilities; `slot` selects the RocksDB directory.
    pub fn from_config(config: &ServiceConfig, slot: usize) -> anyhow::Result<Self> {
        let (repository, rocks): (Arc<dyn TaskRepository>, _) = match config.store.backend {
            StoreBackend::Memory => {
                let repository: Arc<dyn TaskRepository> = Arc::new(MemoryRepository::new());
                (repository, None)
            }
            StoreBackend::Rocksdb => {
                let rocks = Arc::new(RocksRepository::open(config.store.rocks().for_slot(slot))?);
                let repository: Arc<dyn TaskRepository> = rocks.clone();
                (repository, Some(rocks))
            }
        };
        Ok(Components {
            connector: connector_for(&config.broker),
            ledger: Arc::new(HttpLedger::new(&config.billing)?),
            provider: Arc::new(ReplicateClient::new(&config.prediction)?),
            repository,
            rocks,
        })
    }
}

pub struct Service {
    pub state: Arc<AppState>,
    processor: Arc<GenerationProcessor>,
    rocks: Option<Arc<RocksRepository>>,
    config: ServiceConfig,
}

impl Service {
    pub fn new(config: ServiceConfig, components: Components) -> anyhow::Result<Self> {
        let store = Arc::new(TaskStore::new(components.repository));
        let notifier = Arc::new(Notifier::new(config.notifier.clone()));
        let metrics = Arc::new(ServiceMetrics::new()?);
        store.add_listener(notifier.clone());
        store.add_listener(metrics.clone());

        let broker = BrokerClient::new(
            config.broker.clone(),
            config.retry.clone(),
            components.connector,
        );
        let billing = Arc::new(BillingGate::new(components.ledger, &config.billing));
        let processor = Arc::new(GenerationProcessor::new(
            store.clone(),
            broker.retry_scheduler(),
            billing.clone(),
            components.provider,
            &config.worker(),
        ));

        let state = Arc::new(AppState {
            store,
            broker,
            billing,
            notifier,
            metrics,
            limits: RateLimits::new(
                config.server.api_requests_per_minute,
                config.server.event_connections_per_minute,
                config.server.trust_proxy,
            ),
            started_at: Instant::now(),
        });

        Ok(Service {
            state,
            processor,
            rocks: components.rocks,
            config,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn router(&self) -> Router {
        api::router(self.state.clone(), &self.config.server)
    }

    /// Attach the consumer loop to the generation queue. If the broker is
    /// down the consumer is attached once the reconnect loop succeeds.
    pub async fn start_consumer(&self) {
        let queue = self.config.broker.generation_queue.clone();
        match self.state.broker.consume(&queue, self.processor.clone()).await {
            Ok(()) => info!(queue = %queue, "Consumer loop started"),
            Err(e) => warn!(queue = %queue, error = %e, "Broker unavailable, consumer will attach on reconnect"),
        }
    }

    /// Notifier heartbeats, rate-limiter housekeeping and store retention.
    pub fn spawn_background(&self, shutdown: CancellationToken) {
        self.state.notifier.spawn_maintenance(shutdown.clone());

        let state = self.state.clone();
        let rocks = self.rocks.clone();
        let cleanup_every = Duration::from_secs(self.config.store.cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        state.limits.shrink();
                        if let Some(rocks) = &rocks {
                            let rocks = rocks.clone();
                            match tokio::task::spawn_blocking(move || rocks.cleanup_finished()).await {
                                Ok(Ok(n)) if n > 0 => info!(removed = n, "Finished tasks cleaned up"),
                                Ok(Ok(_)) => {}
                                Ok(Err(e)) => warn!(error = %e, "Task cleanup failed"),
                                Err(e) => warn!(error = %e, "Task cleanup panicked"),
                            }
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.state.broker.disconnect().await {
            warn!(error = %e, "Broker disconnect failed");
        }
    }
}
