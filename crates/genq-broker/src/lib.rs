mod amqp;
mod client;
mod config;
mod error;
mod memory;
mod retry;
mod topology;
mod transport;

pub use amqp::{AmqpConnector, AmqpTransport};
pub use client::{BrokerClient, Incoming, MessageHandler};
pub use config::{mask_url, BrokerConfig, ReconnectPolicy};
pub use error::{BrokerError, Result};
pub use memory::{MemoryBroker, MemoryConnector};
pub use retry::{RetryOutcome, RetryScheduler, MAX_RETRIES_EXCEEDED};
pub use topology::{Binding, ExchangeSpec, QueueSpec, Topology};
pub use transport::{Acker, BrokerTransport, Connector, Delivery, DeliveryStream, PublishOptions};

use std::sync::Arc;

/// Name of the AMQP default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Pick a connector for `config.url`. `memory://` selects the in-process broker.
pub fn connector_for(config: &BrokerConfig) -> Arc<dyn Connector> {
    if config.url.starts_with("memory://") {
        Arc::new(MemoryBroker::new().connector())
    } else {
        Arc::new(AmqpConnector::new(config.url.clone()))
    }
}
