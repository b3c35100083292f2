use crate::{Result, Topology};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Delivery mode 2: survives a broker restart
    pub persistent: bool,
    /// Per-message TTL
    pub expiration: Option<Duration>,
}

impl PublishOptions {
    pub fn persistent() -> Self {
        PublishOptions {
            persistent: true,
            expiration: None,
        }
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Reject without requeue; the queue's dead-letter exchange applies.
    async fn reject(&self) -> Result<()>;

    /// Return the message to the head of its queue.
    async fn requeue(&self) -> Result<()>;
}

/// A message handed to a consumer, unacknowledged until settled.
pub struct Delivery {
    pub body: Vec<u8>,
    /// Set when a previous consumer received the message and never settled it.
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: impl Acker + 'static) -> Self {
        Delivery {
            body,
            redelivered,
            acker: Box::new(acker),
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(self) -> Result<()> {
        self.acker.reject().await
    }

    pub async fn requeue(self) -> Result<()> {
        self.acker.requeue().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// One live broker connection.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Idempotently declare exchanges, queues and bindings.
    async fn declare(&self, topology: &Topology) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: &PublishOptions,
    ) -> Result<()>;

    /// Start a consumer with at most `prefetch` unacknowledged deliveries.
    /// The stream ends when the connection is lost.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream>;

    /// Fetch a single message without registering a consumer.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Resolves once the connection (or its channel) is gone.
    async fn wait_closed(&self);

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerTransport>>;
}
