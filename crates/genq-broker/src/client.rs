use crate::{
    BrokerConfig, BrokerError, BrokerTransport, Connector, Delivery, DeliveryStream,
    PublishOptions, Result, RetryOutcome, RetryScheduler, Topology, DEFAULT_EXCHANGE,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use genq_core::{QueueMessage, RetryPolicy};
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A parsed message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub message: QueueMessage,
    /// A previous consumer received this message and never settled it.
    pub redelivered: bool,
}

/// Consumer callback. `Ok` acknowledges the message; `Err` rejects it
/// without requeue so the queue's dead-letter exchange takes it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, incoming: Incoming) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct Registration {
    queue: String,
    tag: String,
    handler: Arc<dyn MessageHandler>,
}

struct Inner {
    config: BrokerConfig,
    topology: Topology,
    retry_policy: RetryPolicy,
    connector: Arc<dyn Connector>,
    transport: RwLock<Option<Arc<dyn BrokerTransport>>>,
    connect_lock: tokio::sync::Mutex<()>,
    consumers: Mutex<Vec<Registration>>,
    reconnecting: AtomicBool,
    next_tag: AtomicUsize,
    shutdown: CancellationToken,
    fatal: watch::Sender<Option<String>>,
}

/// Connection owner for one process: publishes, consumes and keeps the
/// connection alive, re-attaching consumers after every reconnect.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<Inner>,
}

impl BrokerClient {
    pub fn new(config: BrokerConfig, retry_policy: RetryPolicy, connector: Arc<dyn Connector>) -> Self {
        let (fatal, _) = watch::channel(None);
        BrokerClient {
            inner: Arc::new(Inner {
                topology: config.topology(),
                config,
                retry_policy,
                connector,
                transport: RwLock::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                consumers: Mutex::new(Vec::new()),
                reconnecting: AtomicBool::new(false),
                next_tag: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
                fatal,
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry_policy
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current().is_some()
    }

    /// Connect and declare the topology. On failure a background reconnect
    /// loop is started and the error is returned.
    pub async fn connect(&self) -> Result<()> {
        self.inner.ensure_connected().await.map(|_| ())
    }

    /// Publish a persistent message to `queue` through the default exchange.
    pub async fn publish(&self, queue: &str, message: &QueueMessage) -> Result<()> {
        self.publish_with(queue, message, PublishOptions::persistent()).await
    }

    pub async fn publish_with(
        &self,
        queue: &str,
        message: &QueueMessage,
        mut options: PublishOptions,
    ) -> Result<()> {
        options.persistent = true;
        let body = message.to_bytes()?;
        let transport = self.inner.ensure_connected().await?;
        transport
            .publish(DEFAULT_EXCHANGE, queue, &body, &options)
            .await?;
        debug!(queue, task_id = %message.task_id, "Published message");
        Ok(())
    }

    /// Register a consumer on `queue`. It is started now if possible and
    /// re-attached after every reconnect.
    pub async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let n = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            queue: queue.to_string(),
            tag: format!("genq-{}-{}", std::process::id(), n),
            handler,
        };
        self.inner.consumers.lock().push(registration.clone());

        match self.inner.current() {
            Some(transport) => self.inner.start_consumer(&transport, registration).await,
            None => self.connect().await,
        }
    }

    /// Fetch one message without consuming continuously.
    pub async fn fetch(&self, queue: &str) -> Result<Option<Delivery>> {
        let transport = self.inner.ensure_connected().await?;
        transport.get(queue).await
    }

    pub fn retry_scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(self.clone(), self.inner.retry_policy.clone())
    }

    /// Republish with backoff through the retry queue, or dead-letter when
    /// retries are exhausted.
    pub async fn schedule_retry(&self, message: &QueueMessage, retry_count: u32) -> Result<RetryOutcome> {
        self.retry_scheduler().schedule_retry(message, retry_count).await
    }

    /// Stop consuming and reconnecting, then close the connection.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let transport = self.inner.transport.write().take();
        if let Some(transport) = transport {
            transport.close().await?;
            info!("Disconnected from broker");
        }
        Ok(())
    }

    /// Carries `Some(reason)` once reconnect attempts are exhausted.
    pub fn fatal(&self) -> watch::Receiver<Option<String>> {
        self.inner.fatal.subscribe()
    }
}

impl Inner {
    fn current(&self) -> Option<Arc<dyn BrokerTransport>> {
        self.transport
            .read()
            .as_ref()
            .filter(|t| t.is_open())
            .cloned()
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<Arc<dyn BrokerTransport>> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }
        if let Some(transport) = self.current() {
            return Ok(transport);
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(transport) = self.current() {
            return Ok(transport);
        }
        match self.establish().await {
            Ok(transport) => Ok(transport),
            Err(e) => {
                warn!(url = %self.config.masked_url(), error = %e, "Broker connection failed");
                self.start_reconnect();
                Err(e)
            }
        }
    }

    /// Open a connection, declare the topology and re-attach consumers.
    /// Callers hold `connect_lock`.
    async fn establish(self: &Arc<Self>) -> Result<Arc<dyn BrokerTransport>> {
        let timeout = self.config.connect_timeout();
        let transport = tokio::time::timeout(timeout, self.connector.connect())
            .await
            .map_err(|_| BrokerError::Timeout(timeout))??;

        transport.declare(&self.topology).await?;

        let registrations = self.consumers.lock().clone();
        for registration in registrations {
            self.start_consumer(&transport, registration).await?;
        }

        *self.transport.write() = Some(transport.clone());
        info!(url = %self.config.masked_url(), "Connected to broker");
        self.spawn_watcher(transport.clone());
        Ok(transport)
    }

    async fn start_consumer(
        self: &Arc<Self>,
        transport: &Arc<dyn BrokerTransport>,
        registration: Registration,
    ) -> Result<()> {
        let stream = transport
            .consume(&registration.queue, &registration.tag, self.config.prefetch)
            .await?;
        info!(queue = %registration.queue, tag = %registration.tag, "Consumer attached");
        tokio::spawn(run_consumer(
            stream,
            registration,
            self.shutdown.clone(),
        ));
        Ok(())
    }

    fn spawn_watcher(self: &Arc<Self>, transport: Arc<dyn BrokerTransport>) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = transport.wait_closed() => {}
                _ = inner.shutdown.cancelled() => return,
            }
            {
                let mut current = inner.transport.write();
                if current.as_ref().is_some_and(|t| Arc::ptr_eq(t, &transport)) {
                    *current = None;
                }
            }
            warn!("Broker connection lost");
            inner.start_reconnect();
        });
    }

    fn start_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(self.clone().reconnect());
    }

    fn reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            let policy = self.config.reconnect.clone();
            for attempt in 1..=policy.max_attempts {
                let delay = policy.delay_for(attempt);
                info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling broker reconnect");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => {
                        self.reconnecting.store(false, Ordering::SeqCst);
                        return;
                    }
                }

                let _guard = self.connect_lock.lock().await;
                if self.current().is_some() {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                match self.establish().await {
                    Ok(_) => {
                        info!(attempt, "Reconnected to broker");
                        self.reconnecting.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
                }
            }

            let err = BrokerError::ReconnectExhausted(policy.max_attempts);
            error!(error = %err, "Giving up on broker connection");
            self.reconnecting.store(false, Ordering::SeqCst);
            self.fatal.send_replace(Some(err.to_string()));
        }
        .boxed()
    }
}

/// One message at a time: the next delivery is not pulled until the
/// handler has finished and the current one is settled.
async fn run_consumer(mut stream: DeliveryStream, registration: Registration, shutdown: CancellationToken) {
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = shutdown.cancelled() => break,
        };
        match next {
            Some(Ok(delivery)) => {
                process_delivery(delivery, &registration).await;
            }
            Some(Err(e)) => {
                warn!(queue = %registration.queue, error = %e, "Consumer stream error");
                break;
            }
            None => break,
        }
    }
    debug!(queue = %registration.queue, tag = %registration.tag, "Consumer stopped");
}

async fn process_delivery(delivery: Delivery, registration: &Registration) {
    let queue = registration.queue.as_str();
    let message = match QueueMessage::from_bytes(&delivery.body) {
        Ok(message) => message,
        Err(e) => {
            error!(queue, error = %e, "Rejecting unparseable message");
            if let Err(e) = delivery.reject().await {
                warn!(queue, error = %e, "Failed to reject message");
            }
            return;
        }
    };

    let task_id = message.task_id.clone();
    let incoming = Incoming {
        message,
        redelivered: delivery.redelivered,
    };

    let outcome = AssertUnwindSafe(registration.handler.handle(incoming))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("handler panicked")));

    let settled = match outcome {
        Ok(()) => delivery.ack().await,
        Err(e) => {
            error!(queue, task_id = %task_id, error = %e, "Handler failed, rejecting message");
            delivery.reject().await
        }
    };
    if let Err(e) = settled {
        // left unacknowledged; the broker redelivers it
        warn!(queue, task_id = %task_id, error = %e, "Failed to settle message");
    }
}
