//! In-process broker with the same routing behaviour as the AMQP topology:
//! per-message TTL expiry and rejection dead-letter through the queue's
//! `x-dead-letter-*` arguments, deliveries left unsettled when their
//! connection goes away come back with `redelivered` set, and consumers
//! never hold more than `prefetch` unacknowledged deliveries.

use crate::{
    Acker, BrokerError, BrokerTransport, Connector, Delivery, DeliveryStream, PublishOptions,
    QueueSpec, Result, Topology, DEFAULT_EXCHANGE,
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Clone)]
struct Stored {
    id: u64,
    body: Vec<u8>,
    routing_key: String,
    redelivered: bool,
}

struct MemQueue {
    spec: QueueSpec,
    ready: VecDeque<Stored>,
    notify: Arc<Notify>,
}

struct State {
    queues: HashMap<String, MemQueue>,
    exchanges: HashSet<String>,
    // exchange -> (routing key, queue)
    bindings: HashMap<String, Vec<(String, String)>>,
    connections: HashSet<u64>,
    next_connection: u64,
    next_message: u64,
    available: bool,
    connect_attempts: usize,
}

struct Inner {
    state: Mutex<State>,
    // bumped whenever a connection closes
    closures: watch::Sender<u64>,
}

/// Shared in-process broker; clones refer to the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (closures, _) = watch::channel(0);
        MemoryBroker {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queues: HashMap::new(),
                    exchanges: HashSet::new(),
                    bindings: HashMap::new(),
                    connections: HashSet::new(),
                    next_connection: 0,
                    next_message: 0,
                    available: true,
                    connect_attempts: 0,
                }),
                closures,
            }),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// While unavailable, every connection attempt is refused.
    pub fn set_available(&self, available: bool) {
        self.inner.state.lock().available = available;
    }

    /// Sever every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.inner.state.lock();
        state.connections.clear();
        drop(state);
        self.inner.closures.send_modify(|n| *n += 1);
    }

    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.state.lock().connect_attempts
    }

    /// Ready (unconsumed) message count.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Bodies of the ready messages, head first.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Place a raw body on a declared queue.
    pub fn inject(&self, queue: &str, body: &[u8]) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner
            .route(&mut state, DEFAULT_EXCHANGE, queue, body.to_vec(), None)
    }
}

impl Inner {
    fn is_open(&self, connection: u64) -> bool {
        self.state.lock().connections.contains(&connection)
    }

    fn close(&self, connection: u64) {
        let removed = self.state.lock().connections.remove(&connection);
        if removed {
            self.closures.send_modify(|n| *n += 1);
        }
    }

    fn route(
        self: &Arc<Self>,
        state: &mut State,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            if !state.exchanges.contains(exchange) {
                return Err(BrokerError::UnknownExchange(exchange.to_string()));
            }
            state
                .bindings
                .get(exchange)
                .map(|bs| {
                    bs.iter()
                        .filter(|(key, _)| key == routing_key)
                        .map(|(_, queue)| queue.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        for target in targets {
            state.next_message += 1;
            let id = state.next_message;
            let Some(queue) = state.queues.get_mut(&target) else {
                debug!(queue = %target, "Unroutable message dropped");
                continue;
            };
            queue.ready.push_back(Stored {
                id,
                body: body.clone(),
                routing_key: routing_key.to_string(),
                redelivered: false,
            });
            queue.notify.notify_waiters();

            if let Some(ttl) = ttl {
                let inner = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(ttl).await;
                    inner.expire(&target, id);
                });
            }
        }
        Ok(())
    }

    fn expire(self: &Arc<Self>, queue: &str, id: u64) {
        let mut state = self.state.lock();
        let expired = state.queues.get_mut(queue).and_then(|q| {
            let pos = q.ready.iter().position(|m| m.id == id)?;
            q.ready.remove(pos)
        });
        if let Some(message) = expired {
            self.dead_letter(&mut state, queue, message);
        }
    }

    fn dead_letter(self: &Arc<Self>, state: &mut State, queue: &str, message: Stored) {
        let Some(spec) = state.queues.get(queue).map(|q| q.spec.clone()) else {
            return;
        };
        match spec.dead_letter_exchange {
            Some(exchange) => {
                let key = spec.dead_letter_routing_key.unwrap_or(message.routing_key);
                if let Err(e) = self.route(state, &exchange, &key, message.body, None) {
                    debug!(queue, error = %e, "Dead-letter routing failed");
                }
            }
            None => debug!(queue, "Message discarded (no dead-letter exchange)"),
        }
    }

    fn return_to_queue(&self, queue: &str, mut message: Stored) {
        let mut state = self.state.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            message.redelivered = true;
            q.ready.push_front(message);
            q.notify.notify_waiters();
        }
    }

    async fn next_message(self: &Arc<Self>, connection: u64, queue: &str) -> Option<Stored> {
        let mut closures = self.closures.subscribe();
        loop {
            let notify = {
                let state = self.state.lock();
                if !state.connections.contains(&connection) {
                    return None;
                }
                state.queues.get(queue)?.notify.clone()
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if !state.connections.contains(&connection) {
                    return None;
                }
                if let Some(message) = state.queues.get_mut(queue)?.ready.pop_front() {
                    return Some(message);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                changed = closures.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    connection: u64,
    queue: String,
    message: Mutex<Option<Stored>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl MemoryAcker {
    fn settle(&self) -> Result<Option<Stored>> {
        if !self.inner.is_open(self.connection) {
            // left unsettled: returned to the queue on drop
            return Err(BrokerError::NotConnected);
        }
        Ok(self.message.lock().take())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle().map(|_| ())
    }

    async fn reject(&self) -> Result<()> {
        if let Some(message) = self.settle()? {
            let mut state = self.inner.state.lock();
            self.inner.dead_letter(&mut state, &self.queue, message);
        }
        Ok(())
    }

    async fn requeue(&self) -> Result<()> {
        if let Some(message) = self.settle()? {
            self.inner.return_to_queue(&self.queue, message);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(message) = self.message.get_mut().take() {
            self.inner.return_to_queue(&self.queue, message);
        }
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    inner: Arc<Inner>,
    connection: u64,
}

impl MemoryTransport {
    fn delivery(&self, queue: &str, message: Stored, permit: Option<OwnedSemaphorePermit>) -> Delivery {
        let body = message.body.clone();
        let redelivered = message.redelivered;
        Delivery::new(
            body,
            redelivered,
            MemoryAcker {
                inner: self.inner.clone(),
                connection: self.connection,
                queue: queue.to_string(),
                message: Mutex::new(Some(message)),
                _permit: permit,
            },
        )
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.is_open(self.connection) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock();
        for exchange in &topology.exchanges {
            state.exchanges.insert(exchange.name.clone());
        }
        for spec in &topology.queues {
            state.queues.entry(spec.name.clone()).or_insert_with(|| MemQueue {
                spec: spec.clone(),
                ready: VecDeque::new(),
                notify: Arc::new(Notify::new()),
            });
        }
        for binding in &topology.bindings {
            let entry = (binding.routing_key.clone(), binding.queue.clone());
            let bindings = state.bindings.entry(binding.exchange.clone()).or_default();
            if !bindings.contains(&entry) {
                bindings.push(entry);
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: &PublishOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock();
        self.inner
            .route(&mut state, exchange, routing_key, body.to_vec(), options.expiration)
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream> {
        self.ensure_open()?;
        if !self.inner.state.lock().queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }

        let permits = Arc::new(Semaphore::new(prefetch.max(1) as usize));
        let transport = MemoryTransport {
            inner: self.inner.clone(),
            connection: self.connection,
        };
        let queue = queue.to_string();

        let stream = futures::stream::unfold(
            (transport, queue, permits),
            |(transport, queue, permits)| async move {
                let permit = permits.clone().acquire_owned().await.ok()?;
                let message = transport
                    .inner
                    .next_message(transport.connection, &queue)
                    .await?;
                let delivery = transport.delivery(&queue, message, Some(permit));
                Some((Ok(delivery), (transport, queue, permits)))
            },
        );
        Ok(stream.boxed())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        let message = {
            let mut state = self.inner.state.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
            q.ready.pop_front()
        };
        Ok(message.map(|m| self.delivery(queue, m, None)))
    }

    async fn wait_closed(&self) {
        let mut closures = self.inner.closures.subscribe();
        while self.inner.is_open(self.connection) {
            if closures.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(self.connection);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.is_open(self.connection)
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerTransport>> {
        let inner = self.broker.inner.clone();
        let connection = {
            let mut state = inner.state.lock();
            state.connect_attempts += 1;
            if !state.available {
                return Err(BrokerError::ConnectionRefused("memory broker unavailable".into()));
            }
            state.next_connection += 1;
            let id = state.next_connection;
            state.connections.insert(id);
            id
        };
        Ok(Arc::new(MemoryTransport { inner, connection }))
    }
}
