use crate::{
    mask_url, Acker, BrokerError, BrokerTransport, Connector, Delivery, DeliveryStream,
    PublishOptions, Result, Topology,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

const STATUS_POLL: Duration = Duration::from_secs(1);

/// Opens AMQP 0-9-1 connections with `lapin`.
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        AmqpConnector { url: url.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerTransport>> {
        debug!(url = %mask_url(&self.url), "Opening AMQP connection");
        let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;

        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let on_error = closed_tx.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            on_error.send_replace(true);
        });

        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        Ok(Arc::new(AmqpTransport {
            connection,
            channel,
            consumer_channels: Mutex::new(Vec::new()),
            closed_tx,
            closed_rx,
        }))
    }
}

pub struct AmqpTransport {
    connection: Connection,
    // publishing, declarations and basic.get
    channel: Channel,
    // kept alive for as long as their consumers run
    consumer_channels: Mutex<Vec<Channel>>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue: false,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn requeue(&self) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

fn dead_letter_args(exchange: Option<&String>, routing_key: Option<&String>) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(exchange) = exchange {
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );
    }
    if let Some(key) = routing_key {
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(key.as_str().into()),
        );
    }
    args
}

impl AmqpTransport {
    fn convert(delivery: lapin::message::Delivery) -> Delivery {
        Delivery::new(delivery.data, delivery.redelivered, AmqpAcker(delivery.acker))
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        for exchange in &topology.exchanges {
            self.channel
                .exchange_declare(
                    &exchange.name,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: exchange.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        for queue in &topology.queues {
            self.channel
                .queue_declare(
                    &queue.name,
                    QueueDeclareOptions {
                        durable: queue.durable,
                        ..Default::default()
                    },
                    dead_letter_args(
                        queue.dead_letter_exchange.as_ref(),
                        queue.dead_letter_routing_key.as_ref(),
                    ),
                )
                .await?;
        }

        for binding in &topology.bindings {
            self.channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
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
        let mut properties =
            BasicProperties::default().with_content_type(ShortString::from("application/json"));
        if options.persistent {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(ttl) = options.expiration {
            properties = properties.with_expiration(ShortString::from(ttl.as_millis().to_string()));
        }

        let confirmation = self
            .channel
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), body, properties)
            .await?
            .await?;
        if confirmation.is_nack() {
            return Err(BrokerError::NotConfirmed);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream> {
        let channel = self.connection.create_channel().await?;
        channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.consumer_channels.lock().push(channel);

        Ok(consumer
            .map(|item| item.map(Self::convert).map_err(BrokerError::from))
            .boxed())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?;
        Ok(message.map(|m| Self::convert(m.delivery)))
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed_rx.clone();
        loop {
            if *closed.borrow() || !self.is_open() {
                return;
            }
            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(STATUS_POLL) => {}
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed_tx.send_replace(true);
        if self.connection.status().connected() {
            self.connection.close(200, "closing").await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
            && self.channel.status().connected()
            && self.consumer_channels.lock().iter().all(|c| c.status().connected())
    }
}
