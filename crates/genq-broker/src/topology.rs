//! Queue layout shared by every process.
//!
//! ```text
//! generation_queue --(reject)--> dl.exchange --dead.letter.routing.key--> dead_letter_queue
//! retry_queue --(TTL expiry)--> "" --generation_queue--> generation_queue
//! ```

use crate::{BrokerConfig, DEFAULT_EXCHANGE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`
    pub dead_letter_routing_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Direct exchanges, durable queues and their bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Topology {
            exchanges: vec![ExchangeSpec {
                name: config.dead_letter_exchange.clone(),
                durable: true,
            }],
            queues: vec![
                QueueSpec {
                    name: config.generation_queue.clone(),
                    durable: true,
                    dead_letter_exchange: Some(config.dead_letter_exchange.clone()),
                    dead_letter_routing_key: Some(config.dead_letter_routing_key.clone()),
                },
                // delay line: expired messages go straight back to the work queue
                QueueSpec {
                    name: config.retry_queue.clone(),
                    durable: true,
                    dead_letter_exchange: Some(DEFAULT_EXCHANGE.to_string()),
                    dead_letter_routing_key: Some(config.generation_queue.clone()),
                },
                QueueSpec {
                    name: config.dead_letter_queue.clone(),
                    durable: true,
                    dead_letter_exchange: None,
                    dead_letter_routing_key: None,
                },
            ],
            bindings: vec![Binding {
                queue: config.dead_letter_queue.clone(),
                exchange: config.dead_letter_exchange.clone(),
                routing_key: config.dead_letter_routing_key.clone(),
            }],
        }
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }
}
