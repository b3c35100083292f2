//! Dead-letter queue inspection and replay.

use genq_broker::{BrokerClient, Delivery};
use genq_core::QueueMessage;
use serde::Serialize;
use tracing::warn;

/// Unparseable dead-letter bodies are reported, never discarded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Unreadable {
    pub bytes: usize,
    pub error: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub messages: Vec<QueueMessage>,
    pub unreadable: Vec<Unreadable>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub replayed: Vec<String>,
    pub skipped: Vec<Unreadable>,
}

/// Fetch up to `limit` held deliveries, leaving them unacknowledged.
async fn drain(broker: &BrokerClient, queue: &str, limit: usize) -> anyhow::Result<Vec<Delivery>> {
    let mut held = Vec::new();
    while held.len() < limit {
        match broker.fetch(queue).await? {
            Some(delivery) => held.push(delivery),
            None => break,
        }
    }
    Ok(held)
}

/// Return held deliveries to the queue in their original order.
async fn restore(held: Vec<Delivery>) -> anyhow::Result<()> {
    for delivery in held.into_iter().rev() {
        delivery.requeue().await?;
    }
    Ok(())
}

/// Read the dead-letter queue without consuming it.
pub async fn list(broker: &BrokerClient, limit: usize) -> anyhow::Result<Listing> {
    let queue = broker.config().dead_letter_queue.clone();
    let held = drain(broker, &queue, limit).await?;

    let mut listing = Listing::default();
    for delivery in &held {
        match QueueMessage::from_bytes(&delivery.body) {
            Ok(message) => listing.messages.push(message),
            Err(e) => listing.unreadable.push(Unreadable {
                bytes: delivery.body.len(),
                error: e.to_string(),
            }),
        }
    }

    restore(held).await?;
    Ok(listing)
}

/// Move dead-lettered messages back onto the generation queue with their
/// retry count reset. Each message is acknowledged on the dead-letter queue
/// only after its replay has been published. `task_id` restricts the replay
/// to one task.
pub async fn replay(
    broker: &BrokerClient,
    limit: usize,
    task_id: Option<&str>,
) -> anyhow::Result<ReplayReport> {
    let config = broker.config().clone();
    let held = drain(broker, &config.dead_letter_queue, limit).await?;

    let mut report = ReplayReport::default();
    let mut keep = Vec::new();
    let mut pending = held.into_iter();

    while let Some(delivery) = pending.next() {
        let message = match QueueMessage::from_bytes(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable dead letter");
                report.skipped.push(Unreadable {
                    bytes: delivery.body.len(),
                    error: e.to_string(),
                });
                keep.push(delivery);
                continue;
            }
        };
        if task_id.is_some_and(|id| id != message.task_id) {
            keep.push(delivery);
            continue;
        }

        if let Err(e) = broker
            .publish(&config.generation_queue, &message.for_replay())
            .await
        {
            keep.push(delivery);
            keep.extend(pending.by_ref());
            restore(keep).await?;
            return Err(e.into());
        }
        delivery.ack().await?;
        report.replayed.push(message.task_id);
    }

    restore(keep).await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use genq_broker::{BrokerConfig, MemoryBroker};
    use genq_core::{GenerationParams, RetryPolicy, Task};
    use std::sync::Arc;

    fn dead_letter(id: &str) -> Vec<u8> {
        let mut task = Task::new(id.into(), GenerationParams::new("castle"), "o@x");
        task.retry_count = 3;
        QueueMessage::from_task(&task)
            .for_dead_letter("Maximum retries exceeded")
            .to_bytes()
            .unwrap()
    }

    async fn setup() -> (MemoryBroker, BrokerClient) {
        let memory = MemoryBroker::new();
        let config = BrokerConfig {
            url: "memory://".into(),
            ..Default::default()
        };
        let client = BrokerClient::new(config, RetryPolicy::default(), Arc::new(memory.connector()));
        client.connect().await.unwrap();
        (memory, client)
    }

    #[tokio::test]
    async fn test_list_leaves_queue_intact() {
        let (memory, client) = setup().await;
        let dlq = client.config().dead_letter_queue.clone();
        memory.inject(&dlq, &dead_letter("a")).unwrap();
        memory.inject(&dlq, b"not json").unwrap();
        memory.inject(&dlq, &dead_letter("b")).unwrap();
        let before = memory.messages(&dlq);

        let listing = list(&client, 100).await.unwrap();
        let ids: Vec<_> = listing.messages.iter().map(|m| m.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(listing.unreadable.len(), 1);
        assert_eq!(listing.messages[0].reason.as_deref(), Some("Maximum retries exceeded"));

        assert_eq!(memory.messages(&dlq), before);
    }

    #[tokio::test]
    async fn test_list_honours_limit() {
        let (memory, client) = setup().await;
        let dlq = client.config().dead_letter_queue.clone();
        for id in ["a", "b", "c"] {
            memory.inject(&dlq, &dead_letter(id)).unwrap();
        }

        let listing = list(&client, 2).await.unwrap();
        assert_eq!(listing.messages.len(), 2);
        assert_eq!(memory.queue_len(&dlq), 3);
    }

    #[tokio::test]
    async fn test_replay_resets_and_moves_messages() {
        let (memory, client) = setup().await;
        let config = client.config().clone();
        memory.inject(&config.dead_letter_queue, &dead_letter("a")).unwrap();
        memory.inject(&config.dead_letter_queue, b"garbage").unwrap();

        let report = replay(&client, 100, None).await.unwrap();
        assert_eq!(report.replayed, vec!["a".to_string()]);
        assert_eq!(report.skipped.len(), 1);

        assert_eq!(memory.messages(&config.dead_letter_queue), vec![b"garbage".to_vec()]);
        let replayed = memory.messages(&config.generation_queue);
        assert_eq!(replayed.len(), 1);
        let message = QueueMessage::from_bytes(&replayed[0]).unwrap();
        assert_eq!(message.task_id, "a");
        assert_eq!(message.retry_count, 0);
        assert!(message.reason.is_none());
        assert!(message.failed_at.is_none());
    }

    #[tokio::test]
    async fn test_replay_single_task() {
        let (memory, client) = setup().await;
        let config = client.config().clone();
        for id in ["a", "b", "c"] {
            memory.inject(&config.dead_letter_queue, &dead_letter(id)).unwrap();
        }

        let report = replay(&client, 100, Some("b")).await.unwrap();
        assert_eq!(report.replayed, vec!["b".to_string()]);

        let left: Vec<_> = memory
            .messages(&config.dead_letter_queue)
            .iter()
            .map(|body| QueueMessage::from_bytes(body).unwrap().task_id)
            .collect();
        assert_eq!(left, vec!["a".to_string(), "c".to_string()]);
    }
}
