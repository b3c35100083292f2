use crate::{BrokerClient, PublishOptions, Result};
use genq_core::{QueueMessage, RetryDecision, RetryPolicy};
use std::time::Duration;
use tracing::{info, warn};

/// Reason attached to messages dead-lettered by exhaustion.
pub const MAX_RETRIES_EXCEEDED: &str = "Max retries exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Parked on the retry queue; the broker re-delivers it after `delay`.
    Scheduled { retry_count: u32, delay: Duration },
    DeadLettered,
}

/// Decides between another attempt and the dead-letter queue.
///
/// Delays are carried out by the broker (per-message TTL on the retry
/// queue), never by timers in this process.
#[derive(Clone)]
pub struct RetryScheduler {
    client: BrokerClient,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(client: BrokerClient, policy: RetryPolicy) -> Self {
        RetryScheduler { client, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn schedule_retry(&self, message: &QueueMessage, retry_count: u32) -> Result<RetryOutcome> {
        match self.policy.decide(retry_count) {
            RetryDecision::DeadLetter => {
                self.dead_letter(message, MAX_RETRIES_EXCEEDED).await?;
                Ok(RetryOutcome::DeadLettered)
            }
            RetryDecision::Requeue { delay, next_retry_count } => {
                let retry = message.for_retry(next_retry_count);
                let queue = &self.client.config().retry_queue;
                self.client
                    .publish_with(queue, &retry, PublishOptions::persistent().with_expiration(delay))
                    .await?;
                info!(
                    task_id = %message.task_id,
                    retry_count = next_retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduled retry"
                );
                Ok(RetryOutcome::Scheduled {
                    retry_count: next_retry_count,
                    delay,
                })
            }
        }
    }

    /// Put an interrupted delivery back on the generation queue, stamped with
    /// one more interruption. No retry is consumed and no delay applies.
    pub async fn requeue_interrupted(&self, message: &QueueMessage) -> Result<QueueMessage> {
        let requeued = message.for_interrupted();
        let queue = &self.client.config().generation_queue;
        self.client.publish(queue, &requeued).await?;
        warn!(
            task_id = %message.task_id,
            interruptions = requeued.interruptions,
            "Requeued interrupted delivery"
        );
        Ok(requeued)
    }

    /// Send `message` straight to the dead-letter queue.
    pub async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<()> {
        let dead = message.for_dead_letter(reason);
        let queue = &self.client.config().dead_letter_queue;
        self.client.publish(queue, &dead).await?;
        warn!(task_id = %message.task_id, reason, "Message dead-lettered");
        Ok(())
    }
}
