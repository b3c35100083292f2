use crate::{GenerationParams, Result, Task, TaskError, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire body carried on the generation, retry and dead-letter queues.
///
/// This is the complete hand-off of responsibility to a worker process:
/// a consumer must be able to process the job from the message alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub task_id: TaskId,

    #[serde(alias = "owner_identity")]
    pub owner_identity: String,

    #[serde(flatten)]
    pub params: GenerationParams,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Deliveries of this attempt that ended with the consumer gone before
    /// it settled the message.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub interruptions: u32,

    /// Set when an operator re-submits a finished task (manual retry or
    /// dead-letter replay). Only such messages may reopen a dead-lettered task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reopened_at: Option<DateTime<Utc>>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl QueueMessage {
    pub fn from_task(task: &Task) -> Self {
        QueueMessage {
            task_id: task.task_id.clone(),
            owner_identity: task.owner_identity.clone(),
            params: task.params.clone(),
            retry_count: task.retry_count,
            retried_at: None,
            failed_at: None,
            reason: None,
            interruptions: 0,
            reopened_at: None,
        }
    }

    /// Copy destined for the retry queue. It starts a fresh attempt.
    pub fn for_retry(&self, next_retry_count: u32) -> Self {
        QueueMessage {
            retry_count: next_retry_count,
            retried_at: Some(Utc::now()),
            interruptions: 0,
            reopened_at: None,
            ..self.clone()
        }
    }

    /// Copy put back on the generation queue after an interrupted delivery.
    pub fn for_interrupted(&self) -> Self {
        QueueMessage {
            interruptions: self.interruptions.saturating_add(1),
            ..self.clone()
        }
    }

    /// Mark the message as an operator re-submission.
    pub fn reopened(mut self) -> Self {
        self.reopened_at = Some(Utc::now());
        self.interruptions = 0;
        self
    }

    /// Copy destined for the dead-letter queue.
    pub fn for_dead_letter(&self, reason: impl Into<String>) -> Self {
        QueueMessage {
            failed_at: Some(Utc::now()),
            reason: Some(reason.into()),
            ..self.clone()
        }
    }

    /// Copy moved back onto the generation queue by operator tooling.
    pub fn for_replay(&self) -> Self {
        QueueMessage {
            retry_count: 0,
            retried_at: None,
            failed_at: None,
            reason: None,
            ..self.clone()
        }
        .reopened()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(TaskError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(TaskError::from)
    }
}
