use crate::{GenerationParams, Result, TaskError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a task, stable across retries.
pub type TaskId = String;

/// Lifecycle stage of a generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Queued,
    Processing,
    PredictionCreating,
    PredictionCreated,
    WaitingForPrediction,
    BillingProcessed,
    BillingError,
    Succeeded,
    Failed,
    Retrying,
    DeadLettered,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 12] = [
        TaskStatus::Created,
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::PredictionCreating,
        TaskStatus::PredictionCreated,
        TaskStatus::WaitingForPrediction,
        TaskStatus::BillingProcessed,
        TaskStatus::BillingError,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Retrying,
        TaskStatus::DeadLettered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::PredictionCreating => "prediction_creating",
            TaskStatus::PredictionCreated => "prediction_created",
            TaskStatus::WaitingForPrediction => "waiting_for_prediction",
            TaskStatus::BillingProcessed => "billing_processed",
            TaskStatus::BillingError => "billing_error",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TaskError::UnknownStatus(s.to_string()))
    }

    /// `succeeded` and `dead_lettered` end an attempt cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::DeadLettered)
    }

    /// States in which a worker currently owns the task.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::Processing
                | TaskStatus::PredictionCreating
                | TaskStatus::PredictionCreated
                | TaskStatus::WaitingForPrediction
                | TaskStatus::BillingProcessed
                | TaskStatus::BillingError
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, next) {
            (Created, Queued) | (Retrying, Queued) => true,
            (Queued, Processing) => true,
            (Processing, PredictionCreating) => true,
            (PredictionCreating, PredictionCreated) => true,
            (PredictionCreated, WaitingForPrediction) => true,
            (WaitingForPrediction, BillingProcessed) | (WaitingForPrediction, BillingError) => true,
            (BillingProcessed, Succeeded) | (BillingError, Succeeded) => true,
            (Failed, Retrying) | (Failed, DeadLettered) => true,
            // manual retry of an exhausted task
            (DeadLettered, Retrying) => true,
            (from, Failed) => !from.is_terminal() && *from != Failed,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Succeeded,
    Failed,
}

/// Outcome of charging the owner for a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Billing {
    pub cost: f64,
    pub status: BillingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predict_time: Option<f64>,
}

/// Partial fields merged into a task on a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub prediction_id: Option<String>,
    pub result_urls: Option<Vec<String>>,
    pub error: Option<String>,
    pub retry_count: Option<u32>,
    pub billing: Option<Billing>,
}

impl TaskUpdate {
    pub fn prediction(id: impl Into<String>) -> Self {
        TaskUpdate {
            prediction_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TaskUpdate {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn retry_count(count: u32) -> Self {
        TaskUpdate {
            retry_count: Some(count),
            ..Default::default()
        }
    }

    pub fn results(urls: Vec<String>) -> Self {
        TaskUpdate {
            result_urls: Some(urls),
            ..Default::default()
        }
    }

    pub fn billing(billing: Billing) -> Self {
        TaskUpdate {
            billing: Some(billing),
            ..Default::default()
        }
    }
}

/// Internal task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,

    pub status: TaskStatus,

    #[serde(flatten)]
    pub params: GenerationParams,

    #[serde(alias = "owner_identity")]
    pub owner_identity: String,

    #[serde(default)]
    pub prediction_id: Option<String>,

    #[serde(default)]
    pub result_urls: Option<Vec<String>>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub billing: Option<Billing>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_id: TaskId, params: GenerationParams, owner_identity: impl Into<String>) -> Self {
        let now = Utc::now();
        Task {
            task_id,
            status: TaskStatus::Created,
            params,
            owner_identity: owner_identity.into(),
            prediction_id: None,
            result_urls: None,
            error: None,
            retry_count: 0,
            billing: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Apply one state-machine step: replace the status, stamp `updated_at`,
    /// merge `update`, and stamp `completed_at` on the first terminal outcome.
    pub fn transition(&mut self, next: TaskStatus, update: TaskUpdate) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        self.updated_at = Utc::now();
        self.merge(update);

        if next.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    fn merge(&mut self, update: TaskUpdate) {
        if let Some(id) = update.prediction_id {
            self.prediction_id = Some(id);
        }
        if let Some(urls) = update.result_urls {
            self.result_urls = Some(urls);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(count) = update.retry_count {
            // never decreases
            self.retry_count = self.retry_count.max(count);
        }
        if let Some(billing) = update.billing {
            self.billing = Some(billing);
        }
    }

    /// Start a new attempt cycle after an operator-initiated retry.
    ///
    /// Only valid from `failed` or `dead_lettered`; clears the outcome of the
    /// previous cycle but keeps `retry_count`.
    pub fn reopen(&mut self, params: GenerationParams) -> Result<()> {
        self.transition(TaskStatus::Retrying, TaskUpdate::default())?;
        self.params = params;
        self.completed_at = None;
        self.error = None;
        self.prediction_id = None;
        self.result_urls = None;
        self.billing = None;
        Ok(())
    }

    pub fn to_safe(&self) -> SafeTask {
        SafeTask::from(self)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(TaskError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(TaskError::from)
    }
}

/// Externally visible projection of a [`Task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeTask {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub result_urls: Option<Vec<String>>,
    #[serde(default)]
    pub prediction_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub billing: Option<Billing>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Task> for SafeTask {
    fn from(task: &Task) -> Self {
        SafeTask {
            task_id: task.task_id.clone(),
            status: task.status,
            prompt: task.params.prompt.clone(),
            negative_prompt: task.params.negative_prompt.clone(),
            width: task.params.width,
            height: task.params.height,
            result_urls: task.result_urls.clone(),
            prediction_id: task.prediction_id.clone(),
            retry_count: task.retry_count,
            billing: task.billing.clone(),
            error: task.error.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
            completed_at: task.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    fn task() -> Task {
        Task::new("t1".to_string(), GenerationParams::new("a red fox"), "u1@example.com")
    }

    const HAPPY_PATH: [TaskStatus; 7] = [
        Queued,
        Processing,
        PredictionCreating,
        PredictionCreated,
        WaitingForPrediction,
        BillingProcessed,
        Succeeded,
    ];

    #[test]
    fn test_status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!(TaskStatus::parse("pending").is_err());
    }

    #[test]
    fn test_happy_path_sets_completed_at_once() {
        let mut t = task();
        for next in HAPPY_PATH {
            t.transition(next, TaskUpdate::default()).unwrap();
        }
        assert_eq!(t.status, Succeeded);
        let completed = t.completed_at.expect("completed_at stamped");
        assert_eq!(completed, t.updated_at);

        // succeeded is final
        assert!(t.transition(Failed, TaskUpdate::default()).is_err());
        assert!(t.transition(Succeeded, TaskUpdate::default()).is_err());
        assert_eq!(t.completed_at, Some(completed));
    }

    #[test]
    fn test_cannot_skip_states() {
        let mut t = task();
        let err = t.transition(Processing, TaskUpdate::default()).unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition { from: Created, to: Processing }
        ));
        assert_eq!(t.status, Created);

        t.transition(Queued, TaskUpdate::default()).unwrap();
        assert!(t.transition(Succeeded, TaskUpdate::default()).is_err());
    }

    #[test]
    fn test_failure_loop_and_dead_letter() {
        let mut t = task();
        t.transition(Queued, TaskUpdate::default()).unwrap();
        t.transition(Processing, TaskUpdate::default()).unwrap();
        t.transition(Failed, TaskUpdate::error("boom")).unwrap();
        assert!(t.completed_at.is_none());
        assert!(t.transition(Failed, TaskUpdate::default()).is_err());

        t.transition(Retrying, TaskUpdate::retry_count(1)).unwrap();
        t.transition(Queued, TaskUpdate::default()).unwrap();
        t.transition(Failed, TaskUpdate::error("again")).unwrap();
        t.transition(DeadLettered, TaskUpdate::default()).unwrap();

        assert_eq!(t.retry_count, 1);
        assert_eq!(t.error.as_deref(), Some("again"));
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn test_retry_count_never_decreases() {
        let mut t = task();
        t.transition(Failed, TaskUpdate::retry_count(2)).unwrap();
        t.transition(Retrying, TaskUpdate::retry_count(1)).unwrap();
        assert_eq!(t.retry_count, 2);
    }

    #[test]
    fn test_reopen_starts_new_cycle() {
        let mut t = task();
        t.retry_count = 3;
        t.transition(Failed, TaskUpdate::error("out of retries")).unwrap();
        t.transition(DeadLettered, TaskUpdate::default()).unwrap();

        let mut params = t.params.clone();
        params.prompt = "a blue fox".into();
        t.reopen(params).unwrap();

        assert_eq!(t.status, Retrying);
        assert_eq!(t.retry_count, 3);
        assert!(t.completed_at.is_none());
        assert!(t.error.is_none());
        assert_eq!(t.params.prompt, "a blue fox");

        let mut done = task();
        for next in HAPPY_PATH {
            done.transition(next, TaskUpdate::default()).unwrap();
        }
        assert!(done.reopen(done.params.clone()).is_err());
    }

    #[test]
    fn test_safe_projection_hides_owner() {
        let mut t = task();
        t.params.steps = Some(30);
        t.params.seed = Some(42);
        let value = serde_json::to_value(t.to_safe()).unwrap();

        assert_eq!(value["taskId"], "t1");
        assert_eq!(value["status"], "created");
        assert_eq!(value["prompt"], "a red fox");
        assert!(value.get("ownerIdentity").is_none());
        assert!(value.get("steps").is_none());
        assert!(value.get("seed").is_none());
    }

    #[test]
    fn test_task_serialization() {
        let mut t = task();
        t.params.batch_size = Some(2);
        let bytes = t.to_bytes().unwrap();
        let decoded = Task::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, t);

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["ownerIdentity"], "u1@example.com");
        assert_eq!(value["batchSize"], 2);
    }
}
