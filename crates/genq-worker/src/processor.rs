use crate::{wait_for_prediction, BillingGate, PollPolicy, PredictionError, PredictionProvider};
use async_trait::async_trait;
use futures::FutureExt;
use genq_broker::{BrokerError, Incoming, MessageHandler, RetryOutcome, RetryScheduler};
use genq_core::{GenerationDefaults, QueueMessage, Task, TaskError, TaskId, TaskStatus, TaskUpdate};
use genq_persistence::{Adoption, PersistenceError, TaskStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Why one processing attempt failed.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Invalid parameters: {0}")]
    InvalidParams(TaskError),

    #[error("{0}")]
    Prediction(#[from] PredictionError),

    #[error("Prediction returned no usable output")]
    InvalidOutput,

    #[error("Processing panicked")]
    Panicked,

    #[error("Worker interrupted before completion")]
    Interrupted,

    #[error("Task store error: {0}")]
    Store(#[from] PersistenceError),
}

impl ProcessingError {
    /// Unrecoverable failures skip the retry queue.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProcessingError::InsufficientBalance | ProcessingError::InvalidParams(_)
        )
    }
}

/// Tasks whose pipeline is running in this process.
///
/// After a reconnect the broker can hand this process a redelivery of a
/// message whose first delivery is still being worked on; the second
/// delivery waits for the first to finish instead of racing it.
#[derive(Default)]
struct InFlight {
    running: Mutex<HashMap<TaskId, watch::Receiver<()>>>,
}

struct Running<'a> {
    registry: &'a InFlight,
    task_id: TaskId,
    // receivers see the channel close when this guard drops
    _done: watch::Sender<()>,
}

impl InFlight {
    /// Claim `task_id`, or get a handle that resolves when its current
    /// owner finishes.
    fn begin(&self, task_id: &str) -> Result<Running<'_>, watch::Receiver<()>> {
        let mut running = self.running.lock();
        if let Some(done) = running.get(task_id) {
            return Err(done.clone());
        }
        let (tx, rx) = watch::channel(());
        running.insert(task_id.to_string(), rx);
        Ok(Running {
            registry: self,
            task_id: task_id.to_string(),
            _done: tx,
        })
    }

    fn is_running(&self, task_id: &str) -> bool {
        self.running.lock().contains_key(task_id)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.registry.running.lock().remove(&self.task_id);
    }
}

/// The consumer loop body: one generation job from queued to succeeded,
/// or a handled failure routed to retry or dead-letter.
pub struct GenerationProcessor {
    store: Arc<TaskStore>,
    scheduler: RetryScheduler,
    billing: Arc<BillingGate>,
    provider: Arc<dyn PredictionProvider>,
    defaults: GenerationDefaults,
    poll: PollPolicy,
    max_interruptions: u32,
    in_flight: InFlight,
}

impl GenerationProcessor {
    pub fn new(
        store: Arc<TaskStore>,
        scheduler: RetryScheduler,
        billing: Arc<BillingGate>,
        provider: Arc<dyn PredictionProvider>,
        config: &crate::WorkerConfig,
    ) -> Self {
        GenerationProcessor {
            store,
            scheduler,
            billing,
            provider,
            defaults: config.generation.clone(),
            poll: config.prediction.poll.clone(),
            max_interruptions: config.max_interruptions,
            in_flight: InFlight::default(),
        }
    }

    /// Whether a pipeline for `task_id` is running in this process.
    pub fn is_running(&self, task_id: &str) -> bool {
        self.in_flight.is_running(task_id)
    }

    async fn run(&self, task: &Task) -> Result<(), ProcessingError> {
        let id = task.task_id.as_str();
        task.params.validate().map_err(ProcessingError::InvalidParams)?;

        self.store.transition(id, TaskStatus::Processing, TaskUpdate::default())?;

        if !self.billing.has_sufficient_balance(&task.owner_identity).await {
            return Err(ProcessingError::InsufficientBalance);
        }

        self.store
            .transition(id, TaskStatus::PredictionCreating, TaskUpdate::default())?;
        let input = self.defaults.prediction_input(&task.params);
        let created = self.provider.create_prediction(input).await?;
        self.store.transition(
            id,
            TaskStatus::PredictionCreated,
            TaskUpdate::prediction(created.id.clone()),
        )?;
        self.store
            .transition(id, TaskStatus::WaitingForPrediction, TaskUpdate::default())?;

        let done = wait_for_prediction(self.provider.as_ref(), &created.id, &self.poll).await?;
        let urls = done.output_urls().ok_or(ProcessingError::InvalidOutput)?;

        let billing = self
            .billing
            .settle(&task.owner_identity, done.predict_time())
            .await;
        let billed = match billing.status {
            genq_core::BillingStatus::Succeeded => TaskStatus::BillingProcessed,
            genq_core::BillingStatus::Failed => TaskStatus::BillingError,
        };
        self.store.transition(id, billed, TaskUpdate::billing(billing))?;
        self.store
            .transition(id, TaskStatus::Succeeded, TaskUpdate::results(urls))?;

        info!(task_id = %id, prediction_id = %created.id, "Generation succeeded");
        Ok(())
    }

    /// Record the failure and hand the message to the retry queue or the
    /// dead-letter queue. An `Err` means the hand-off itself failed.
    async fn fail(&self, message: &QueueMessage, cause: ProcessingError) -> Result<(), BrokerError> {
        let id = message.task_id.as_str();
        warn!(task_id = %id, error = %cause, retryable = cause.is_retryable(), "Generation attempt failed");

        let retry_count = match self
            .store
            .transition(id, TaskStatus::Failed, TaskUpdate::error(cause.to_string()))
        {
            Ok(task) => task.retry_count,
            Err(e) => {
                warn!(task_id = %id, error = %e, "Could not mark task failed");
                self.store
                    .get(id)
                    .ok()
                    .flatten()
                    .map_or(message.retry_count, |t| t.retry_count.max(message.retry_count))
            }
        };

        let handoff = if cause.is_retryable() {
            self.scheduler.schedule_retry(message, retry_count).await
        } else {
            self.scheduler
                .dead_letter(message, &cause.to_string())
                .await
                .map(|_| RetryOutcome::DeadLettered)
        };

        let (status, update) = match handoff {
            Ok(RetryOutcome::Scheduled { retry_count, .. }) => {
                (TaskStatus::Retrying, TaskUpdate::retry_count(retry_count))
            }
            Ok(RetryOutcome::DeadLettered) => (TaskStatus::DeadLettered, TaskUpdate::default()),
            Err(e) => {
                // left in `failed` until a redelivery or a dead-letter replay settles it
                error!(task_id = %id, error = %e, "Could not hand off failed task");
                return Err(e);
            }
        };
        if let Err(e) = self.store.transition(id, status, update) {
            warn!(task_id = %id, status = %status, error = %e, "Could not record failure outcome");
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for GenerationProcessor {
    async fn handle(&self, incoming: Incoming) -> anyhow::Result<()> {
        let message = incoming.message;

        let _running = loop {
            match self.in_flight.begin(&message.task_id) {
                Ok(running) => break running,
                Err(mut done) => {
                    info!(task_id = %message.task_id, "Task already running here, holding the delivery");
                    while done.changed().await.is_ok() {}
                    // settled by the running attempt unless its hand-off failed
                    let status = self.store.get(&message.task_id)?.map(|t| t.status);
                    if status != Some(TaskStatus::Failed) {
                        return Ok(());
                    }
                }
            }
        };

        if incoming.redelivered {
            if message.interruptions < self.max_interruptions {
                // connection loss is not a failed attempt
                self.scheduler.requeue_interrupted(&message).await?;
                return Ok(());
            }
            if let Adoption::Duplicate(task) = self.store.adopt(&message)? {
                info!(task_id = %task.task_id, status = %task.status, "Skipping delivery of a finished task");
                return Ok(());
            }
            self.fail(&message, ProcessingError::Interrupted).await?;
            return Ok(());
        }

        let task = match self.store.adopt(&message)? {
            Adoption::Ready(task) => task,
            Adoption::Duplicate(task) => {
                info!(task_id = %task.task_id, status = %task.status, "Skipping delivery of a finished task");
                return Ok(());
            }
        };

        let outcome = AssertUnwindSafe(self.run(&task))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(task_id = %task.task_id, "Generation pipeline panicked");
                Err(ProcessingError::Panicked)
            });

        match outcome {
            Ok(()) => Ok(()),
            Err(cause) => {
                self.fail(&message, cause).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BillingConfig, Ledger, LedgerError, Prediction, PredictionStatus, WorkerConfig};
    use genq_broker::{BrokerClient, BrokerConfig, MemoryBroker};
    use genq_core::{GenerationParams, RetryPolicy, SafeTask};
    use genq_persistence::{MemoryRepository, TaskListener};
    use serde_json::{json, Value};

    struct FixedLedger(f64);

    #[async_trait]
    impl Ledger for FixedLedger {
        async fn balance(&self, _owner: &str) -> crate::billing::Result<f64> {
            Ok(self.0)
        }

        async fn deduct(&self, _owner: &str, _amount: f64) -> crate::billing::Result<()> {
            Err(LedgerError::InvalidResponse("ledger offline".into()))
        }
    }

    /// Succeeds immediately unless `fail` is set, in which case every job fails.
    struct InstantProvider {
        fail: bool,
        panic: bool,
    }

    #[async_trait]
    impl PredictionProvider for InstantProvider {
        async fn create_prediction(&self, _input: Value) -> crate::prediction::Result<Prediction> {
            if self.panic {
                panic!("provider bug");
            }
            Ok(Prediction {
                id: "pred-1".into(),
                status: PredictionStatus::Starting,
                output: None,
                error: None,
                metrics: None,
            })
        }

        async fn get_prediction(&self, id: &str) -> crate::prediction::Result<Prediction> {
            let status = if self.fail {
                PredictionStatus::Failed
            } else {
                PredictionStatus::Succeeded
            };
            Ok(Prediction {
                id: id.into(),
                status,
                output: Some(json!(["https://img/out.png"])),
                error: Some(json!("CUDA error")),
                metrics: None,
            })
        }

        async fn cancel_prediction(&self, _id: &str) -> crate::prediction::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TaskStatus>>);

    impl TaskListener for Recorder {
        fn on_transition(&self, task: &SafeTask) {
            self.0.lock().push(task.status);
        }
    }

    struct Harness {
        broker: MemoryBroker,
        store: Arc<TaskStore>,
        recorder: Arc<Recorder>,
        processor: GenerationProcessor,
    }

    fn harness(balance: f64, provider: InstantProvider) -> Harness {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(
            BrokerConfig::default(),
            RetryPolicy::default(),
            Arc::new(broker.connector()),
        );
        let store = Arc::new(TaskStore::new(Arc::new(MemoryRepository::new())));
        let recorder = Arc::new(Recorder::default());
        store.add_listener(recorder.clone());

        let billing = Arc::new(BillingGate::new(
            Arc::new(FixedLedger(balance)),
            &BillingConfig::default(),
        ));
        let mut config = WorkerConfig::default();
        config.prediction.poll.interval_ms = 1;
        let processor = GenerationProcessor::new(
            store.clone(),
            client.retry_scheduler(),
            billing,
            Arc::new(provider),
            &config,
        );
        Harness {
            broker,
            store,
            recorder,
            processor,
        }
    }

    fn incoming(retry_count: u32, redelivered: bool) -> Incoming {
        let mut task = Task::new("t1".into(), GenerationParams::new("a lighthouse"), "u1");
        task.retry_count = retry_count;
        Incoming {
            message: QueueMessage::from_task(&task),
            redelivered,
        }
    }

    #[tokio::test]
    async fn test_success_walks_the_full_pipeline() {
        let h = harness(5.0, InstantProvider { fail: false, panic: false });
        h.processor.handle(incoming(0, false)).await.unwrap();

        use TaskStatus::*;
        assert_eq!(
            *h.recorder.0.lock(),
            vec![
                Created,
                Queued,
                Processing,
                PredictionCreating,
                PredictionCreated,
                WaitingForPrediction,
                BillingError,
                Succeeded
            ]
        );
        let task = h.store.get("t1").unwrap().unwrap();
        assert_eq!(task.result_urls.unwrap(), vec!["https://img/out.png".to_string()]);
        assert_eq!(task.prediction_id.as_deref(), Some("pred-1"));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_acknowledged() {
        let h = harness(5.0, InstantProvider { fail: false, panic: false });
        h.processor.handle(incoming(0, false)).await.unwrap();
        let transitions = h.recorder.0.lock().len();

        h.processor.handle(incoming(0, false)).await.unwrap();
        assert_eq!(h.recorder.0.lock().len(), transitions);
    }

    #[tokio::test]
    async fn test_job_failure_is_scheduled_for_retry() {
        let h = harness(5.0, InstantProvider { fail: true, panic: false });
        h.processor.handle(incoming(0, false)).await.unwrap();

        let task = h.store.get("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 1);
        assert!(task.error.unwrap().contains("CUDA error"));
        assert_eq!(h.broker.queue_len("retry_queue"), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let h = harness(5.0, InstantProvider { fail: true, panic: false });
        h.processor.handle(incoming(3, false)).await.unwrap();

        let task = h.store.get("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::DeadLettered);
        assert_eq!(task.retry_count, 3);
        let dead = QueueMessage::from_bytes(&h.broker.messages("dead_letter_queue")[0]).unwrap();
        assert_eq!(dead.reason.as_deref(), Some(genq_broker::MAX_RETRIES_EXCEEDED));
    }

    #[tokio::test]
    async fn test_insufficient_balance_skips_retries() {
        let h = harness(0.5, InstantProvider { fail: false, panic: false });
        h.processor.handle(incoming(0, false)).await.unwrap();

        let task = h.store.get("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::DeadLettered);
        assert_eq!(h.broker.queue_len("retry_queue"), 0);
        assert_eq!(h.broker.queue_len("dead_letter_queue"), 1);
        assert!(!h.recorder.0.lock().contains(&TaskStatus::PredictionCreating));
    }

    #[tokio::test]
    async fn test_panic_is_a_retryable_failure() {
        let h = harness(5.0, InstantProvider { fail: false, panic: true });
        h.processor.handle(incoming(0, false)).await.unwrap();
        assert_eq!(h.store.get("t1").unwrap().unwrap().status, TaskStatus::Retrying);
    }

    #[tokio::test]
    async fn test_redelivery_is_requeued_without_spending_a_retry() {
        let h = harness(5.0, InstantProvider { fail: false, panic: false });
        h.processor.handle(incoming(0, true)).await.unwrap();

        let requeued = h.broker.messages("generation_queue");
        assert_eq!(requeued.len(), 1);
        let requeued = QueueMessage::from_bytes(&requeued[0]).unwrap();
        assert_eq!(requeued.interruptions, 1);
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(h.broker.queue_len("retry_queue"), 0);
        assert!(!h.recorder.0.lock().contains(&TaskStatus::Retrying));

        // the requeued copy runs as a first attempt
        let again = Incoming {
            message: requeued,
            redelivered: false,
        };
        h.processor.handle(again).await.unwrap();
        let task = h.store.get("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_repeated_interruptions_count_as_attempt() {
        let h = harness(5.0, InstantProvider { fail: false, panic: false });
        let mut delivery = incoming(0, true);
        delivery.message.interruptions = 3;
        h.processor.handle(delivery).await.unwrap();

        let task = h.store.get("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error.as_deref(), Some("Worker interrupted before completion"));
        assert!(!h.recorder.0.lock().contains(&TaskStatus::Processing));
        assert_eq!(h.broker.queue_len("generation_queue"), 0);

        let retry = QueueMessage::from_bytes(&h.broker.messages("retry_queue")[0]).unwrap();
        assert_eq!(retry.interruptions, 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_waits_for_running_attempt() {
        let h = harness(5.0, InstantProvider { fail: false, panic: false });
        let first = incoming(0, false);
        let task = match h.store.adopt(&first.message).unwrap() {
            Adoption::Ready(task) => task,
            Adoption::Duplicate(_) => panic!("fresh task"),
        };
        let running = h.processor.in_flight.begin("t1").ok().unwrap();
        assert!(h.processor.is_running("t1"));

        let (duplicate, ()) = tokio::join!(h.processor.handle(incoming(0, true)), async {
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
            assert_eq!(h.broker.queue_len("generation_queue"), 0);
            h.processor.run(&task).await.unwrap();
            drop(running);
        });
        duplicate.unwrap();

        assert!(!h.processor.is_running("t1"));
        assert_eq!(h.store.get("t1").unwrap().unwrap().status, TaskStatus::Succeeded);
        assert_eq!(h.broker.queue_len("generation_queue"), 0);
        assert_eq!(h.broker.queue_len("retry_queue"), 0);
        assert_eq!(
            h.recorder.0.lock().iter().filter(|s| **s == TaskStatus::Processing).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_handoff_leaves_task_failed() {
        let h = harness(5.0, InstantProvider { fail: true, panic: false });
        h.broker.set_available(false);
        assert!(h.processor.handle(incoming(0, false)).await.is_err());

        let task = h.store.get("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.completed_at.is_none());
        assert!(!h.processor.is_running("t1"));
    }

    #[tokio::test]
    async fn test_redelivery_after_failed_handoff_does_not_finish_task() {
        let h = harness(5.0, InstantProvider { fail: true, panic: false });
        h.broker.set_available(false);
        assert!(h.processor.handle(incoming(0, false)).await.is_err());

        // the rejected message comes back once the broker is reachable
        h.broker.set_available(true);
        h.processor.handle(incoming(0, true)).await.unwrap();
        assert_eq!(h.broker.queue_len("generation_queue"), 1);
        assert!(!h.recorder.0.lock().contains(&TaskStatus::DeadLettered));
        assert_eq!(h.store.get("t1").unwrap().unwrap().status, TaskStatus::Failed);

        let requeued = QueueMessage::from_bytes(&h.broker.messages("generation_queue")[0]).unwrap();
        h.processor
            .handle(Incoming {
                message: requeued,
                redelivered: false,
            })
            .await
            .unwrap();

        let task = h.store.get("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 1);
        assert!(task.completed_at.is_none());
        assert!(!h.recorder.0.lock().contains(&TaskStatus::DeadLettered));
    }
}
