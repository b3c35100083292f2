//! Submit → consume → retry → dead-letter over the in-process broker.

use async_trait::async_trait;
use genq_broker::{
    BrokerClient, BrokerConfig, Connector, MemoryBroker, PublishOptions, MAX_RETRIES_EXCEEDED,
};
use genq_core::{
    BillingStatus, GenerationParams, QueueMessage, RetryPolicy, SafeTask, Task, TaskStatus, TaskUpdate,
};
use genq_persistence::{MemoryRepository, TaskListener, TaskStore};
use genq_worker::{
    BillingConfig, BillingGate, GenerationProcessor, Ledger, Prediction, PredictionError,
    PredictionProvider, PredictionStatus, WorkerConfig,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct Ledger100;

#[async_trait]
impl Ledger for Ledger100 {
    async fn balance(&self, _owner: &str) -> Result<f64, genq_worker::LedgerError> {
        Ok(100.0)
    }

    async fn deduct(&self, _owner: &str, _amount: f64) -> Result<(), genq_worker::LedgerError> {
        Ok(())
    }
}

/// Jobs finish on the second poll; `failing` makes every job fail.
struct Provider {
    failing: bool,
    polls: Mutex<u32>,
}

#[async_trait]
impl PredictionProvider for Provider {
    async fn create_prediction(&self, _input: Value) -> Result<Prediction, PredictionError> {
        Ok(Prediction {
            id: "job".into(),
            status: PredictionStatus::Starting,
            output: None,
            error: None,
            metrics: None,
        })
    }

    async fn get_prediction(&self, id: &str) -> Result<Prediction, PredictionError> {
        let mut polls = self.polls.lock();
        *polls += 1;
        let status = match (*polls % 2 == 0, self.failing) {
            (false, _) => PredictionStatus::Processing,
            (true, false) => PredictionStatus::Succeeded,
            (true, true) => PredictionStatus::Failed,
        };
        Ok(Prediction {
            id: id.into(),
            status,
            output: Some(json!(["https://cdn/1.png", "https://cdn/2.png"])),
            error: Some(json!("model crashed")),
            metrics: Some(genq_worker::prediction::PredictionMetrics {
                predict_time: Some(7.3),
            }),
        })
    }

    async fn cancel_prediction(&self, _id: &str) -> Result<(), PredictionError> {
        Ok(())
    }
}

#[derive(Default)]
struct Transitions(Mutex<Vec<(TaskStatus, u32)>>);

impl TaskListener for Transitions {
    fn on_transition(&self, task: &SafeTask) {
        self.0.lock().push((task.status, task.retry_count));
    }
}

struct Service {
    broker: MemoryBroker,
    client: BrokerClient,
    store: Arc<TaskStore>,
    transitions: Arc<Transitions>,
}

async fn start(failing: bool) -> Service {
    start_on(MemoryBroker::new(), failing).await
}

async fn start_on(broker: MemoryBroker, failing: bool) -> Service {
    let client = BrokerClient::new(
        BrokerConfig::default(),
        RetryPolicy::default(),
        Arc::new(broker.connector()),
    );
    let store = Arc::new(TaskStore::new(Arc::new(MemoryRepository::new())));
    let transitions = Arc::new(Transitions::default());
    store.add_listener(transitions.clone());

    let config = WorkerConfig::default();
    let processor = GenerationProcessor::new(
        store.clone(),
        client.retry_scheduler(),
        Arc::new(BillingGate::new(Arc::new(Ledger100), &BillingConfig::default())),
        Arc::new(Provider {
            failing,
            polls: Mutex::new(0),
        }),
        &config,
    );
    let queue = client.config().generation_queue.clone();
    client.consume(&queue, Arc::new(processor)).await.unwrap();

    Service {
        broker,
        client,
        store,
        transitions,
    }
}

impl Service {
    async fn submit(&self, task_id: &str) {
        let task = self
            .store
            .create(Some(task_id.into()), GenerationParams::new("a red fox"), "u1")
            .unwrap();
        let task = self
            .store
            .transition(&task.task_id, TaskStatus::Queued, TaskUpdate::default())
            .unwrap();
        let queue = self.client.config().generation_queue.clone();
        self.client
            .publish(&queue, &QueueMessage::from_task(&task))
            .await
            .unwrap();
    }

    async fn wait_for_terminal(&self, task_id: &str) -> genq_core::Task {
        for _ in 0..600 {
            if let Some(task) = self.store.get(task_id).unwrap() {
                if task.status.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("task {} never finished", task_id);
    }
}

#[tokio::test(start_paused = true)]
async fn test_successful_generation() {
    let service = start(false).await;
    service.submit("T1").await;

    let task = service.wait_for_terminal("T1").await;
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.result_urls.as_ref().map(Vec::len), Some(2));
    let billing = task.billing.unwrap();
    assert_eq!(billing.status, BillingStatus::Succeeded);
    assert_eq!(billing.cost, 0.07);

    use TaskStatus::*;
    let statuses: Vec<TaskStatus> = service.transitions.0.lock().iter().map(|(s, _)| *s).collect();
    assert_eq!(
        statuses,
        vec![
            Created,
            Queued,
            Processing,
            PredictionCreating,
            PredictionCreated,
            WaitingForPrediction,
            BillingProcessed,
            Succeeded
        ]
    );
    assert_eq!(service.broker.queue_len("generation_queue"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_job_is_retried_then_dead_lettered() {
    let service = start(true).await;
    let started = tokio::time::Instant::now();
    service.submit("T2").await;

    let task = service.wait_for_terminal("T2").await;
    assert_eq!(task.status, TaskStatus::DeadLettered);
    assert_eq!(task.retry_count, 3);
    assert!(task.completed_at.is_some());

    // 10s + 20s + 40s of broker-side backoff
    assert!(started.elapsed() >= Duration::from_secs(70));

    let retries: Vec<u32> = service
        .transitions
        .0
        .lock()
        .iter()
        .filter(|(s, _)| *s == TaskStatus::Retrying)
        .map(|(_, n)| *n)
        .collect();
    assert_eq!(retries, vec![1, 2, 3]);

    let dead = service.broker.messages("dead_letter_queue");
    assert_eq!(dead.len(), 1);
    let message = QueueMessage::from_bytes(&dead[0]).unwrap();
    assert_eq!(message.task_id, "T2");
    assert_eq!(message.reason.as_deref(), Some(MAX_RETRIES_EXCEEDED));
    assert_eq!(service.broker.queue_len("retry_queue"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_does_not_spend_a_retry() {
    let broker = MemoryBroker::new();

    // another worker takes the message and loses its connection before settling it
    let crashed = broker.connector().connect().await.unwrap();
    crashed
        .declare(&BrokerConfig::default().topology())
        .await
        .unwrap();
    let task = Task::new("T5".into(), GenerationParams::new("a red fox"), "u1");
    let body = QueueMessage::from_task(&task).to_bytes().unwrap();
    crashed
        .publish("", "generation_queue", &body, &PublishOptions::persistent())
        .await
        .unwrap();
    let taken = crashed.get("generation_queue").await.unwrap().unwrap();
    assert!(!taken.redelivered);
    broker.drop_connections();
    crashed.wait_closed().await;
    drop(taken);

    let service = start_on(broker, false).await;
    let task = service.wait_for_terminal("T5").await;

    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.retry_count, 0);
    assert!(service
        .transitions
        .0
        .lock()
        .iter()
        .all(|(s, _)| *s != TaskStatus::Retrying && *s != TaskStatus::Failed));
    assert_eq!(service.broker.queue_len("retry_queue"), 0);
    assert_eq!(service.broker.queue_len("dead_letter_queue"), 0);
}
