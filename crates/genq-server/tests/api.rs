use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use genq_broker::MemoryBroker;
use genq_core::{QueueMessage, TaskStatus, TaskUpdate};
use genq_persistence::MemoryRepository;
use genq_server::service::{Components, Service};
use genq_server::ServiceConfig;
use genq_worker::{
    LedgerError, Prediction, PredictionError, PredictionProvider, PredictionStatus,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// `None` simulates an unreachable ledger.
struct Ledger(Option<f64>);

#[async_trait]
impl genq_worker::Ledger for Ledger {
    async fn balance(&self, _owner: &str) -> Result<f64, LedgerError> {
        self.0.ok_or(LedgerError::Status {
            status: 503,
            body: "maintenance".into(),
        })
    }

    async fn deduct(&self, _owner: &str, _amount: f64) -> Result<(), LedgerError> {
        Ok(())
    }
}

struct Instant;

#[async_trait]
impl PredictionProvider for Instant {
    async fn create_prediction(&self, _input: Value) -> Result<Prediction, PredictionError> {
        Ok(Prediction {
            id: "p-1".into(),
            status: PredictionStatus::Starting,
            output: None,
            error: None,
            metrics: None,
        })
    }

    async fn get_prediction(&self, id: &str) -> Result<Prediction, PredictionError> {
        Ok(Prediction {
            id: id.into(),
            status: PredictionStatus::Succeeded,
            output: Some(json!(["https://cdn/a.png"])),
            error: None,
            metrics: None,
        })
    }

    async fn cancel_prediction(&self, _id: &str) -> Result<(), PredictionError> {
        Ok(())
    }
}

fn service_with(broker: &MemoryBroker, balance: Option<f64>, config: ServiceConfig) -> Service {
    let components = Components {
        connector: Arc::new(broker.connector()),
        ledger: Arc::new(Ledger(balance)),
        provider: Arc::new(Instant),
        repository: Arc::new(MemoryRepository::new()),
        rocks: None,
    };
    Service::new(config, components).unwrap()
}

fn service(broker: &MemoryBroker, balance: Option<f64>) -> Service {
    let mut config = ServiceConfig::default();
    config.server.api_requests_per_minute = 1_000;
    config.prediction.poll.interval_ms = 1;
    service_with(broker, balance, config)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn submit_body(task_id: &str) -> Value {
    json!({ "taskId": task_id, "ownerIdentity": "u1@example.com", "prompt": "a snowy forest", "width": 512 })
}

#[tokio::test]
async fn test_submit_queues_and_publishes() {
    let broker = MemoryBroker::new();
    let service = service(&broker, Some(10.0));
    let app = service.router();

    let (status, body) = call(&app, "POST", "/api/generate", Some(submit_body("T1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({"success": true, "data": {"taskId": "T1", "status": "started"}}));

    let task = service.state.store.get("T1").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    let published = QueueMessage::from_bytes(&broker.messages("generation_queue")[0]).unwrap();
    assert_eq!(published.task_id, "T1");
    assert_eq!(published.owner_identity, "u1@example.com");
    assert_eq!(published.params.width, Some(512));
    assert!(published.reopened_at.is_none());
}

#[tokio::test]
async fn test_submit_generates_id() {
    let broker = MemoryBroker::new();
    let app = service(&broker, Some(10.0)).router();
    let (status, body) = call(
        &app,
        "POST",
        "/api/generate",
        Some(json!({"ownerIdentity": "u1", "prompt": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["taskId"].as_str().unwrap().len(), 36);
}

#[tokio::test]
async fn test_submit_validation() {
    let broker = MemoryBroker::new();
    let app = service(&broker, Some(10.0)).router();

    let (status, body) = call(&app, "POST", "/api/generate", Some(json!({"ownerIdentity": "u1", "prompt": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("prompt"));

    let (status, _) = call(&app, "POST", "/api/generate", Some(json!({"prompt": "ok"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, "POST", "/api/generate", Some(json!({"ownerIdentity": "u1", "prompt": "ok", "steps": 500}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, "POST", "/api/generate", Some(json!("not an object"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(broker.queue_len("generation_queue"), 0);
}

#[tokio::test]
async fn test_balance_gate() {
    let broker = MemoryBroker::new();
    let poor = service(&broker, Some(0.2)).router();
    let (status, body) = call(&poor, "POST", "/api/generate", Some(submit_body("T1"))).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "Insufficient balance");

    // an unreachable ledger lets the request through
    let offline = service(&broker, None).router();
    let (status, _) = call(&offline, "POST", "/api/generate", Some(submit_body("T2"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_duplicate_task_id_conflicts() {
    let broker = MemoryBroker::new();
    let app = service(&broker, Some(10.0)).router();
    call(&app, "POST", "/api/generate", Some(submit_body("T1"))).await;
    let (status, _) = call(&app, "POST", "/api/generate", Some(submit_body("T1"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(broker.queue_len("generation_queue"), 1);
}

#[tokio::test]
async fn test_publish_failure_marks_task_failed() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let service = service(&broker, Some(10.0));
    let app = service.router();

    let (status, body) = call(&app, "POST", "/api/generate", Some(submit_body("T1"))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
    let task = service.state.store.get("T1").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().starts_with("Failed to enqueue task"));
    service.shutdown().await;
}

#[tokio::test]
async fn test_status_returns_safe_projection() {
    let broker = MemoryBroker::new();
    let app = service(&broker, Some(10.0)).router();
    call(&app, "POST", "/api/generate", Some(submit_body("T1"))).await;

    let (status, body) = call(&app, "GET", "/api/generate/task/T1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["taskId"], "T1");
    assert_eq!(body["data"]["status"], "queued");
    assert!(body["data"].get("ownerIdentity").is_none());

    let (status, body) = call(&app, "GET", "/api/generate/task/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_retry_rules() {
    let broker = MemoryBroker::new();
    let service = service(&broker, Some(10.0));
    let app = service.router();
    call(&app, "POST", "/api/generate", Some(submit_body("T1"))).await;

    let retry = |owner: &str, id: &str| json!({"taskId": id, "ownerIdentity": owner, "prompt": "a new prompt"});

    let (status, _) = call(&app, "POST", "/api/generate/retry", Some(retry("u1@example.com", "nope"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, "POST", "/api/generate/retry", Some(retry("u1@example.com", "T1"))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let store = &service.state.store;
    store.transition("T1", TaskStatus::Failed, TaskUpdate::error("boom")).unwrap();
    store.transition("T1", TaskStatus::DeadLettered, TaskUpdate::retry_count(3)).unwrap();

    let (status, _) = call(&app, "POST", "/api/generate/retry", Some(retry("intruder", "T1"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&app, "POST", "/api/generate/retry", Some(retry("u1@example.com", "T1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["retryCount"], 3);

    let task = store.get("T1").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.params.prompt, "a new prompt");
    assert!(task.error.is_none());
    assert!(task.completed_at.is_none());

    let messages = broker.messages("generation_queue");
    assert_eq!(messages.len(), 2);
    let republished = QueueMessage::from_bytes(&messages[1]).unwrap();
    assert_eq!(republished.task_id, "T1");
    assert_eq!(republished.retry_count, 3);
    assert!(republished.reopened_at.is_some());
}

#[tokio::test]
async fn test_api_rate_limit() {
    let broker = MemoryBroker::new();
    let mut config = ServiceConfig::default();
    config.server.api_requests_per_minute = 2;
    let service = service_with(&broker, Some(10.0), config);
    let app = service.router();

    for _ in 0..2 {
        let (status, _) = call(&app, "GET", "/api/generate/task/x", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
    let (status, body) = call(&app, "GET", "/api/generate/task/x", None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["success"], false);

    // health is not limited
    let (status, _) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);

    let response = app
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let text = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(text.to_vec()).unwrap();
    assert!(text.contains("genq_http_rejections_total{reason=\"rate_limited\"} 1"));
}

#[tokio::test]
async fn test_system_info() {
    let broker = MemoryBroker::new();
    let app = service(&broker, Some(10.0)).router();
    let (status, body) = call(&app, "GET", "/system", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["pid"], std::process::id());
    assert_eq!(body["data"]["loadAverage"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_end_to_end_with_event_stream() {
    let broker = MemoryBroker::new();
    let service = service(&broker, Some(10.0));
    let app = service.router();

    let response = app
        .clone()
        .oneshot(Request::get("/events?taskId=T9").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let mut events = response.into_body().into_data_stream();

    service.start_consumer().await;
    call(&app, "POST", "/api/generate", Some(submit_body("T9"))).await;

    let mut text = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !text.contains("\"status\":\"succeeded\"") {
        let chunk = tokio::time::timeout_at(deadline, events.next())
            .await
            .expect("event stream stalled")
            .unwrap()
            .unwrap();
        text.push_str(std::str::from_utf8(&chunk).unwrap());
    }

    assert!(text.starts_with("event: connected\n"));
    let order = ["\"created\"", "\"queued\"", "\"processing\"", "\"waiting_for_prediction\"", "\"billing_processed\"", "\"succeeded\""];
    let positions: Vec<usize> = order.iter().map(|s| text.find(s).unwrap()).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert!(!text.contains("ownerIdentity"));

    let (_, body) = call(&app, "GET", "/api/generate/task/T9", None).await;
    assert_eq!(body["data"]["resultUrls"], json!(["https://cdn/a.png"]));
    assert_eq!(body["data"]["billing"]["status"], "succeeded");
    assert_eq!(service.state.notifier.client_count(), 1);

    drop(events);
    assert_eq!(service.state.notifier.client_count(), 0);
    service.shutdown().await;
}
