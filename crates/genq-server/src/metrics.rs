use genq_core::{SafeTask, TaskStatus};
use genq_persistence::TaskListener;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus metrics for one service process
pub struct ServiceMetrics {
    pub registry: Registry,

    pub task_transitions: IntCounterVec,
    pub retries_scheduled: IntCounter,
    pub dead_letters: IntCounter,

    pub sse_clients: IntGauge,
    pub http_rejections: IntCounterVec,
}

impl ServiceMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let task_transitions = IntCounterVec::new(
            Opts::new("genq_task_transitions_total", "Task transitions by target status"),
            &["status"],
        )?;
        registry.register(Box::new(task_transitions.clone()))?;

        let retries_scheduled =
            IntCounter::new("genq_retries_scheduled_total", "Tasks parked on the retry queue")?;
        registry.register(Box::new(retries_scheduled.clone()))?;

        let dead_letters = IntCounter::new("genq_dead_letters_total", "Tasks dead-lettered")?;
        registry.register(Box::new(dead_letters.clone()))?;

        let sse_clients = IntGauge::new("genq_sse_clients", "Connected event-stream clients")?;
        registry.register(Box::new(sse_clients.clone()))?;

        let http_rejections = IntCounterVec::new(
            Opts::new("genq_http_rejections_total", "Rejected HTTP requests by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(http_rejections.clone()))?;

        Ok(ServiceMetrics {
            registry,
            task_transitions,
            retries_scheduled,
            dead_letters,
            sse_clients,
            http_rejections,
        })
    }

    pub fn reject(&self, reason: &str) {
        self.http_rejections.with_label_values(&[reason]).inc();
    }

    /// Text exposition format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl TaskListener for ServiceMetrics {
    fn on_transition(&self, task: &SafeTask) {
        self.task_transitions
            .with_label_values(&[task.status.as_str()])
            .inc();
        match task.status {
            TaskStatus::Retrying if task.error.is_some() => self.retries_scheduled.inc(),
            TaskStatus::DeadLettered => self.dead_letters.inc(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genq_core::{GenerationParams, Task, TaskUpdate};

    #[test]
    fn test_transitions_are_counted() {
        let metrics = ServiceMetrics::new().unwrap();
        let mut task = Task::new("m1".into(), GenerationParams::new("p"), "u1");
        for status in [TaskStatus::Queued, TaskStatus::Processing] {
            task.transition(status, TaskUpdate::default()).unwrap();
            metrics.on_transition(&task.to_safe());
        }
        task.transition(TaskStatus::Failed, TaskUpdate::error("boom")).unwrap();
        metrics.on_transition(&task.to_safe());
        task.transition(TaskStatus::Retrying, TaskUpdate::retry_count(1)).unwrap();
        metrics.on_transition(&task.to_safe());
        metrics.reject("rate_limited");

        assert_eq!(metrics.task_transitions.with_label_values(&["queued"]).get(), 1);
        assert_eq!(metrics.retries_scheduled.get(), 1);
        assert_eq!(metrics.dead_letters.get(), 0);

        let text = metrics.render().unwrap();
        assert!(text.contains("genq_task_transitions_total{status=\"processing\"} 1"));
        assert!(text.contains("genq_http_rejections_total{reason=\"rate_limited\"} 1"));
    }
}
