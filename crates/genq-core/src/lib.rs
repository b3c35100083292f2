mod error;
mod message;
mod params;
mod retry;
mod task;

pub use error::{Result, TaskError};
pub use message::QueueMessage;
pub use params::{GenerationDefaults, GenerationParams, ParamOverrides};
pub use retry::{RetryDecision, RetryPolicy};
pub use task::{Billing, BillingStatus, SafeTask, Task, TaskId, TaskStatus, TaskUpdate};

/// Longest prompt accepted at ingress.
pub const MAX_PROMPT_LEN: usize = 2000;

/// Generate a fresh system-assigned task identifier.
pub fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}
