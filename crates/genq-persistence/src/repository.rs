use crate::Result;
use genq_core::{Task, TaskStatus};
use std::collections::HashMap;

/// Storage backend for task records, keyed by task id.
pub trait TaskRepository: Send + Sync {
    fn get(&self, task_id: &str) -> Result<Option<Task>>;

    /// Insert or replace the record for `task.task_id`.
    fn put(&self, task: &Task) -> Result<()>;

    /// All tasks, optionally filtered by status.
    fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>>;

    fn count_by_status(&self) -> Result<HashMap<TaskStatus, usize>> {
        let mut counts = HashMap::new();
        for task in self.list(None)? {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
