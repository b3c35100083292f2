use crate::{Result, TaskRepository};
use dashmap::DashMap;
use genq_core::{Task, TaskId, TaskStatus};

/// Per-process task map. History is lost when the process exits.
#[derive(Default)]
pub struct MemoryRepository {
    tasks: DashMap<TaskId, Task>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl TaskRepository for MemoryRepository {
    fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.get(task_id).map(|t| t.value().clone()))
    }

    fn put(&self, task: &Task) -> Result<()> {
        self.tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| status.map_or(true, |s| entry.status == s))
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}
