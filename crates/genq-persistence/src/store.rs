use crate::{Result, TaskRepository};
use genq_core::{
    new_task_id, GenerationParams, ParamOverrides, QueueMessage, SafeTask, Task, TaskError,
    TaskId, TaskStatus, TaskUpdate,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observer of persisted task transitions.
///
/// Called synchronously, in transition order, with the safe projection.
/// Implementations must not block.
pub trait TaskListener: Send + Sync {
    fn on_transition(&self, task: &SafeTask);
}

/// Result of taking ownership of a consumed message.
#[derive(Debug, Clone)]
pub enum Adoption {
    /// The local record is `queued` and ready for processing.
    Ready(Task),
    /// The task already reached a terminal outcome that the message may not
    /// reopen; the delivery is a duplicate.
    Duplicate(Task),
}

/// Owner of the task state machine.
///
/// Every change goes through [`TaskStore::transition`] (or one of the helpers
/// built on it), is persisted, and is then broadcast to the listeners.
pub struct TaskStore {
    repo: Arc<dyn TaskRepository>,
    listeners: RwLock<Vec<Arc<dyn TaskListener>>>,
    // serialises read-modify-write cycles on the repository
    write_lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(repo: Arc<dyn TaskRepository>) -> Self {
        TaskStore {
            repo,
            listeners: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, task: &Task) {
        let safe = task.to_safe();
        for listener in self.listeners.read().iter() {
            listener.on_transition(&safe);
        }
    }

    fn load(&self, task_id: &str) -> Result<Task> {
        self.repo
            .get(task_id)?
            .ok_or_else(|| TaskError::TaskNotFound(task_id.to_string()).into())
    }

    fn save(&self, task: &Task) -> Result<()> {
        self.repo.put(task)?;
        self.notify(task);
        Ok(())
    }

    /// Create a new record in `created`. A caller-supplied id must be unused.
    pub fn create(
        &self,
        task_id: Option<TaskId>,
        params: GenerationParams,
        owner_identity: &str,
    ) -> Result<Task> {
        let task_id = task_id.unwrap_or_else(new_task_id);
        let _guard = self.write_lock.lock();

        if self.repo.get(&task_id)?.is_some() {
            return Err(TaskError::TaskAlreadyExists(task_id).into());
        }

        let task = Task::new(task_id, params, owner_identity);
        self.save(&task)?;
        info!(task_id = %task.task_id, "Task created");
        Ok(task)
    }

    /// Move a task to `status`, merging `update`. Illegal transitions are
    /// rejected and nothing is persisted.
    pub fn transition(&self, task_id: &str, status: TaskStatus, update: TaskUpdate) -> Result<Task> {
        let _guard = self.write_lock.lock();
        let mut task = self.load(task_id)?;
        task.transition(status, update)?;
        self.save(&task)?;
        info!(task_id = %task_id, status = %status, "Task updated");
        Ok(task)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        self.repo.get(task_id)
    }

    pub fn get_safe(&self, task_id: &str) -> Result<Option<SafeTask>> {
        Ok(self.repo.get(task_id)?.map(|t| t.to_safe()))
    }

    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<SafeTask>> {
        Ok(self.repo.list(status)?.iter().map(SafeTask::from).collect())
    }

    pub fn count_by_status(&self) -> Result<HashMap<TaskStatus, usize>> {
        self.repo.count_by_status()
    }

    /// Operator-initiated retry of a `failed` or `dead_lettered` task.
    ///
    /// Applies `overrides`, validates the result and leaves the task in
    /// `retrying` with its retry count preserved.
    pub fn reopen(&self, task_id: &str, overrides: &ParamOverrides) -> Result<Task> {
        let _guard = self.write_lock.lock();
        let mut task = self.load(task_id)?;

        let params = overrides.apply(&task.params);
        params.validate()?;
        task.reopen(params)?;
        self.save(&task)?;
        info!(task_id = %task_id, retry_count = task.retry_count, "Task reopened");
        Ok(task)
    }

    /// Make sure this process holds a `queued` record for a consumed message.
    ///
    /// The message is the hand-off of responsibility, so a missing record is
    /// created from it and the retry count becomes `max(local, message)`.
    /// An operator re-submission (see [`QueueMessage::reopened`]) restarts a
    /// `failed` or `dead_lettered` task with the message's retry count.
    pub fn adopt(&self, message: &QueueMessage) -> Result<Adoption> {
        let _guard = self.write_lock.lock();

        let mut task = match self.repo.get(&message.task_id)? {
            Some(task) => task,
            None => {
                let mut task = Task::new(
                    message.task_id.clone(),
                    message.params.clone(),
                    message.owner_identity.clone(),
                );
                task.retry_count = message.retry_count;
                self.save(&task)?;
                debug!(task_id = %task.task_id, "Adopted task from queue message");
                task
            }
        };

        // dead_lettered is final unless an operator re-submitted the task
        if task.status == TaskStatus::Succeeded
            || (task.status == TaskStatus::DeadLettered && message.reopened_at.is_none())
        {
            return Ok(Adoption::Duplicate(task));
        }

        let reopening = message.reopened_at.is_some()
            && matches!(task.status, TaskStatus::Failed | TaskStatus::DeadLettered);
        if reopening || task.retry_count < message.retry_count {
            task.retry_count = message.retry_count;
        }
        // the message is authoritative for what should run next
        task.params = message.params.clone();

        let steps = adoption_path(task.status);
        if task.status.is_in_flight() {
            warn!(task_id = %task.task_id, status = %task.status, "Previous attempt was interrupted");
        }
        for &step in steps {
            let update = match step {
                TaskStatus::Failed => TaskUpdate::error("worker interrupted before completion"),
                _ => TaskUpdate::default(),
            };
            if step == TaskStatus::Retrying && reopening {
                let params = task.params.clone();
                task.reopen(params)?;
            } else {
                task.transition(step, update)?;
            }
            self.save(&task)?;
        }
        if steps.is_empty() {
            // only bookkeeping changed
            self.repo.put(&task)?;
        }

        Ok(Adoption::Ready(task))
    }
}

/// Transitions that bring a record in `from` back to `queued`.
fn adoption_path(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match from {
        Queued => &[],
        Created | Retrying => &[Queued],
        Failed | DeadLettered => &[Retrying, Queued],
        _ => &[Failed, Retrying, Queued],
    }
}
