use crate::{PersistenceError, Result, TaskRepository};
use chrono::{Duration, Utc};
use genq_core::{Task, TaskStatus};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::path::PathBuf;
use tracing::{debug, info};

/// Configuration for the RocksDB-backed repository
#[derive(Debug, Clone)]
pub struct RocksConfig {
    pub data_dir: PathBuf,
    pub finished_retention_days: i64,
}

impl Default for RocksConfig {
    fn default() -> Self {
        RocksConfig {
            data_dir: PathBuf::from("./data"),
            finished_retention_days: 7,
        }
    }
}

impl RocksConfig {
    /// Separate directory for one worker slot, so slots never share a lock.
    pub fn for_slot(&self, slot: usize) -> Self {
        RocksConfig {
            data_dir: self.data_dir.join(format!("slot-{}", slot)),
            ..self.clone()
        }
    }
}

/// Tasks that may still change
const CF_ACTIVE: &str = "active";
/// Tasks that reached `succeeded` or `dead_lettered`
const CF_FINISHED: &str = "finished";

/// Durable task repository using RocksDB
pub struct RocksRepository {
    db: DB,
    config: RocksConfig,
}

impl RocksRepository {
    pub fn open(config: RocksConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACTIVE, Options::default()),
            ColumnFamilyDescriptor::new(CF_FINISHED, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, config.data_dir.join("tasks"), cf_descriptors)?;
        info!("Opened task repository at {:?}", config.data_dir);

        Ok(RocksRepository { db, config })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Other(format!("CF {} not found", name)))
    }

    fn tasks_in_cf(&self, name: &str) -> Result<Vec<Task>> {
        let cf = self.cf(name)?;
        let mut tasks = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            tasks.push(Task::from_bytes(&value)?);
        }
        Ok(tasks)
    }

    /// Delete finished tasks whose `completed_at` is older than the retention window.
    pub fn cleanup_finished(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(self.config.finished_retention_days);
        let finished = self.cf(CF_FINISHED)?;

        let mut batch = WriteBatch::default();
        let mut count = 0;
        for item in self.db.iterator_cf(finished, IteratorMode::Start) {
            let (key, value) = item?;
            let task = Task::from_bytes(&value)?;
            if task.completed_at.is_some_and(|at| at < cutoff) {
                batch.delete_cf(finished, &key);
                count += 1;
            }
        }

        if count > 0 {
            self.db.write(batch)?;
            info!("Cleaned up {} finished tasks", count);
        }
        Ok(count)
    }
}

impl TaskRepository for RocksRepository {
    fn get(&self, task_id: &str) -> Result<Option<Task>> {
        for name in [CF_ACTIVE, CF_FINISHED] {
            if let Some(value) = self.db.get_cf(self.cf(name)?, task_id.as_bytes())? {
                return Ok(Some(Task::from_bytes(&value)?));
            }
        }
        Ok(None)
    }

    fn put(&self, task: &Task) -> Result<()> {
        let key = task.task_id.as_bytes();
        let (target, other) = if task.status.is_terminal() {
            (self.cf(CF_FINISHED)?, self.cf(CF_ACTIVE)?)
        } else {
            (self.cf(CF_ACTIVE)?, self.cf(CF_FINISHED)?)
        };

        let mut batch = WriteBatch::default();
        batch.delete_cf(other, key);
        batch.put_cf(target, key, task.to_bytes()?);
        self.db.write(batch)?;

        debug!(task_id = %task.task_id, status = %task.status, "Persisted task");
        Ok(())
    }

    fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let mut tasks = match status {
            Some(s) if s.is_terminal() => self.tasks_in_cf(CF_FINISHED)?,
            Some(_) => self.tasks_in_cf(CF_ACTIVE)?,
            None => {
                let mut all = self.tasks_in_cf(CF_ACTIVE)?;
                all.extend(self.tasks_in_cf(CF_FINISHED)?);
                all
            }
        };
        if let Some(s) = status {
            tasks.retain(|t| t.status == s);
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}
