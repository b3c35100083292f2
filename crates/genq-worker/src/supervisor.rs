//! Master process: keeps one worker process alive per slot.

use crate::SupervisorConfig;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Starts the process serving one slot.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, slot: usize) -> std::io::Result<Child>;
}

/// Re-executes a binary as `<program> <args...> worker --slot <n>`.
pub struct ExecSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ExecSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        ExecSpawner {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    /// Set an environment variable on every child. Used for credentials so
    /// they do not show up in the process table.
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Spawner for the running executable, forwarding `args` (global flags).
    pub fn current(args: Vec<OsString>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

impl WorkerSpawner for ExecSpawner {
    fn spawn(&self, slot: usize) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .arg("worker")
            .arg("--slot")
            .arg(slot.to_string())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Crash-only recovery: any worker that exits, for any reason, is started
/// again after the restart delay.
pub struct Supervisor {
    spawner: Arc<dyn WorkerSpawner>,
    workers: usize,
    restart_delay: Duration,
    shutdown_grace: Duration,
    restarts: Arc<AtomicUsize>,
}

impl Supervisor {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, config: &SupervisorConfig) -> Self {
        Supervisor {
            spawner,
            workers: config.worker_count(),
            restart_delay: Duration::from_millis(config.restart_delay_ms),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            restarts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Worker exits observed so far.
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Run until `shutdown` is cancelled and every child has exited.
    ///
    /// Children receive terminal and service-manager signals through their
    /// process group, so they get `shutdown_grace` to exit on their own
    /// before being killed.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(workers = self.workers, "Starting worker processes");
        let mut slots = JoinSet::new();
        for slot in 0..self.workers {
            slots.spawn(supervise_slot(
                slot,
                self.spawner.clone(),
                self.restart_delay,
                self.shutdown_grace,
                self.restarts.clone(),
                shutdown.clone(),
            ));
        }
        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Slot supervisor task failed");
            }
        }
        info!("All worker processes stopped");
    }
}

async fn supervise_slot(
    slot: usize,
    spawner: Arc<dyn WorkerSpawner>,
    restart_delay: Duration,
    grace: Duration,
    restarts: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        match spawner.spawn(slot) {
            Ok(mut child) => {
                info!(slot, pid = child.id(), "Worker started");
                tokio::select! {
                    status = child.wait() => {
                        restarts.fetch_add(1, Ordering::Relaxed);
                        match status {
                            Ok(status) => warn!(slot, %status, "Worker exited, restarting"),
                            Err(e) => warn!(slot, error = %e, "Lost track of worker, restarting"),
                        }
                    }
                    _ = shutdown.cancelled() => {
                        stop_child(slot, &mut child, grace).await;
                        return;
                    }
                }
            }
            Err(e) => error!(slot, error = %e, "Failed to spawn worker"),
        }

        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn stop_child(slot: usize, child: &mut Child, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => info!(slot, "Worker stopped"),
        Err(_) => {
            warn!(slot, "Worker did not exit in time, killing");
            if let Err(e) = child.start_kill() {
                warn!(slot, error = %e, "Failed to kill worker");
            }
            if let Err(e) = child.wait().await {
                warn!(slot, error = %e, "Failed to reap worker");
            }
        }
    }
}
