//! Fan-out of task transitions to connected event-stream clients.

use crate::config::NotifierConfig;
use dashmap::DashMap;
use genq_core::{SafeTask, TaskId};
use genq_persistence::TaskListener;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Task(TaskId),
    All,
}

impl Subscription {
    fn wants(&self, task_id: &str) -> bool {
        match self {
            Subscription::Task(id) => id == task_id,
            Subscription::All => true,
        }
    }
}

/// One message to a client, independent of the wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Connected { client_id: String },
    TaskUpdate(SafeTask),
    Heartbeat,
}

struct Client {
    subscription: Subscription,
    sender: mpsc::Sender<Frame>,
    last_delivery: Instant,
}

/// A registered client's end of the channel.
pub struct ClientHandle {
    pub client_id: String,
    pub frames: mpsc::Receiver<Frame>,
}

pub struct Notifier {
    clients: DashMap<String, Client>,
    config: NotifierConfig,
}

impl Notifier {
    pub fn new(config: NotifierConfig) -> Self {
        Notifier {
            clients: DashMap::new(),
            config,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Register a client. The first frame it receives is `Connected`.
    pub fn subscribe(&self, subscription: Subscription) -> ClientHandle {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (sender, frames) = mpsc::channel(self.config.client_buffer.max(1));
        // cannot fail: the channel is empty and has capacity
        let _ = sender.try_send(Frame::Connected {
            client_id: client_id.clone(),
        });

        info!(client_id = %client_id, subscription = ?subscription, "Event client connected");
        self.clients.insert(
            client_id.clone(),
            Client {
                subscription,
                sender,
                last_delivery: Instant::now(),
            },
        );
        ClientHandle { client_id, frames }
    }

    /// Deliver a frame to one client. Returns false if it is gone or full.
    pub fn send_to(&self, client_id: &str, frame: Frame) -> bool {
        match self.clients.get_mut(client_id) {
            Some(mut client) => deliver(client_id, &mut client, frame),
            None => false,
        }
    }

    /// Deliver `task` to its subscribers and every global subscriber.
    pub fn notify_task_update(&self, task: &SafeTask) {
        let mut delivered = 0usize;
        for mut entry in self.clients.iter_mut() {
            if !entry.subscription.wants(&task.task_id) {
                continue;
            }
            let (client_id, client) = entry.pair_mut();
            if deliver(client_id, client, Frame::TaskUpdate(task.clone())) {
                delivered += 1;
            }
        }
        debug!(task_id = %task.task_id, status = %task.status, delivered, "Task update broadcast");
    }

    pub fn disconnect_client(&self, client_id: &str) {
        if self.clients.remove(client_id).is_some() {
            info!(client_id, "Event client disconnected");
        }
    }

    pub fn heartbeat(&self) {
        for mut entry in self.clients.iter_mut() {
            let (client_id, client) = entry.pair_mut();
            deliver(client_id, client, Frame::Heartbeat);
        }
    }

    /// Evict clients whose channel is closed or that have not accepted a
    /// frame within the client timeout. Returns how many were evicted.
    pub fn sweep_stale(&self) -> usize {
        let timeout = self.config.client_timeout();
        let now = Instant::now();
        let before = self.clients.len();
        self.clients.retain(|client_id, client| {
            let stale = client.sender.is_closed()
                || now.duration_since(client.last_delivery) > timeout;
            if stale {
                warn!(client_id = %client_id, "Evicting stale event client");
            }
            !stale
        });
        before - self.clients.len()
    }

    /// Heartbeat and sweep on the configured interval until `shutdown`.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(notifier.config.heartbeat_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        notifier.heartbeat();
                        notifier.sweep_stale();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            // dropping the senders ends every open stream
            notifier.clients.clear();
        })
    }
}

fn deliver(client_id: &str, client: &mut Client, frame: Frame) -> bool {
    match client.sender.try_send(frame) {
        Ok(()) => {
            client.last_delivery = Instant::now();
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(client_id, "Event client buffer full, dropping frame");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

impl TaskListener for Notifier {
    fn on_transition(&self, task: &SafeTask) {
        self.notify_task_update(task);
    }
}
