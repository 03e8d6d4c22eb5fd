//! The dispatcher's live worker registry: one entry per connected worker,
//! updated on registration and heartbeat. Stale workers are never
//! auto-reaped (see the module-level design notes); `stale_workers` only
//! reports them for an operator or future reaper to act on.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::Message;

pub struct WorkerHandle {
    pub workload: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub sender: UnboundedSender<Message>,
}

#[derive(Default)]
pub struct WorkerRegistry {
    workers: DashMap<String, WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker_id: String, sender: UnboundedSender<Message>) {
        let now = Utc::now();
        self.workers.insert(
            worker_id,
            WorkerHandle { workload: 0, last_heartbeat: now, registered_at: now, sender },
        );
    }

    pub fn deregister(&self, worker_id: &str) {
        self.workers.remove(worker_id);
    }

    /// Records a heartbeat's reported workload. The dispatcher trusts
    /// whatever value the worker reports; it performs no validation of
    /// the sequence of values across heartbeats.
    pub fn heartbeat(&self, worker_id: &str, workload: u32) {
        if let Some(mut handle) = self.workers.get_mut(worker_id) {
            handle.workload = workload;
            handle.last_heartbeat = Utc::now();
        }
    }

    /// Live worker ids sorted by ascending workload, the order pipeline
    /// sharding assigns shards in.
    pub fn live_sorted_by_workload(&self) -> Vec<String> {
        let mut workers: Vec<(String, u32)> =
            self.workers.iter().map(|e| (e.key().clone(), e.value().workload)).collect();
        workers.sort_by_key(|(_, workload)| *workload);
        workers.into_iter().map(|(id, _)| id).collect()
    }

    /// The single least-loaded worker, if any are connected.
    pub fn least_loaded(&self) -> Option<String> {
        self.workers.iter().min_by_key(|e| e.value().workload).map(|e| e.key().clone())
    }

    pub fn send_to(&self, worker_id: &str, message: Message) -> bool {
        match self.workers.get(worker_id) {
            Some(handle) => handle.sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Worker ids whose last heartbeat is older than `threshold`.
    pub fn stale_workers(&self, threshold: chrono::Duration) -> Vec<String> {
        let cutoff = Utc::now() - threshold;
        self.workers
            .iter()
            .filter(|e| e.value().last_heartbeat < cutoff)
            .map(|e| e.key().clone())
            .collect()
    }
}
