//! A cooperative TTL expiry scheduler: a min-heap of `(expire_at, key)`
//! paired with an authoritative `key -> expire_at` map so that stale heap
//! entries (superseded by a later `set` on the same key) are discarded
//! instead of acted on twice.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

struct TtlState {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
    index: HashMap<String, DateTime<Utc>>,
}

/// Tracks pending expirations and wakes a background task whenever a
/// sooner deadline is scheduled.
pub struct TtlScheduler {
    state: Mutex<TtlState>,
    notify: Notify,
}

impl Default for TtlScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TtlScheduler {
    pub fn new() -> Self {
        TtlScheduler {
            state: Mutex::new(TtlState { heap: BinaryHeap::new(), index: HashMap::new() }),
            notify: Notify::new(),
        }
    }

    /// Schedules (or reschedules) `key` to expire at `expire_at`, waking
    /// the background loop so it can re-plan around a closer deadline.
    pub fn schedule(&self, key: String, expire_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state.index.insert(key.clone(), expire_at);
        state.heap.push(Reverse((expire_at, key)));
        drop(state);
        self.notify.notify_one();
    }

    /// Cancels any pending expiry for `key` (e.g. because it was deleted
    /// or overwritten without a TTL).
    pub fn cancel(&self, key: &str) {
        self.state.lock().unwrap().index.remove(key);
    }

    /// Checks whether `key` has a deadline that has already passed,
    /// without popping the heap. Lets `get` treat an expired key as
    /// missing even before the background loop has run.
    pub fn is_expired(&self, key: &str) -> bool {
        match self.state.lock().unwrap().index.get(key) {
            Some(at) => *at <= Utc::now(),
            None => false,
        }
    }

    fn peek_deadline(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pops the next due expiration if one is both present in the heap and
    /// still authoritative (not superseded by a later `schedule`/`cancel`).
    /// Returns `None` if the heap is empty, leaving the caller to wait on
    /// `notify`.
    fn pop_due(&self, now: DateTime<Utc>) -> Option<Option<String>> {
        let mut state = self.state.lock().unwrap();
        let Reverse((at, key)) = state.heap.peek()?.clone();
        if at > now {
            return None;
        }
        state.heap.pop();
        let still_authoritative = state.index.get(&key) == Some(&at);
        if still_authoritative {
            state.index.remove(&key);
            Some(Some(key))
        } else {
            Some(None)
        }
    }

    /// Runs forever, invoking `on_expire` for every key whose deadline has
    /// passed. Exits when `on_expire` itself decides to via `running`
    /// turning false is left to the caller (the loop only returns on an
    /// explicit break, which it never does internally — callers spawn this
    /// inside a task they can abort).
    pub async fn run<F, Fut>(&self, mut on_expire: F)
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            match self.peek_deadline() {
                None => self.notify.notified().await,
                Some(deadline) => {
                    let now = Utc::now();
                    if deadline > now {
                        let sleep_for = (deadline - now).to_std().unwrap_or(std::time::Duration::ZERO);
                        tokio::select! {
                            _ = tokio::time::sleep(sleep_for) => {},
                            _ = self.notify.notified() => continue,
                        }
                    }
                    if let Some(Some(key)) = self.pop_due(Utc::now()) {
                        on_expire(key).await;
                    }
                }
            }
        }
    }
}
