//! This mod implements MVCC (Multi-Version Concurrency Control), used here to
//! give every key an append-only history of versioned values and let readers
//! take a consistent snapshot of that history as of the moment their
//! transaction began.
//!
//! VERSIONS
//! ========
//! Every write appends a new version to the key's history, tagged with the
//! wall-clock time it was written and the id of the transaction that wrote
//! it. Versions are never mutated or removed once appended.
//!
//! ISOLATION
//! =========
//! A transaction sees the database as it stood at its own start time: for any
//! key, it is handed the newest version whose timestamp does not exceed its
//! start timestamp. Writes from transactions that start (and even commit)
//! later are invisible to it.
//!
//! This is deliberately a **write-your-own** design: there is no conflict
//! detection. Two transactions writing the same key never block or fail
//! each other; the later commit simply wins for everyone who starts reading
//! after it. A caller that needs compare-and-swap semantics must implement
//! it above this layer.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CResult;
use crate::mvcc::Version;

/// A single historical value for a key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Value,
    pub version: Version,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: String,
}

#[derive(Default)]
struct MvccInner {
    store: HashMap<String, Vec<VersionedValue>>,
    transactions: HashMap<String, DateTime<Utc>>,
}

/// An in-memory, append-only, multi-version key/value store.
///
/// `Mvcc` is cheap to clone (it is reference-counted internally via the
/// storage it wraps isn't Arc'd itself, so callers typically wrap the whole
/// struct in `Arc` when sharing it across tasks).
pub struct Mvcc {
    inner: Mutex<MvccInner>,
}

impl Default for Mvcc {
    fn default() -> Self {
        Self::new()
    }
}

impl Mvcc {
    pub fn new() -> Self {
        Mvcc { inner: Mutex::new(MvccInner::default()) }
    }

    /// Begins a new transaction and returns its id. The id embeds the
    /// transaction's start time in nanoseconds, matching the scheme the
    /// original Python implementation used for its own transaction ids.
    pub fn begin(&self) -> CResult<String> {
        let now = Utc::now();
        let tx_id = format!("tx_{}", now.timestamp_nanos_opt().unwrap_or_default());
        let mut inner = self.inner.lock().unwrap();
        inner.transactions.insert(tx_id.clone(), now);
        Ok(tx_id)
    }

    /// Returns the value visible to `tx_id` (or the latest value if
    /// `tx_id` is `None`). An unrecognised `tx_id` is treated as a
    /// transaction that started "now", matching the original's fallback.
    pub fn get(&self, key: &str, tx_id: Option<&str>) -> CResult<Option<Value>> {
        let inner = self.inner.lock().unwrap();
        let history = match inner.store.get(key) {
            Some(h) => h,
            None => return Ok(None),
        };

        let (visible_as_of, reader_tx) = match tx_id {
            None => return Ok(history.last().map(|v| v.value.clone())),
            Some(id) => (inner.transactions.get(id).copied().unwrap_or_else(Utc::now), id),
        };

        // A write always timestamps after its own transaction's start, so a
        // pure timestamp cutoff would hide a transaction's own writes from
        // itself. Its own versions are visible unconditionally; everyone
        // else's versions still go through the snapshot cutoff.
        Ok(history
            .iter()
            .rev()
            .find(|v| v.transaction_id == reader_tx || v.timestamp <= visible_as_of)
            .map(|v| v.value.clone()))
    }

    /// Appends a new version for `key` under `tx_id`. The write is visible
    /// to any `get` issued after this call returns, including calls made
    /// under the same `tx_id` (read-your-writes).
    pub fn put(&self, key: &str, value: Value, tx_id: &str) -> CResult<Version> {
        let mut inner = self.inner.lock().unwrap();
        let history = inner.store.entry(key.to_string()).or_default();
        let version = history.len() as Version + 1;
        history.push(VersionedValue {
            value,
            version,
            timestamp: Utc::now(),
            transaction_id: tx_id.to_string(),
        });
        Ok(version)
    }

    /// Ends a transaction. An unknown `tx_id` is logged and treated as a
    /// no-op rather than an error, since by the time a caller commits the
    /// transaction may already have been forgotten (e.g. after a crash
    /// recovery that never restores in-memory transaction state).
    pub fn commit(&self, tx_id: &str) -> CResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.transactions.remove(tx_id).is_none() {
            log::warn!("commit of unknown transaction {tx_id}");
        }
        Ok(())
    }

    /// Returns the full version history of a key, oldest first. Used by the
    /// search indexer to rebuild documents and by tests asserting version
    /// monotonicity.
    pub fn history(&self, key: &str) -> Vec<VersionedValue> {
        self.inner.lock().unwrap().store.get(key).cloned().unwrap_or_default()
    }

    /// Returns every key that currently has at least one version.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().store.keys().cloned().collect()
    }
}
