//! The user-facing facade over the MVCC store, value codec, search index,
//! and on-disk engine, grounded on the original Python `KatamariORM`: TTL
//! expiry, an LRU read cache, per-key async locks, a transaction log, and
//! a background indexing queue.

pub mod ttl;
pub mod txlog;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::codec::{self, CodecOptions, ProcessedValue};
use crate::error::CResult;
use crate::mvcc::Mvcc;
use crate::search::{IndexDocument, SchemaFieldKind, SearchIndex, SearchResult};
use crate::storage::engine::Engine;
use crate::storage::record_engine::RecordEngine;

use self::ttl::TtlScheduler;
use self::txlog::{TransactionLog, TxLogEntry};

pub struct OrmConfig {
    pub cache_capacity: usize,
    /// When set, writes are additionally persisted through a
    /// `RecordEngine` rooted at this path, and reads fall back to it on a
    /// cold in-memory store (e.g. right after process restart).
    pub persistence_path: Option<PathBuf>,
    pub tx_log_path: PathBuf,
    pub codec: CodecOptions,
}

enum IndexUpdate {
    Upsert(IndexDocument),
    Delete(String),
}

pub struct Orm {
    mvcc: Arc<Mvcc>,
    search_index: Arc<SearchIndex>,
    engine: Option<Arc<SyncMutex<RecordEngine>>>,
    cache: AsyncMutex<LruCache<String, Value>>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    ttl: Arc<TtlScheduler>,
    codec: CodecOptions,
    tx_log: Arc<TransactionLog>,
    index_tx: mpsc::UnboundedSender<IndexUpdate>,
}

impl Orm {
    /// Builds the facade and spawns its two background tasks (TTL expiry,
    /// index batch drain). Both tasks run for the lifetime of the
    /// returned `Arc` and are never explicitly joined; they exit only when
    /// every other handle to the `Orm` (and hence its internal `Arc`
    /// clones) has been dropped and the process is tearing down.
    pub fn spawn(config: OrmConfig, schema: HashMap<String, SchemaFieldKind>) -> CResult<Arc<Self>> {
        let search_index = Arc::new(SearchIndex::new(schema, None)?);
        let engine = match &config.persistence_path {
            Some(p) => Some(Arc::new(SyncMutex::new(RecordEngine::new(p.clone())?))),
            None => None,
        };
        let (index_tx, index_rx) = mpsc::unbounded_channel();
        let capacity = NonZeroUsize::new(config.cache_capacity.max(1)).unwrap();

        let orm = Arc::new(Orm {
            mvcc: Arc::new(Mvcc::new()),
            search_index,
            engine,
            cache: AsyncMutex::new(LruCache::new(capacity)),
            locks: DashMap::new(),
            ttl: Arc::new(TtlScheduler::new()),
            codec: config.codec,
            tx_log: Arc::new(TransactionLog::new(config.tx_log_path)?),
            index_tx,
        });

        let ttl_owner = orm.clone();
        tokio::spawn(async move { ttl_owner.run_ttl_loop().await });

        let index_owner = orm.clone();
        tokio::spawn(async move { index_owner.run_index_loop(index_rx).await });

        Ok(orm)
    }

    async fn run_ttl_loop(self: Arc<Self>) {
        let ttl = self.ttl.clone();
        ttl.run(|key| {
            let me = self.clone();
            async move {
                if let Err(err) = me.delete(&key).await {
                    log::error!("ttl expiry delete failed for {key}: {err}");
                }
            }
        })
        .await;
    }

    async fn run_index_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<IndexUpdate>) {
        const BATCH_LIMIT: usize = 256;
        let mut batch = Vec::new();
        while let Some(update) = rx.recv().await {
            batch.push(update);
            while batch.len() < BATCH_LIMIT {
                match rx.try_recv() {
                    Ok(update) => batch.push(update),
                    Err(_) => break,
                }
            }
            for update in batch.drain(..) {
                let result = match update {
                    IndexUpdate::Upsert(doc) => self.search_index.upsert(doc),
                    IndexUpdate::Delete(id) => self.search_index.delete(&id),
                };
                if let Err(err) = result {
                    log::error!("index update failed: {err}");
                }
            }
            if let Err(err) = self.search_index.flush() {
                log::error!("index flush failed: {err}");
            }
        }
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.locks.entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    async fn merge_if_append(&self, key: &str, value: Value, append: bool) -> CResult<Value> {
        if !append {
            return Ok(value);
        }
        match self.mvcc.get(key, None)? {
            Some(Value::Array(mut items)) => {
                items.push(value);
                Ok(Value::Array(items))
            }
            _ => Ok(value),
        }
    }

    /// Writes `value` under `key`. With `append` set, a prior array value
    /// has `value` pushed onto it rather than being replaced. With `ttl`
    /// set, the key is scheduled for expiry after the given duration.
    /// Returns the new version number.
    ///
    /// If any step after the transaction log entry is written fails, the
    /// logged key is rolled back (best-effort delete) before the error is
    /// returned, so a crash or error mid-write never leaves a dangling
    /// transaction-log entry with no corresponding effect.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        append: bool,
        ttl: Option<ChronoDuration>,
    ) -> CResult<u64> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let tx_id = format!("tx_{}", Uuid::new_v4());
        self.tx_log.start_tx(&TxLogEntry {
            transaction_id: tx_id,
            key: key.to_string(),
            value: value.clone(),
            ttl_seconds: ttl.map(|d| d.num_seconds()),
        })?;

        match self.write_versioned(key, value, append, ttl).await {
            Ok(version) => {
                self.tx_log.commit_tx()?;
                Ok(version)
            }
            Err(err) => {
                let pending = self.tx_log.rollback_tx()?;
                for entry in pending {
                    // `key`'s per-key lock is already held by this call; for
                    // that key call the lock-free inner delete directly, to
                    // avoid deadlocking against our own guard. Any other
                    // entry (left over from a prior crash that never rolled
                    // back) takes its own lock via the public `delete`.
                    let rollback_result = if entry.key == key {
                        self.delete_locked(&entry.key).await
                    } else {
                        self.delete(&entry.key).await
                    };
                    if let Err(rollback_err) = rollback_result {
                        log::error!(
                            "rollback delete for {} failed: {rollback_err}",
                            entry.key
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn write_versioned(
        &self,
        key: &str,
        value: Value,
        append: bool,
        ttl: Option<ChronoDuration>,
    ) -> CResult<u64> {
        let value = normalize_date_fields(value);
        let value = self.merge_if_append(key, value, append).await?;

        let begin = self.mvcc.begin()?;
        let version = self.mvcc.put(key, value.clone(), &begin)?;
        self.mvcc.commit(&begin)?;

        if let Some(engine) = &self.engine {
            let processed = codec::process(&value, self.codec)?;
            let record = serde_json::to_vec(&processed)?;
            engine.lock().set(key.as_bytes(), record)?;
        }

        {
            let mut cache = self.cache.lock().await;
            cache.put(key.to_string(), value.clone());
        }

        match ttl {
            Some(d) => self.ttl.schedule(key.to_string(), Utc::now() + d),
            None => self.ttl.cancel(key),
        }

        let _ = self.index_tx.send(IndexUpdate::Upsert(IndexDocument {
            fields: index_fields(key, &value),
            version,
            timestamp: Utc::now(),
        }));

        Ok(version)
    }

    /// Reads the current value for `key`, consulting TTL, then the LRU
    /// cache, then the in-memory MVCC store, then (if persistence is
    /// configured) the on-disk engine as a cold-start fallback.
    pub async fn get(&self, key: &str) -> CResult<Option<Value>> {
        if self.ttl.is_expired(key) {
            self.delete(key).await?;
            return Ok(None);
        }

        {
            let mut cache = self.cache.lock().await;
            if let Some(value) = cache.get(key) {
                return Ok(Some(value.clone()));
            }
        }

        if let Some(value) = self.mvcc.get(key, None)? {
            if value.is_null() {
                return Ok(None);
            }
            self.cache.lock().await.put(key.to_string(), value.clone());
            return Ok(Some(value));
        }

        if let Some(engine) = &self.engine {
            let raw = engine.lock().get(key.as_bytes())?;
            if let Some(raw) = raw {
                let processed: ProcessedValue = serde_json::from_slice(&raw)?;
                let value = codec::unprocess(&processed, self.codec.algo)?;

                let begin = self.mvcc.begin()?;
                self.mvcc.put(key, value.clone(), &begin)?;
                self.mvcc.commit(&begin)?;

                self.cache.lock().await.put(key.to_string(), value.clone());
                return Ok(Some(value));
            }
        }

        Ok(None)
    }

    /// Deletes `key`: writes a tombstone version, drops it from the cache
    /// and TTL index, removes it from the on-disk engine, and enqueues an
    /// index deletion.
    pub async fn delete(&self, key: &str) -> CResult<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.delete_locked(key).await
    }

    /// The body of `delete`, for callers that already hold `key`'s per-key
    /// lock (namely `set`'s rollback path, which must not re-acquire a lock
    /// it is already holding).
    async fn delete_locked(&self, key: &str) -> CResult<()> {
        let begin = self.mvcc.begin()?;
        self.mvcc.put(key, Value::Null, &begin)?;
        self.mvcc.commit(&begin)?;

        self.cache.lock().await.pop(key);
        self.ttl.cancel(key);

        if let Some(engine) = &self.engine {
            engine.lock().delete(key.as_bytes())?;
        }

        let _ = self.index_tx.send(IndexUpdate::Delete(key.to_string()));
        Ok(())
    }

    pub fn search(
        &self,
        query: &str,
        tx_start_time: Option<DateTime<Utc>>,
        filters: &HashMap<String, Value>,
        sort_by: Option<&str>,
        cluster_by: Option<&str>,
    ) -> CResult<Vec<SearchResult>> {
        self.search_index.search(query, tx_start_time, filters, sort_by, cluster_by)
    }

    /// Blocks until every queued index update up to this point has been
    /// applied and committed, for callers needing read-your-writes
    /// against search (see the module-level design notes on eventual
    /// index consistency).
    pub fn flush_index(&self) -> CResult<()> {
        self.search_index.flush()
    }
}

/// Parses `created_at` and any other RFC 3339-looking string field of a
/// top-level JSON object into a normalized `DateTime<Utc>` string, mirroring
/// a `dateutil.parser.parse` pass over date-like fields before the value is
/// otherwise processed. Non-object values and fields that don't parse are
/// left untouched.
fn normalize_date_fields(value: Value) -> Value {
    let Value::Object(mut map) = value else { return value };
    for (key, v) in map.iter_mut() {
        let Value::String(s) = v else { continue };
        if key != "created_at" && DateTime::parse_from_rfc3339(s).is_err() {
            continue;
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            *v = Value::String(dt.with_timezone(&Utc).to_rfc3339());
        }
    }
    Value::Object(map)
}

fn index_fields(key: &str, value: &Value) -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    fields.insert("id".to_string(), Value::String(key.to_string()));
    if let Value::Object(map) = value {
        for (k, v) in map {
            fields.insert(k.clone(), v.clone());
        }
    }
    fields
}
