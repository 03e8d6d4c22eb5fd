//! Crate-level integration tests exercising the storage/coordination core
//! end to end: WAL replay, MVCC snapshot isolation, TTL expiry, search
//! round-trips through the ORM facade, dispatcher sharding, and interval
//! parsing.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use serde_json::json;

use katamari::dispatcher::{interval::parse_interval, DispatchServer, WorkerRegistry};
use katamari::mvcc::Mvcc;
use katamari::orm::{Orm, OrmConfig};
use katamari::search::SchemaFieldKind;
use katamari::storage::engine::Engine;
use katamari::storage::record_engine::RecordEngine;

#[test]
fn wal_replay_recovers_state_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("katamari");

    let mut engine = RecordEngine::new(base.clone()).unwrap();
    engine.set(b"a", vec![1]).unwrap();
    engine.set(b"b", vec![2]).unwrap();
    engine.delete(b"a").unwrap();
    drop(engine);

    let mut reopened = RecordEngine::new(base).unwrap();
    assert_eq!(reopened.get(b"a").unwrap(), None);
    assert_eq!(reopened.get(b"b").unwrap(), Some(vec![2]));
}

#[test]
fn mvcc_transactions_see_a_consistent_snapshot() {
    let mvcc = Mvcc::new();

    let t1 = mvcc.begin().unwrap();
    mvcc.put("k", json!("v1"), &t1).unwrap();
    mvcc.commit(&t1).unwrap();

    let reader = mvcc.begin().unwrap();
    let t2 = mvcc.begin().unwrap();
    mvcc.put("k", json!("v2"), &t2).unwrap();
    mvcc.commit(&t2).unwrap();

    // The reader's snapshot predates t2's commit, so it still sees v1.
    assert_eq!(mvcc.get("k", Some(&reader)).unwrap(), Some(json!("v1")));
    assert_eq!(mvcc.get("k", None).unwrap(), Some(json!("v2")));
}

fn schema() -> HashMap<String, SchemaFieldKind> {
    let mut schema = HashMap::new();
    schema.insert("id".to_string(), SchemaFieldKind::Id);
    schema.insert("name".to_string(), SchemaFieldKind::Text);
    schema
}

fn orm_config(dir: &tempfile::TempDir) -> OrmConfig {
    OrmConfig {
        cache_capacity: 16,
        persistence_path: Some(dir.path().join("db")),
        tx_log_path: dir.path().join("tx.log"),
        codec: Default::default(),
    }
}

#[tokio::test]
async fn ttl_expiry_removes_key_through_the_orm_facade() {
    let dir = tempfile::tempdir().unwrap();
    let orm = Orm::spawn(orm_config(&dir), schema()).unwrap();

    orm.set("k1", json!("v"), false, Some(ChronoDuration::milliseconds(20))).await.unwrap();
    assert_eq!(orm.get("k1").await.unwrap(), Some(json!("v")));

    tokio::time::sleep(StdDuration::from_millis(80)).await;
    assert_eq!(orm.get("k1").await.unwrap(), None);
}

#[tokio::test]
async fn search_finds_writes_made_through_the_orm_facade() {
    let dir = tempfile::tempdir().unwrap();
    let orm = Orm::spawn(orm_config(&dir), schema()).unwrap();

    orm.set("k1", json!({"name": "searchable gadget"}), false, None).await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    orm.flush_index().unwrap();

    let results = orm.search("gadget", None, &HashMap::new(), None, None).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "k1");
}

#[test]
fn dispatcher_shards_a_pipeline_and_persists_assignments_through_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let engine = std::sync::Arc::new(parking_lot::Mutex::new(
        RecordEngine::new(dir.path().join("dispatch")).unwrap(),
    ));
    let server = DispatchServer::new(engine.clone());

    let registry = server.registry();
    for id in ["w1", "w2"] {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel::<tokio_tungstenite::tungstenite::Message>();
        registry.register(id.to_string(), tx);
    }
    assert_eq!(registry.len(), 2);

    let data: Vec<serde_json::Value> = (0..5).map(serde_json::Value::from).collect();
    server.dispatch_pipeline("p1", data).unwrap();

    let mut locked = engine.lock();
    assert!(locked.get(b"shard_p1_0").unwrap().is_some());
    assert!(locked.get(b"shard_p1_1").unwrap().is_some());
}

#[test]
fn interval_parsing_combines_units_into_seconds() {
    assert_eq!(parse_interval("2w3d5h20m30s"), StdDuration::from_secs(1_488_030));
    assert_eq!(parse_interval(""), StdDuration::ZERO);
}
