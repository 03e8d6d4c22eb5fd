//! The dispatch server: accepts worker connections over WebSocket,
//! maintains the live registry, and shards pipeline/lambda jobs out to
//! workers. Grounded on the teacher's `tokio::net::TcpListener`
//! accept-loop shape (see `kv-cli/src/server`), generalised from a
//! line-oriented REPL protocol to a JSON-over-WebSocket one.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::record_engine::RecordEngine;

use super::registry::WorkerRegistry;

#[derive(Debug, Serialize, Deserialize)]
struct PipelineJob {
    pipeline_id: String,
    jobs: Vec<String>,
    data: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LambdaJob {
    function_name: String,
    #[serde(default)]
    environment: HashMap<String, String>,
    timeout_seconds: u64,
    memory_limit: u64,
}

#[derive(Debug, Serialize)]
struct ShardAssignment {
    shard_data: Vec<Value>,
    assigned_to: String,
}

pub struct DispatchServer {
    registry: Arc<WorkerRegistry>,
    engine: Arc<SyncMutex<RecordEngine>>,
}

impl DispatchServer {
    pub fn new(engine: Arc<SyncMutex<RecordEngine>>) -> Self {
        DispatchServer { registry: Arc::new(WorkerRegistry::new()), engine }
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        self.registry.clone()
    }

    /// Binds `addr` and accepts connections forever, spawning one task per
    /// worker. Returns only on a listener error.
    pub async fn serve(&self, addr: &str) -> CResult<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("dispatch server listening on {addr}");
        loop {
            let (stream, peer) = listener.accept().await?;
            let registry = self.registry.clone();
            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, registry, engine).await {
                    log::error!("connection from {peer} ended: {err}");
                }
            });
        }
    }

    /// Shards `data` across every live worker (teacher-grounded truncating
    /// division: `shard_size = data.len() / n`, the last shard absorbs the
    /// remainder) and persists + sends each assignment.
    pub fn dispatch_pipeline(&self, pipeline_id: &str, data: Vec<Value>) -> CResult<()> {
        let workers = self.registry.live_sorted_by_workload();
        let n = workers.len();
        if n == 0 {
            return Err(Error::ProtocolError("no live workers to dispatch pipeline to".into()));
        }
        let shard_size = data.len() / n;
        let mut offset = 0;
        for (i, worker_id) in workers.iter().enumerate() {
            let end = if i == n - 1 { data.len() } else { offset + shard_size };
            let shard_data = data[offset..end].to_vec();
            offset = end;

            let target = &workers[i % n];
            let shard_key = format!("shard_{pipeline_id}_{i}");
            let assignment = ShardAssignment { shard_data, assigned_to: target.clone() };
            let payload = serde_json::to_vec(&assignment)?;
            self.engine.lock().set(shard_key.as_bytes(), payload)?;

            let frame = serde_json::json!({"job_id": pipeline_id, "shard_key": shard_key});
            self.registry.send_to(worker_id, Message::Text(frame.to_string().into()));
        }
        Ok(())
    }

    /// Dispatches a lambda invocation to the single least-loaded worker.
    pub fn dispatch_lambda(&self, job: LambdaJob) -> CResult<()> {
        let target = self
            .registry
            .least_loaded()
            .ok_or_else(|| Error::ProtocolError("no live workers to dispatch lambda to".into()))?;
        let frame = serde_json::json!({
            "type": "lambda",
            "function_name": job.function_name,
            "environment": job.environment,
            "timeout_seconds": job.timeout_seconds,
            "memory_limit": job.memory_limit,
        });
        self.registry.send_to(&target, Message::Text(frame.to_string().into()));
        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    registry: Arc<WorkerRegistry>,
    engine: Arc<SyncMutex<RecordEngine>>,
) -> CResult<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| Error::ProtocolError(e.to_string()))?;
    let (mut write, mut read) = ws.split();

    let worker_id = match read.next().await {
        Some(Ok(Message::Text(id))) => id.to_string(),
        _ => return Err(Error::ProtocolError("worker did not send an id frame".into())),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.register(worker_id.clone(), tx);
    engine.lock().set(worker_id.as_bytes(), b"{\"workload\":0}".to_vec())?;
    log::info!("worker {worker_id} registered");

    let outbound = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(_) => break,
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(v) if v.get("workload").is_some() => {
                let workload = v["workload"].as_u64().unwrap_or(0) as u32;
                registry.heartbeat(&worker_id, workload);
                let record = serde_json::json!({"workload": workload}).to_string();
                let _ = engine.lock().set(worker_id.as_bytes(), record.into_bytes());
            }
            Ok(v) if v.get("job_completed").is_some() => {
                log::info!("worker {worker_id} completed job {:?}", v["job_completed"]);
            }
            _ => {
                log::warn!("worker {worker_id} sent an unrecognised frame: {text}");
            }
        }
    }

    registry.deregister(&worker_id);
    outbound.abort();
    log::info!("worker {worker_id} disconnected");
    Ok(())
}
