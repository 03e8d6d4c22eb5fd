//! The dispatch client: a worker process that connects to a
//! `DispatchServer`, reports heartbeats, and executes pipeline/lambda/shard
//! jobs sent to it. Grounded on the teacher's tokio `select!`-based
//! concurrent-loop pattern used for its REPL/ctrlc handling in
//! `kv-cli/src/main.rs`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::record_engine::RecordEngine;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Context handed to a lambda handler: the invocation's declared resource
/// envelope. The handler itself is caller-supplied, since the dispatcher
/// has no knowledge of what a given `function_name` actually runs.
pub struct LambdaContext {
    pub function_name: String,
    pub environment: HashMap<String, String>,
    pub memory_limit: u64,
}

pub type LambdaHandler =
    Arc<dyn Fn(LambdaContext) -> futures_util::future::BoxFuture<'static, CResult<()>> + Send + Sync>;

pub struct DispatchClient {
    worker_id: String,
    workload: AtomicU32,
    engine: Arc<SyncMutex<RecordEngine>>,
    lambda_handler: Option<LambdaHandler>,
}

impl DispatchClient {
    pub fn new(worker_id: String, engine: Arc<SyncMutex<RecordEngine>>) -> Self {
        DispatchClient { worker_id, workload: AtomicU32::new(0), engine, lambda_handler: None }
    }

    pub fn with_lambda_handler(mut self, handler: LambdaHandler) -> Self {
        self.lambda_handler = Some(handler);
        self
    }

    /// Connects to `uri`, registers, then runs the heartbeat and
    /// job-processing loops concurrently until the connection closes.
    pub async fn run(self: Arc<Self>, uri: &str) -> CResult<()> {
        let (ws, _) = connect_async(uri).await.map_err(|e| Error::ProtocolError(e.to_string()))?;
        let (mut write, read) = ws.split();
        write
            .send(Message::Text(self.worker_id.clone().into()))
            .await
            .map_err(|e| Error::ProtocolError(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let heartbeat_tx = out_tx.clone();
        let heartbeat_self = self.clone();
        let heartbeat_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                let workload = heartbeat_self.workload.load(Ordering::SeqCst);
                let frame = serde_json::json!({
                    "worker_id": heartbeat_self.worker_id,
                    "workload": workload,
                });
                if heartbeat_tx.send(Message::Text(frame.to_string().into())).is_err() {
                    break;
                }
            }
        });

        self.process_jobs(read, out_tx).await;

        heartbeat_task.abort();
        writer_task.abort();
        Ok(())
    }

    async fn process_jobs(
        &self,
        mut read: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
        out_tx: mpsc::UnboundedSender<Message>,
    ) {
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
            let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                log::warn!("worker {} received an unparseable frame: {text}", self.worker_id);
                continue;
            };
            self.workload.fetch_add(1, Ordering::SeqCst);
            if let Err(err) = self.handle_frame(frame).await {
                log::error!("worker {} job failed: {err}", self.worker_id);
            }
            self.workload.fetch_sub(1, Ordering::SeqCst);
            let _ = out_tx.send(Message::Text(
                serde_json::json!({"job_completed": "done"}).to_string().into(),
            ));
        }
    }

    async fn handle_frame(&self, frame: Value) -> CResult<()> {
        if let Some(shard_key) = frame.get("shard_key").and_then(Value::as_str) {
            return self.run_shard(shard_key);
        }
        if frame.get("type").and_then(Value::as_str) == Some("lambda") {
            return self.run_lambda(frame).await;
        }
        Err(Error::ProtocolError(format!("unrecognised job frame: {frame}")))
    }

    fn run_shard(&self, shard_key: &str) -> CResult<()> {
        let mut engine = self.engine.lock();
        let raw = engine
            .get(shard_key.as_bytes())?
            .ok_or_else(|| Error::NotFound(shard_key.to_string()))?;
        let _shard: Value = serde_json::from_slice(&raw)?;
        Ok(())
    }

    async fn run_lambda(&self, frame: Value) -> CResult<()> {
        let handler = self
            .lambda_handler
            .clone()
            .ok_or_else(|| Error::ProtocolError("no lambda handler configured".into()))?;
        let environment = frame
            .get("environment")
            .and_then(|v| serde_json::from_value::<HashMap<String, String>>(v.clone()).ok())
            .unwrap_or_default();
        let context = LambdaContext {
            function_name: frame["function_name"].as_str().unwrap_or_default().to_string(),
            environment,
            memory_limit: frame["memory_limit"].as_u64().unwrap_or(0),
        };
        let timeout_seconds = frame["timeout_seconds"].as_u64().unwrap_or(0);
        match tokio::time::timeout(Duration::from_secs(timeout_seconds), handler(context)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "lambda invocation exceeded {timeout_seconds}s"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine() -> Arc<SyncMutex<RecordEngine>> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("client");
        std::mem::forget(dir);
        Arc::new(SyncMutex::new(RecordEngine::new(path).unwrap()))
    }

    #[test]
    fn run_shard_reports_missing_key() {
        let client = DispatchClient::new("w1".to_string(), engine());
        let err = client.run_shard("nope").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn run_lambda_without_handler_errors() {
        let client = DispatchClient::new("w1".to_string(), engine());
        let frame = serde_json::json!({
            "function_name": "f", "environment": {"STAGE": "prod"},
            "timeout_seconds": 1, "memory_limit": 64,
        });
        assert!(client.run_lambda(frame).await.is_err());
    }

    #[tokio::test]
    async fn run_lambda_passes_environment_map_to_handler() {
        let seen: Arc<SyncMutex<Option<HashMap<String, String>>>> = Arc::new(SyncMutex::new(None));
        let seen_in_handler = seen.clone();
        let handler: LambdaHandler = Arc::new(move |ctx: LambdaContext| {
            let seen = seen_in_handler.clone();
            Box::pin(async move {
                *seen.lock() = Some(ctx.environment);
                Ok(())
            })
        });

        let client =
            DispatchClient::new("w1".to_string(), engine()).with_lambda_handler(handler);
        let frame = serde_json::json!({
            "function_name": "f", "environment": {"STAGE": "prod", "REGION": "us-east-1"},
            "timeout_seconds": 1, "memory_limit": 64,
        });
        client.run_lambda(frame).await.unwrap();

        let environment = seen.lock().clone().unwrap();
        assert_eq!(environment.get("STAGE"), Some(&"prod".to_string()));
        assert_eq!(environment.get("REGION"), Some(&"us-east-1".to_string()));
    }
}
