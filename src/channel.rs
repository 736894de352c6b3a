//! JSON-RPC 2.0 channel over one duplex byte stream.
//!
//! Owns request-id allocation and request/response correlation. Responses
//! may arrive in any order; correlation is strictly by id, never by
//! issuance order. Messages that do not match a pending request are handed
//! to registered observers.

use crate::codec::{frame, FrameDecoder, Framing};
use crate::logging::LogSink;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};

/// Failure of a single RPC exchange.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The server answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    /// The underlying stream errored or closed before a response arrived.
    #[error("RPC stream closed: {0}")]
    StreamClosed(String),
}

/// Callback invoked for messages that are not responses to pending requests.
pub type MessageObserver = Box<dyn Fn(&Value) + Send + Sync>;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;
type ObserverList = Arc<std::sync::Mutex<Vec<MessageObserver>>>;

/// JSON-RPC client endpoint bound to a reader/writer pair.
pub struct RpcChannel {
    framing: Framing,
    next_id: AtomicU64,
    pending: PendingMap,
    writer_tx: mpsc::Sender<Vec<u8>>,
    observers: ObserverList,
    sink: Option<LogSink>,
}

impl RpcChannel {
    /// Bind a channel to a byte stream pair and spawn its I/O tasks.
    ///
    /// The reader task lives until the stream closes or errors; at that
    /// point every pending request is rejected with
    /// [`RpcError::StreamClosed`].
    pub fn new<R, W>(reader: R, writer: W, framing: Framing, sink: Option<LogSink>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let observers: ObserverList = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(32);

        // Writer task
        let mut writer = writer;
        tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task
        let pending_clone = Arc::clone(&pending);
        let observers_clone = Arc::clone(&observers);
        let sink_clone = sink.clone();
        let mut reader = reader;
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut chunk = [0u8; 8192];
            let reason = loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break "stream closed".to_string(),
                    Ok(n) => {
                        decoder.extend(&chunk[..n]);
                        for msg in decoder.drain() {
                            dispatch(&pending_clone, &observers_clone, &sink_clone, msg).await;
                        }
                    }
                    Err(e) => break format!("stream error: {e}"),
                }
            };
            reject_all(&pending_clone, &reason).await;
        });

        Self {
            framing,
            next_id: AtomicU64::new(1),
            pending,
            writer_tx,
            observers,
            sink,
        }
    }

    /// Send a request and wait for its correlated response.
    ///
    /// Resolves with the response's `result`, or fails with
    /// [`RpcError::Rpc`] when the response carries an error object. No
    /// timeout is enforced here; that is the caller's policy.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Some(sink) = &self.sink {
            sink(&format!("--> {json}"));
        }
        if self
            .writer_tx
            .send(frame(&json, self.framing))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::StreamClosed("write side closed".to_string()).into());
        }

        match rx.await {
            Ok(outcome) => outcome.map_err(Into::into),
            Err(_) => Err(RpcError::StreamClosed("channel dropped".to_string()).into()),
        }
    }

    /// Fire-and-forget notification; no acknowledgement is awaited.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notif)?;
        if let Some(sink) = &self.sink {
            sink(&format!("--> {json}"));
        }
        self.writer_tx
            .send(frame(&json, self.framing))
            .await
            .context("write side closed")?;
        Ok(())
    }

    /// Register an observer for unsolicited messages.
    pub fn observe(&self, observer: MessageObserver) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(observer);
        }
    }

    /// Drop every registered observer.
    pub fn clear_observers(&self) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.clear();
        }
    }
}

async fn dispatch(
    pending: &PendingMap,
    observers: &ObserverList,
    sink: &Option<LogSink>,
    msg: Value,
) {
    if let Some(sink) = sink {
        sink(&format!("<-- {msg}"));
    }

    if msg.get("jsonrpc").and_then(Value::as_str) == Some("2.0") {
        if let Some(id) = msg.get("id").and_then(Value::as_u64) {
            let tx = pending.lock().await.remove(&id);
            if let Some(tx) = tx {
                let outcome = match serde_json::from_value::<JsonRpcResponse>(msg) {
                    Ok(JsonRpcResponse {
                        error: Some(err), ..
                    }) => Err(RpcError::Rpc {
                        code: err.code,
                        message: err.message,
                        data: err.data,
                    }),
                    Ok(response) => Ok(response.result.unwrap_or(Value::Null)),
                    Err(_) => Ok(Value::Null),
                };
                let _ = tx.send(outcome);
                return;
            }
            // Recognized shape but no pending entry: unsolicited.
        }
    }

    if let Ok(observers) = observers.lock() {
        for observer in observers.iter() {
            observer(&msg);
        }
    }
}

async fn reject_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(RpcError::StreamClosed(reason.to_string())));
    }
}
