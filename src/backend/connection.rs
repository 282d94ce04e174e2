//! JSON-RPC connection to one server process
//!
//! A writer task owns the server's stdin and a reader task owns its stdout.
//! Responses are matched to pending requests by id; requests and
//! notifications the server sends are handed to an [`IncomingHandler`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_lsp::jsonrpc::{self, ErrorCode};
use tracing::{debug, trace, warn};

use crate::backend::BackendError;
use crate::backend::codec::{MessageReader, MessageWriter};

const WRITER_CHANNEL_CAPACITY: usize = 64;

type Pending = Arc<Mutex<PendingRequests>>;

/// Requests awaiting a response. Once closed, no new request is accepted.
#[derive(Default)]
struct PendingRequests {
    closed: bool,
    senders: HashMap<i64, oneshot::Sender<Value>>,
}

impl PendingRequests {
    fn close(&mut self) {
        self.closed = true;
        self.senders.clear();
    }
}

/// Receives traffic the server initiates.
#[async_trait]
pub trait IncomingHandler: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> jsonrpc::Result<Value>;

    async fn notification(&self, method: &str, params: Value);
}

enum Incoming {
    Response { id: i64, body: Value },
    Request { id: Value, method: String, params: Value },
    Notification { method: String, params: Value },
}

fn classify(message: Value) -> Option<Incoming> {
    let method = message.get("method").and_then(Value::as_str).map(String::from);
    let id = message.get("id").cloned();
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    match (id, method) {
        (Some(id), Some(method)) => Some(Incoming::Request { id, method, params }),
        (None, Some(method)) => Some(Incoming::Notification { method, params }),
        (Some(id), None) => Some(Incoming::Response {
            id: id.as_i64()?,
            body: message,
        }),
        (None, None) => None,
    }
}

pub struct Connection {
    writer: mpsc::Sender<Value>,
    next_id: AtomicI64,
    pending: Pending,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Connection {
    pub fn spawn<R, W>(reader: R, writer: W, handler: Arc<dyn IncomingHandler>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Value>(WRITER_CHANNEL_CAPACITY);
        let writer_task = tokio::spawn(async move {
            let mut writer = MessageWriter::new(writer);
            while let Some(message) = rx.recv().await {
                if let Err(e) = writer.write(&message).await {
                    warn!("Failed to write to server: {}", e);
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(Mutex::new(PendingRequests::default()));
        let reader_task = tokio::spawn(read_loop(
            MessageReader::new(reader),
            pending.clone(),
            tx.clone(),
            handler,
        ));

        Self {
            writer: tx,
            next_id: AtomicI64::new(1),
            pending,
            reader_task,
            writer_task,
        }
    }

    /// Sends a request and waits for its response.
    ///
    /// If `token` fires first, `$/cancelRequest` is forwarded and the call
    /// resolves with `RequestCancelled`.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        token: &CancellationToken,
    ) -> jsonrpc::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(closed());
            }
            pending.senders.insert(id, tx);
        }

        let message = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        if self.writer.send(message).await.is_err() {
            lock(&self.pending).senders.remove(&id);
            return Err(closed());
        }

        tokio::select! {
            response = rx => match response {
                Ok(body) => into_result(body),
                Err(_) => Err(closed()),
            },
            _ = token.cancelled() => {
                lock(&self.pending).senders.remove(&id);
                trace!("Cancelling request {} ({})", id, method);
                let _ = self
                    .writer
                    .send(json!({"jsonrpc": "2.0", "method": "$/cancelRequest", "params": {"id": id}}))
                    .await;
                Err(jsonrpc::Error {
                    code: ErrorCode::RequestCancelled,
                    message: format!("{method} was cancelled").into(),
                    data: None,
                })
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), BackendError> {
        self.writer
            .send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await
            .map_err(|_| BackendError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.reader_task.is_finished() || self.writer.is_closed()
    }

    /// Stops both I/O tasks and fails every outstanding request.
    pub fn close(&self) {
        self.reader_task.abort();
        self.writer_task.abort();
        lock(&self.pending).close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<R>(
    mut reader: MessageReader<R>,
    pending: Pending,
    writer: mpsc::Sender<Value>,
    handler: Arc<dyn IncomingHandler>,
) where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let message = match reader.read().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Server closed its output");
                break;
            }
            Err(e) => {
                warn!("Failed to read from server: {}", e);
                break;
            }
        };

        match classify(message) {
            Some(Incoming::Response { id, body }) => {
                if let Some(tx) = lock(&pending).senders.remove(&id) {
                    let _ = tx.send(body);
                }
            }
            Some(Incoming::Request { id, method, params }) => {
                // answered off the read loop so a slow host never stalls responses
                let handler = handler.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    let reply = match handler.request(&method, params).await {
                        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                        Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
                    };
                    let _ = writer.send(reply).await;
                });
            }
            Some(Incoming::Notification { method, params }) => {
                handler.notification(&method, params).await;
            }
            None => trace!("Ignoring malformed message from server"),
        }
    }

    lock(&pending).close();
}

fn into_result(body: Value) -> jsonrpc::Result<Value> {
    match body.get("error") {
        Some(error) => Err(serde_json::from_value(error.clone())
            .unwrap_or_else(|_| jsonrpc::Error::internal_error())),
        None => Ok(body.get("result").cloned().unwrap_or(Value::Null)),
    }
}

fn closed() -> jsonrpc::Error {
    jsonrpc::Error {
        code: ErrorCode::InternalError,
        message: "Connection to server closed".into(),
        data: None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
