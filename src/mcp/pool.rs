// SPDX-License-Identifier: MIT
//! C8 — MCP Connection Pool.
//!
//! One multiplexed WebSocket connection per endpoint URL, shared across
//! callers. Synthesized from two teacher patterns: the WebSocket
//! handshake/framing idiom of the daemon's `ipc` server loop (there, for
//! inbound connections; here, adapted to dial out) and the JSON-RPC
//! `initialize` handshake shape of its stdio MCP client — recombined into a
//! WebSocket *client* multiplexer with request correlation via a pending
//! map, per source spec §4.8.

use crate::error::{ErrorKind, OrchestratorError};
use crate::mcp::protocol::{
    Capabilities, InboundFrame, OutboundNotification, Request, NOTIFICATION_PROGRESS,
    NOTIFICATION_RESOURCE_UPDATE, NOTIFICATION_TOOLS_LIST_CHANGED, NOTIFICATION_TOOL_UPDATE,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct PendingMap {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<Result<Value, OrchestratorError>>>>,
}

impl PendingMap {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// One live connection to an MCP server endpoint.
pub struct Connection {
    pub url: String,
    pub name: String,
    sink: Mutex<WsSink>,
    pending: Arc<PendingMap>,
    capabilities: RwLock<Capabilities>,
    alive: Arc<std::sync::atomic::AtomicBool>,
}

impl Connection {
    /// Send `method`/`params`, wait up to [`REQUEST_TIMEOUT`] for the
    /// matching response.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, OrchestratorError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(OrchestratorError::new(ErrorKind::ProviderUnreachable, "connection_closed"));
        }
        let id = self.pending.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.waiters.lock().await.insert(id, tx);

        let request = Request::new(id, method, params);
        let frame = serde_json::to_string(&request).map_err(|e| OrchestratorError::new(ErrorKind::InternalError, e.to_string()))?;
        if self.sink.lock().await.send(Message::Text(frame.into())).await.is_err() {
            self.pending.waiters.lock().await.remove(&id);
            return Err(OrchestratorError::new(ErrorKind::ProviderUnreachable, "connection_closed"));
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OrchestratorError::new(ErrorKind::ProviderUnreachable, "connection_closed")),
            Err(_) => {
                self.pending.waiters.lock().await.remove(&id);
                Err(OrchestratorError::new(ErrorKind::OrchestratorTimeout, "request_timeout"))
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), OrchestratorError> {
        let notification = OutboundNotification::new(method, params);
        let frame = serde_json::to_string(&notification).map_err(|e| OrchestratorError::new(ErrorKind::InternalError, e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(frame.into()))
            .await
            .map_err(|_| OrchestratorError::new(ErrorKind::ProviderUnreachable, "connection_closed"))
    }

    pub async fn capabilities(&self) -> Capabilities {
        self.capabilities.read().await.clone()
    }

    async fn refresh_capabilities(self: &Arc<Self>) {
        if let Ok(tools) = self.call("tools/list", None).await {
            self.capabilities.write().await.tools = tools.get("tools").cloned().unwrap_or_default().as_array().cloned().unwrap_or_default();
        }
        if let Ok(resources) = self.call("resources/list", None).await {
            self.capabilities.write().await.resources =
                resources.get("resources").cloned().unwrap_or_default().as_array().cloned().unwrap_or_default();
        }
        if let Ok(prompts) = self.call("prompts/list", None).await {
            self.capabilities.write().await.prompts = prompts.get("prompts").cloned().unwrap_or_default().as_array().cloned().unwrap_or_default();
        }
    }

    pub async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.call("shutdown", None).await;
        let _ = self.sink.lock().await.close().await;
        let mut waiters = self.pending.waiters.lock().await;
        for (_, tx) in waiters.drain() {
            let _ = tx.send(Err(OrchestratorError::new(ErrorKind::ProviderUnreachable, "connection_closed")));
        }
    }
}

/// Pool of connections keyed by endpoint URL, shared across callers.
#[derive(Default)]
pub struct McpPool {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl McpPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Connect(id, url, name, headers)`. Returns the existing healthy
    /// connection for `url` if present, otherwise dials, performs the
    /// `initialize` handshake, sends `initialized`, and kicks off an
    /// asynchronous capability refresh.
    pub async fn connect(
        &self,
        url: &str,
        name: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Arc<Connection>, OrchestratorError> {
        if let Some(existing) = self.connections.read().await.get(url).cloned() {
            if existing.alive.load(Ordering::SeqCst) {
                return Ok(existing);
            }
        }

        let mut request = url
            .into_client_request()
            .map_err(|e| OrchestratorError::new(ErrorKind::InvalidConfig, e.to_string()))?;
        for (key, value) in headers {
            if let (Ok(name), Ok(value)) = (
                tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(key.as_bytes()),
                tokio_tungstenite::tungstenite::http::HeaderValue::from_str(value),
            ) {
                request.headers_mut().insert(name, value);
            }
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| OrchestratorError::new(ErrorKind::ProviderUnreachable, e.to_string()))?;
        let (sink, read) = stream.split();

        let pending = Arc::new(PendingMap::new());
        let alive = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let connection = Arc::new(Connection {
            url: url.to_string(),
            name: name.to_string(),
            sink: Mutex::new(sink),
            pending: pending.clone(),
            capabilities: RwLock::new(Capabilities::default()),
            alive: alive.clone(),
        });

        spawn_reader_task(connection.clone(), read, pending, alive);

        connection
            .call(
                "initialize",
                Some(json!({"protocolVersion": "2024-11-05", "clientInfo": {"name": name}})),
            )
            .await?;
        connection.notify("initialized", None).await?;

        let refresh_target = connection.clone();
        tokio::spawn(async move { refresh_target.refresh_capabilities().await });

        self.connections.write().await.insert(url.to_string(), connection.clone());
        Ok(connection)
    }

    pub async fn close(&self, url: &str) {
        if let Some(connection) = self.connections.write().await.remove(url) {
            connection.close().await;
        }
    }

    pub async fn close_all(&self) {
        let connections: Vec<Arc<Connection>> = self.connections.write().await.drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close().await;
        }
    }
}

/// One reader task per connection: dispatches inbound frames by ID to the
/// pending map, or by method to the notification handler.
fn spawn_reader_task(
    connection: Arc<Connection>,
    mut read: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    pending: Arc<PendingMap>,
    alive: Arc<std::sync::atomic::AtomicBool>,
) {
    tokio::spawn(async move {
        while let Some(message) = read.next().await {
            let Ok(Message::Text(text)) = message else {
                continue;
            };
            let Ok(frame) = serde_json::from_str::<InboundFrame>(&text) else {
                continue;
            };

            if frame.is_response() {
                let id = frame.id.unwrap();
                if let Some(tx) = pending.waiters.lock().await.remove(&id) {
                    let result = match frame.error {
                        Some(err) => Err(OrchestratorError::new(ErrorKind::ProviderRejected, format!("{}: {}", err.code, err.message))),
                        None => Ok(frame.result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(result);
                }
                continue;
            }

            match frame.method.as_deref() {
                Some(NOTIFICATION_TOOL_UPDATE) | Some(NOTIFICATION_TOOLS_LIST_CHANGED) => {
                    let connection = connection.clone();
                    tokio::spawn(async move { connection.refresh_capabilities().await });
                }
                Some(NOTIFICATION_RESOURCE_UPDATE) => {
                    let connection = connection.clone();
                    tokio::spawn(async move { connection.refresh_capabilities().await });
                }
                Some(NOTIFICATION_PROGRESS) => {
                    tracing::debug!(params = ?frame.params, "mcp progress notification");
                }
                _ => {}
            }
        }

        alive.store(false, Ordering::SeqCst);
        let mut waiters = pending.waiters.lock().await;
        for (_, tx) in waiters.drain() {
            let _ = tx.send(Err(OrchestratorError::new(ErrorKind::ProviderUnreachable, "connection_closed")));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn pool_starts_empty() {
        let pool = McpPool::new();
        assert!(pool.connections.read().await.is_empty());
    }

    /// A minimal in-process MCP-shaped server: answers `initialize` and
    /// every `*/list` call with an empty-but-valid result, and echoes
    /// `tools/call` params back so concurrent callers can be told apart.
    async fn spawn_fake_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    let (mut sink, mut stream) = ws.split();
                    while let Some(Ok(Message::Text(text))) = stream.next().await {
                        let req: Value = serde_json::from_str(&text).unwrap();
                        let Some(id) = req.get("id").and_then(|v| v.as_u64()) else {
                            continue; // a notification, nothing to answer
                        };
                        let method = req.get("method").and_then(|v| v.as_str()).unwrap_or("");
                        let result = match method {
                            "initialize" => json!({"protocolVersion": "2024-11-05"}),
                            "tools/list" => json!({"tools": []}),
                            "resources/list" => json!({"resources": []}),
                            "prompts/list" => json!({"prompts": []}),
                            "tools/call" => json!({"echo": req.get("params").cloned()}),
                            _ => json!({}),
                        };
                        let frame = json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();
                        let _ = sink.send(Message::Text(frame.into())).await;
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn connect_performs_handshake_and_reuses_connection() {
        let url = spawn_fake_server().await;
        let pool = McpPool::new();
        let a = pool.connect(&url, "test-client", &HashMap::new()).await.unwrap();
        let b = pool.connect(&url, "test-client", &HashMap::new()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn concurrent_callers_get_their_own_response() {
        let url = spawn_fake_server().await;
        let pool = McpPool::new();
        let connection = pool.connect(&url, "test-client", &HashMap::new()).await.unwrap();

        let calls = (0..20).map(|i| {
            let connection = connection.clone();
            tokio::spawn(async move {
                let result = connection
                    .call("tools/call", Some(json!({"caller": i})))
                    .await
                    .unwrap();
                result["echo"]["caller"].as_i64().unwrap()
            })
        });

        let mut seen: Vec<i64> = Vec::new();
        for call in calls {
            seen.push(call.await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn close_fails_pending_and_future_calls() {
        let url = spawn_fake_server().await;
        let pool = McpPool::new();
        let connection = pool.connect(&url, "test-client", &HashMap::new()).await.unwrap();
        pool.close(&url).await;

        let err = connection.call("tools/call", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderUnreachable);
    }
}
