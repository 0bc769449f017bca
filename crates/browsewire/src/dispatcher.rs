//! Request dispatcher - correlates outbound requests with inbound responses.
//!
//! A [`Connection`] owns one transport plus the loops reading it. Any number
//! of tasks may call concurrently: each call takes a fresh id, registers a
//! one-shot completion slot in the [`PendingTable`], writes its frame, and
//! waits with a deadline. The slot is purged however the wait ends.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{
    Notification, Outbound, OutboundNotification, Request, RequestId, Response,
};
use crate::config::ServerCommand;
use crate::demux::{DemuxContext, run_demux, run_stderr_drain};
use crate::error::{ClientError, Result};
use crate::tool::{ToolCall, ToolDescriptor};
use crate::transport::{BoxedReader, ConnectionId, Transport, TransportStreams};
use crate::version::{PROTOCOL_VERSION, PeerInfo, VersionInfo};

/// Error code reported when a tool call completes with `isError: true`.
pub const TOOL_ERROR_CODE: i64 = -32000;

type Delivery = Result<Value>;

/// Pending requests keyed by id.
///
/// Each entry is completed at most once: delivery removes it, so a late or
/// duplicate response finds nothing.
#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<RequestId, oneshot::Sender<Delivery>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a completion slot. The entry is removed when the guard drops.
    pub(crate) fn register(
        self: &Arc<Self>,
        id: RequestId,
    ) -> (PendingEntry, oneshot::Receiver<Delivery>) {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, tx);
        let entry = PendingEntry {
            id,
            table: Arc::clone(self),
        };
        (entry, rx)
    }

    /// Complete the matching request. Returns false if nobody is waiting.
    pub fn deliver(&self, response: Response) -> bool {
        let Some((_, tx)) = self.entries.remove(&response.id) else {
            return false;
        };
        let delivery = response.outcome.map_err(|e| ClientError::Remote {
            code: e.code,
            message: e.message,
        });
        // Receiver dropped between removal and send: caller gave up.
        let _ = tx.send(delivery);
        true
    }

    /// Fail every waiter with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: ClientError) -> usize {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.entries.remove(&id) {
                let _ = tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// RAII guard that purges a pending entry on drop.
pub(crate) struct PendingEntry {
    id: RequestId,
    table: Arc<PendingTable>,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        self.table.entries.remove(&self.id);
    }
}

/// A live connection to one automation server.
pub struct Connection {
    id: ConnectionId,
    transport: Transport,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    notifications: tokio::sync::Mutex<mpsc::UnboundedReceiver<Notification>>,
    version: StdMutex<VersionInfo>,
    launched_at: DateTime<Utc>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Spawn the server process and start the reader loops.
    ///
    /// Does not perform the handshake; call [`Connection::initialize`] next.
    pub fn launch(cmd: &ServerCommand) -> Result<Self> {
        let (transport, streams) = Transport::spawn(cmd)?;
        Ok(Self::start(transport, streams))
    }

    /// Connection over in-memory or otherwise pre-opened streams.
    pub fn over_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Transport::from_writer(Box::new(writer));
        let streams = TransportStreams {
            stdout: Box::new(reader),
            stderr: None,
        };
        Self::start(transport, streams)
    }

    fn start(transport: Transport, streams: TransportStreams) -> Self {
        let id = transport.id();
        let pending = Arc::new(PendingTable::new());
        let (tx, rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::with_capacity(2);
        let ctx = DemuxContext {
            connection: id,
            pending: Arc::clone(&pending),
            notifications: tx,
            dead: transport.dead_token(),
            shutdown: transport.shutdown_token(),
        };
        tasks.push(tokio::spawn(run_demux::<BoxedReader>(streams.stdout, ctx)));
        if let Some(stderr) = streams.stderr {
            tasks.push(tokio::spawn(run_stderr_drain::<BoxedReader>(stderr, id)));
        }

        Self {
            id,
            transport,
            pending,
            next_id: AtomicU64::new(1),
            notifications: tokio::sync::Mutex::new(rx),
            version: StdMutex::new(VersionInfo::new()),
            launched_at: Utc::now(),
            tasks,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn launched_at(&self) -> DateTime<Utc> {
        self.launched_at
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Version info recorded by the last successful handshake.
    pub fn version(&self) -> VersionInfo {
        self.version
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Send a request and wait up to `timeout` for its response.
    pub async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        if !self.is_alive() {
            return Err(ClientError::TransportDown);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (entry, rx) = self.pending.register(id);
        tracing::debug!(connection = %self.id, id, method, "Sending request");

        self.transport
            .send(Outbound::Request(Request::new(id, method, params)))
            .await?;

        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(entry);

        match outcome {
            Ok(Ok(delivery)) => {
                if let Err(e) = &delivery {
                    tracing::debug!(connection = %self.id, id, method, error = %e, "Request failed");
                }
                delivery
            }
            // Sender dropped without completing: the table was torn down.
            Ok(Err(_)) => Err(ClientError::TransportDown),
            Err(_) => {
                tracing::warn!(connection = %self.id, id, method, ?timeout, "Request timed out");
                Err(ClientError::RequestTimeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Fire-and-forget message; no response is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        tracing::debug!(connection = %self.id, method, "Sending notification");
        self.transport
            .send(Outbound::Notification(OutboundNotification::new(method, params)))
            .await
    }

    /// Protocol handshake: `initialize`, then `notifications/initialized`.
    pub async fn initialize(&self, timeout: Duration) -> Result<VersionInfo> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": PeerInfo::client(),
        });
        let result = self.call("initialize", Some(params), timeout).await?;
        let info = VersionInfo::from_initialize_result(&result);
        self.notify("notifications/initialized", None).await?;

        tracing::info!(
            connection = %self.id,
            server = info.server.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown"),
            server_version = info.server.as_ref().map(|s| s.version.as_str()).unwrap_or("unknown"),
            protocol = info.protocol.as_deref().unwrap_or("unknown"),
            "Automation server initialized"
        );
        *self
            .version
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = info.clone();
        Ok(info)
    }

    /// Invoke a remote tool by its wire name.
    ///
    /// A result flagged `isError` becomes [`ClientError::Remote`] carrying the
    /// tool's text output.
    pub async fn call_tool(&self, name: &str, arguments: Value, timeout: Duration) -> Result<Value> {
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.call("tools/call", Some(params), timeout).await?;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let message = text_content(&result);
            return Err(ClientError::Remote {
                code: TOOL_ERROR_CODE,
                message: if message.is_empty() {
                    format!("tool '{name}' reported an error")
                } else {
                    message
                },
            });
        }
        Ok(result)
    }

    /// Tools the server advertises.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>> {
        let result = self.call("tools/list", Some(json!({})), timeout).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| ClientError::Protocol("tools/list result has no 'tools'".to_string()))?;
        serde_json::from_value(tools)
            .map_err(|e| ClientError::Protocol(format!("invalid tools/list result: {e}")))
    }

    /// Wait for the next server notification. `None` once the connection is gone.
    pub async fn next_notification(&self) -> Option<Notification> {
        self.notifications.lock().await.recv().await
    }

    /// Take every notification queued so far without waiting.
    pub async fn drain_notifications(&self) -> Vec<Notification> {
        let mut rx = self.notifications.lock().await;
        let mut drained = Vec::new();
        while let Ok(n) = rx.try_recv() {
            drained.push(n);
        }
        drained
    }

    /// Ask the server to close its browser, then stop the process.
    ///
    /// Every step is best effort; failures are logged.
    pub async fn terminate(&self, close_timeout: Duration, grace: Duration) {
        if self.is_alive() {
            let close = ToolCall::Close {};
            match self
                .call_tool(&close.remote_name(), close.arguments(), close_timeout)
                .await
            {
                Ok(_) => tracing::debug!(connection = %self.id, "Browser closed"),
                Err(e) => {
                    tracing::debug!(connection = %self.id, error = %e, "Graceful browser close failed")
                }
            }
        }
        self.transport.terminate(grace).await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.transport.mark_dead();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Concatenated text blocks of a tool result's `content`.
pub fn text_content(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}
