//! In-memory automation servers for unit tests.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::dispatcher::Connection;
use crate::error::{ClientError, Result};
use crate::session::Launcher;

/// Server end of an in-memory connection. Dropping it hangs up.
pub(crate) struct FakeServer {
    lines: FramedRead<ReadHalf<DuplexStream>, LinesCodec>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    /// Next frame the client wrote, or `None` once the client closed stdin.
    pub async fn next_request(&mut self) -> Option<Value> {
        let line = self.lines.next().await?.ok()?;
        serde_json::from_str(&line).ok()
    }

    pub async fn reply(&mut self, id: u64, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }

    pub async fn reply_error(&mut self, id: u64, code: i64, message: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }))
        .await;
    }

    pub async fn send(&mut self, frame: Value) {
        self.send_raw(&frame.to_string()).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        // Client may already be gone in hang-up tests.
        let _ = self.writer.write_all(format!("{line}\n").as_bytes()).await;
        let _ = self.writer.flush().await;
    }
}

pub(crate) fn fake_pair() -> (Connection, FakeServer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    let conn = Connection::over_streams(client_read, client_write);
    let server = FakeServer {
        lines: FramedRead::new(server_read, LinesCodec::new()),
        writer: server_write,
    };
    (conn, server)
}

/// Produces the `tools/call` result for a request's params.
pub(crate) type ToolHandler = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Handler that answers every tool call with a small text result.
pub(crate) fn ok_handler() -> ToolHandler {
    Arc::new(|params: &Value| {
        json!({"content": [{"type": "text", "text": format!("ran {}", params["name"])}]})
    })
}

/// Handle to a running auto-answering server.
pub(crate) struct AutoServer {
    /// Params of every `tools/call` received, in arrival order.
    pub calls: Arc<StdMutex<Vec<Value>>>,
    /// Cancel to simulate a crash: the server task exits and hangs up.
    pub kill: CancellationToken,
}

/// Spawn a server task that answers the handshake, `tools/list` and `tools/call`.
pub(crate) fn spawn_auto_server(handler: ToolHandler) -> (Connection, AutoServer) {
    let (conn, mut server) = fake_pair();
    let calls = Arc::new(StdMutex::new(Vec::new()));
    let kill = CancellationToken::new();

    let recorded = Arc::clone(&calls);
    let token = kill.clone();
    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = token.cancelled() => break,
                req = server.next_request() => match req {
                    Some(req) => req,
                    None => break,
                },
            };
            // Notifications carry no id and get no reply.
            let Some(id) = request.get("id").and_then(Value::as_u64) else {
                continue;
            };
            let result = match request["method"].as_str().unwrap_or_default() {
                "initialize" => json!({
                    "protocolVersion": crate::version::PROTOCOL_VERSION,
                    "serverInfo": {"name": "fake-server", "version": "1.0.0"},
                    "capabilities": {"tools": {}},
                }),
                "tools/list" => json!({"tools": [{
                    "name": "browser_navigate",
                    "description": "Navigate to a URL",
                    "inputSchema": {"type": "object"},
                }]}),
                "tools/call" => {
                    let params = request["params"].clone();
                    recorded.lock().unwrap().push(params.clone());
                    handler(&params)
                }
                _ => {
                    server.reply_error(id, -32601, "Method not found").await;
                    continue;
                }
            };
            server.reply(id, result).await;
        }
    });

    (conn, AutoServer { calls, kill })
}

/// Launcher backed by auto servers, with scripted failures.
pub(crate) struct FakeLauncher {
    handler: ToolHandler,
    launches: AtomicUsize,
    fail_next: AtomicUsize,
    delay: Duration,
    servers: StdMutex<Vec<AutoServer>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::with_handler(ok_handler())
    }

    pub fn with_handler(handler: ToolHandler) -> Self {
        Self {
            handler,
            launches: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            delay: Duration::ZERO,
            servers: StdMutex::new(Vec::new()),
        }
    }

    /// Make each launch take this long, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `n` launches with a launch error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Crash every server launched so far.
    pub fn kill_all(&self) {
        for server in self.servers.lock().unwrap().iter() {
            server.kill.cancel();
        }
    }

    /// Tool call params received by all servers, in launch order.
    pub fn calls(&self) -> Vec<Value> {
        self.servers
            .lock()
            .unwrap()
            .iter()
            .flat_map(|s| s.calls.lock().unwrap().clone())
            .collect()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, config: &ClientConfig) -> Result<Connection> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(ClientError::Launch("scripted launch failure".to_string()));
        }

        let (conn, server) = spawn_auto_server(Arc::clone(&self.handler));
        conn.initialize(config.setup_timeout).await?;
        self.servers.lock().unwrap().push(server);
        Ok(conn)
    }
}
