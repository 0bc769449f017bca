//! Transport channel - owns the automation server process and its pipes.
//!
//! Flow:
//! 1. Spawn the server with piped stdin/stdout/stderr
//! 2. Hand stdout/stderr to the background loops (see `demux`)
//! 3. Serialize all outbound frames through one writer lock
//! 4. On teardown: close stdin, SIGTERM, bounded wait, hard kill

use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::Outbound;
use crate::config::ServerCommand;
use crate::error::{ClientError, Result};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Identifies one launched transport in logs.
///
/// UUID v4 so ids from a respawned server never collide with the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read sides of the transport, consumed by the background loops.
pub struct TransportStreams {
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
}

pub struct Transport {
    id: ConnectionId,
    writer: tokio::sync::Mutex<FramedWrite<BoxedWriter, JsonLinesCodec>>,
    child: StdMutex<Option<Child>>,
    /// Fired once the channel can no longer carry frames.
    dead: CancellationToken,
    /// Fired by `terminate()` to stop the reader loops.
    shutdown: CancellationToken,
}

impl Transport {
    /// Launch the server process with piped I/O.
    pub fn spawn(cmd: &ServerCommand) -> Result<(Self, TransportStreams)> {
        tracing::info!(command = %cmd.display(), "Spawning automation server");

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ClientError::Launch(format!("failed to spawn '{}': {}", cmd.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Launch("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Launch("stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        let transport = Self::new(Box::new(stdin), Some(child));
        tracing::debug!(connection = %transport.id, "Automation server spawned");

        let streams = TransportStreams {
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
        };
        Ok((transport, streams))
    }

    /// Transport over an arbitrary writer with no child process behind it.
    pub fn from_writer(writer: BoxedWriter) -> Self {
        Self::new(writer, None)
    }

    fn new(writer: BoxedWriter, child: Option<Child>) -> Self {
        Self {
            id: ConnectionId::new(),
            writer: tokio::sync::Mutex::new(FramedWrite::new(writer, JsonLinesCodec::new())),
            child: StdMutex::new(child),
            dead: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn dead_token(&self) -> CancellationToken {
        self.dead.clone()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Write one frame and flush. Frames from concurrent callers never interleave.
    pub async fn send(&self, frame: Outbound) -> Result<()> {
        if !self.is_alive() {
            return Err(ClientError::TransportDown);
        }

        let method = frame.method().to_string();
        let mut writer = self.writer.lock().await;
        writer.send(frame).await.map_err(|e| {
            tracing::warn!(connection = %self.id, %method, error = %e, "Write to automation server failed");
            self.mark_dead();
            ClientError::TransportDown
        })
    }

    /// Whether the channel can still carry frames. Polls the child's exit status.
    pub fn is_alive(&self) -> bool {
        if self.dead.is_cancelled() {
            return false;
        }

        let mut guard = self
            .child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(child) = guard.as_mut() {
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    tracing::warn!(connection = %self.id, %status, "Automation server exited");
                    self.dead.cancel();
                    return false;
                }
                Err(e) => {
                    tracing::warn!(connection = %self.id, error = %e, "Failed to poll automation server status");
                    self.dead.cancel();
                    return false;
                }
            }
        }
        true
    }

    pub fn mark_dead(&self) {
        if !self.dead.is_cancelled() {
            tracing::debug!(connection = %self.id, "Marking transport dead");
            self.dead.cancel();
        }
    }

    /// Close stdin, ask the process to exit, and kill it if it outlives `grace`.
    ///
    /// Never fails: this runs during teardown, so problems are only logged.
    /// The graceful remote close call is the caller's job (see `Connection::terminate`).
    pub async fn terminate(&self, grace: Duration) {
        self.mark_dead();
        self.shutdown.cancel();

        match tokio::time::timeout(grace, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Err(e) = writer.get_mut().shutdown().await {
                    tracing::debug!(connection = %self.id, error = %e, "Closing server stdin failed");
                }
            }
            Err(_) => {
                tracing::warn!(connection = %self.id, "Writer busy during terminate; skipping stdin close");
            }
        }

        let child = self
            .child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(mut child) = child else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(connection = %self.id, pid, error = %e, "SIGTERM failed");
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(connection = %self.id, %status, "Automation server stopped");
            }
            Ok(Err(e)) => {
                tracing::warn!(connection = %self.id, error = %e, "Failed to wait for automation server");
            }
            Err(_) => {
                tracing::warn!(connection = %self.id, ?grace, "Automation server ignored SIGTERM; killing");
                if let Err(e) = child.kill().await {
                    tracing::error!(connection = %self.id, error = %e, "Failed to kill automation server");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Request;

    #[tokio::test]
    async fn spawn_missing_executable_is_launch_error() {
        let cmd = ServerCommand::new("/nonexistent/browsewire-test-server");
        let err = Transport::spawn(&cmd).err().expect("spawn should fail");
        match err {
            ClientError::Launch(msg) => assert!(msg.contains("/nonexistent/browsewire-test-server")),
            other => panic!("expected Launch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_after_mark_dead_is_transport_down() {
        let (client, _server) = tokio::io::duplex(1024);
        let transport = Transport::from_writer(Box::new(client));
        assert!(transport.is_alive());

        transport.mark_dead();
        assert!(!transport.is_alive());

        let err = transport
            .send(Outbound::Request(Request::new(1, "ping", None)))
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::TransportDown);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_child_is_not_alive() {
        let cmd = ServerCommand::new("sh").args(["-c", "exit 0"]);
        let (transport, _streams) = Transport::spawn(&cmd).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while transport.is_alive() {
            assert!(tokio::time::Instant::now() < deadline, "child never reported exit");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_long_running_child() {
        let cmd = ServerCommand::new("sh").args(["-c", "sleep 30"]);
        let (transport, _streams) = Transport::spawn(&cmd).unwrap();
        assert!(transport.is_alive());

        let started = std::time::Instant::now();
        transport.terminate(Duration::from_secs(2)).await;
        assert!(!transport.is_alive());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
