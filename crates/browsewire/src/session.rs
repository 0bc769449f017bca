//! Session manager - owns the lifecycle of the automation server.
//!
//! In `AlwaysRun` mode one server is launched lazily and reused by every
//! caller; if it dies it is respawned on the next request. In `OnDemand`
//! mode each request gets a fresh server that is torn down on release.
//!
//! State machine (AlwaysRun):
//!
//! ```text
//! Uninitialized -> Launching -> Ready -> Degraded -> Respawning -> Ready
//!                      |                                  |
//!                      +--(launch fails)--> Uninitialized +--(fails)--> Degraded
//!
//! any state --shutdown()--> Closed
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::{ClientConfig, SessionKey};
use crate::dispatcher::Connection;
use crate::error::{ClientError, Result};
use crate::transport::ConnectionId;
use crate::version::VersionInfo;

/// How server processes map to requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// One long-lived server shared by all callers.
    #[default]
    AlwaysRun,
    /// A fresh server per request.
    OnDemand,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlwaysRun => "always_run",
            Self::OnDemand => "on_demand",
        }
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always_run" | "always-run" | "alwaysrun" => Ok(Self::AlwaysRun),
            "on_demand" | "on-demand" | "ondemand" => Ok(Self::OnDemand),
            other => Err(format!(
                "unknown session mode '{other}' (expected always_run or on_demand)"
            )),
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Uninitialized,
    Launching,
    Ready,
    /// The shared server died; the next request respawns it.
    Degraded,
    Respawning,
    Closed,
}

/// Starts a server and completes its handshake.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, config: &ClientConfig) -> Result<Connection>;
}

/// Launches the configured server command as a child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, config: &ClientConfig) -> Result<Connection> {
        let conn = Connection::launch(&config.server_command())?;
        if let Err(e) = conn.initialize(config.setup_timeout).await {
            tracing::error!(connection = %conn.id(), error = %e, "Automation server handshake failed");
            conn.terminate(Duration::ZERO, config.kill_grace).await;
            return Err(ClientError::Launch(format!("handshake failed: {e}")));
        }
        Ok(conn)
    }
}

#[derive(Debug, Clone, Copy)]
struct Teardown {
    close_timeout: Duration,
    grace: Duration,
}

/// A connection handed out for one logical operation.
///
/// Shared sessions borrow the long-lived server; ephemeral ones own theirs
/// and stop it on [`Session::release`]. Dropping an ephemeral session without
/// releasing still kills the process.
pub struct Session {
    connection: Arc<Connection>,
    teardown: Option<Teardown>,
}

impl Session {
    fn shared(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            teardown: None,
        }
    }

    fn ephemeral(connection: Connection, config: &ClientConfig) -> Self {
        Self {
            connection: Arc::new(connection),
            teardown: Some(Teardown {
                close_timeout: config.admin_timeout,
                grace: config.kill_grace,
            }),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_ephemeral(&self) -> bool {
        self.teardown.is_some()
    }

    /// Finish with the session. Stops the server if this session owns it.
    pub async fn release(self) {
        if let Some(teardown) = self.teardown {
            self.connection
                .terminate(teardown.close_timeout, teardown.grace)
                .await;
        }
    }
}

/// Point-in-time view of a manager, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub mode: SessionMode,
    pub launches: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launched_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionInfo>,
}

pub struct SessionManager {
    config: ClientConfig,
    launcher: Arc<dyn Launcher>,
    /// The shared connection. Held across launch so concurrent callers wait
    /// for one launch instead of starting their own.
    slot: tokio::sync::Mutex<Option<Arc<Connection>>>,
    state_tx: watch::Sender<SessionState>,
    launches: AtomicU64,
}

impl SessionManager {
    pub fn new(config: ClientConfig, launcher: Arc<dyn Launcher>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        Self {
            config,
            launcher,
            slot: tokio::sync::Mutex::new(None),
            state_tx,
            launches: AtomicU64::new(0),
        }
    }

    /// Manager that spawns real server processes.
    pub fn with_process_launcher(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(ProcessLauncher))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Session state change");
        }
    }

    /// A usable session, launching or respawning the server as needed.
    pub async fn get_session(&self) -> Result<Session> {
        let mut slot = self.slot.lock().await;
        if self.state() == SessionState::Closed {
            return Err(ClientError::TransportDown);
        }

        if self.config.session_mode == SessionMode::OnDemand {
            drop(slot);
            let launched = self.launch().await;

            // A shutdown may have landed while the launch was running.
            let _slot = self.slot.lock().await;
            if self.state() == SessionState::Closed {
                if let Ok(conn) = launched {
                    tracing::info!(connection = %conn.id(), "Session closed during launch; stopping server");
                    conn.terminate(self.config.admin_timeout, self.config.kill_grace)
                        .await;
                }
                return Err(ClientError::TransportDown);
            }
            return match launched {
                Ok(conn) => {
                    self.set_state(SessionState::Ready);
                    Ok(Session::ephemeral(conn, &self.config))
                }
                Err(e) => {
                    self.set_state(SessionState::Uninitialized);
                    Err(e)
                }
            };
        }

        let respawning = match slot.take() {
            Some(conn) if conn.is_alive() => {
                *slot = Some(Arc::clone(&conn));
                return Ok(Session::shared(conn));
            }
            Some(dead) => {
                tracing::warn!(connection = %dead.id(), "Automation server is gone; respawning");
                self.set_state(SessionState::Degraded);
                dead.terminate(Duration::ZERO, self.config.kill_grace).await;
                self.set_state(SessionState::Respawning);
                true
            }
            None => {
                if self.state() == SessionState::Degraded {
                    self.set_state(SessionState::Respawning);
                    true
                } else {
                    self.set_state(SessionState::Launching);
                    false
                }
            }
        };

        match self.launch().await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                *slot = Some(Arc::clone(&conn));
                self.set_state(SessionState::Ready);
                Ok(Session::shared(conn))
            }
            Err(e) => {
                self.set_state(if respawning {
                    SessionState::Degraded
                } else {
                    SessionState::Uninitialized
                });
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Connection> {
        let attempt = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            attempt,
            mode = %self.config.session_mode,
            browser = %self.config.browser,
            headless = self.config.headless,
            "Launching automation server"
        );
        let started = std::time::Instant::now();
        match self.launcher.launch(&self.config).await {
            Ok(conn) => {
                tracing::info!(
                    connection = %conn.id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Automation server ready"
                );
                Ok(conn)
            }
            Err(e) => {
                tracing::error!(attempt, error = %e, "Automation server launch failed");
                Err(e)
            }
        }
    }

    /// Stop the shared server and refuse further sessions. Idempotent.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if self.state() == SessionState::Closed {
            return;
        }
        self.set_state(SessionState::Closed);
        if let Some(conn) = slot.take() {
            tracing::info!(connection = %conn.id(), "Shutting down automation server");
            conn.terminate(self.config.admin_timeout, self.config.kill_grace)
                .await;
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let slot = self.slot.lock().await;
        let conn = slot.as_ref();
        SessionStatus {
            state: self.state(),
            mode: self.config.session_mode,
            launches: self.launch_count(),
            connection: conn.map(|c| c.id()),
            launched_at: conn.map(|c| c.launched_at().to_rfc3339()),
            version: conn.map(|c| c.version()),
        }
    }
}

/// Session managers keyed by configuration, so equal configs share a server.
pub struct SessionRegistry {
    launcher: Arc<dyn Launcher>,
    managers: StdMutex<HashMap<SessionKey, Arc<SessionManager>>>,
}

impl SessionRegistry {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self {
            launcher,
            managers: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_process_launcher() -> Self {
        Self::new(Arc::new(ProcessLauncher))
    }

    /// The manager for `config`, created on first use.
    pub fn manager(&self, config: &ClientConfig) -> Arc<SessionManager> {
        let mut managers = self
            .managers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let manager = managers.entry(config.session_key()).or_insert_with(|| {
            Arc::new(SessionManager::new(config.clone(), Arc::clone(&self.launcher)))
        });
        Arc::clone(manager)
    }

    pub fn len(&self) -> usize {
        self.managers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down and forget every manager.
    pub async fn shutdown_all(&self) {
        let managers: Vec<Arc<SessionManager>> = self
            .managers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .map(|(_, m)| m)
            .collect();
        for manager in managers {
            manager.shutdown().await;
        }
    }
}
