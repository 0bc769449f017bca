//! browsewire: protocol client for browser-automation servers run as subprocesses.

pub mod bridge;
pub mod config;
mod demux;
pub mod dispatcher;
pub mod error;
pub mod optimizer;
pub mod session;
pub mod tool;
pub mod transport;
mod version;

#[cfg(test)]
mod testing;

pub use config::{BrowserFamily, ClientConfig, ConfigError, ServerCommand, SessionKey};
pub use demux::SERVER_LOG_TARGET;
pub use dispatcher::{Connection, PendingTable, TOOL_ERROR_CODE, text_content};
pub use error::{ClientError, Result};
pub use optimizer::{
    BatchFailure, BatchOptions, BatchOutcome, Interaction, Metrics, MetricsSummary, Operation,
    OptimizedClient, SnapshotPolicy, StepResult,
};
pub use session::{
    Launcher, ProcessLauncher, Session, SessionManager, SessionMode, SessionRegistry,
    SessionState, SessionStatus,
};
pub use tool::{ToolCall, ToolDescriptor, ToolKind};
pub use transport::ConnectionId;
pub use version::{CLIENT_VERSION, PROTOCOL_VERSION, PeerInfo, VersionInfo};
