//! Optimization layer over the session manager.
//!
//! Decides per call whether the server should return a page snapshot,
//! runs batches sequentially on one session, and keeps running metrics.

pub mod metrics;
pub mod policy;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::dispatcher::Connection;
use crate::error::{ClientError, Result};
use crate::session::SessionManager;
use crate::tool::{ToolCall, ToolDescriptor, ToolKind};

pub use metrics::{Metrics, MetricsSummary};
pub use policy::{SUPPRESS_SNAPSHOT_KEY, SnapshotPolicy, suppress_snapshot};

/// A tool call plus the snapshot decision made for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub tool: ToolCall,
    pub include_snapshot: bool,
}

impl Operation {
    pub fn new(tool: ToolCall) -> Self {
        Self {
            tool,
            include_snapshot: true,
        }
    }

    /// Parse and validate a tool name plus arguments.
    pub fn parse(name: &str, arguments: Value) -> Result<Self> {
        ToolCall::parse(name, arguments).map(Self::new)
    }
}

impl From<ToolCall> for Operation {
    fn from(tool: ToolCall) -> Self {
        Self::new(tool)
    }
}

/// A page interaction following a navigation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Interaction {
    Click { selector: String },
    Fill { selector: String, value: String },
    Select { selector: String, value: String },
}

impl From<Interaction> for ToolCall {
    fn from(interaction: Interaction) -> Self {
        match interaction {
            Interaction::Click { selector } => ToolCall::click(selector),
            Interaction::Fill { selector, value } => ToolCall::fill(selector, value),
            Interaction::Select { selector, value } => ToolCall::select(selector, value),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Record failing steps and keep going instead of stopping at the first.
    pub continue_on_error: bool,
}

/// Result of one successful batch step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub index: usize,
    pub tool: String,
    pub include_snapshot: bool,
    pub duration_ms: u64,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub tool: String,
    #[serde(serialize_with = "serialize_error")]
    pub error: ClientError,
}

fn serialize_error<S: Serializer>(error: &ClientError, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_str(error)
}

/// Ordered results of a batch plus any failures.
///
/// Without `continue_on_error`, `failures` holds at most one entry and
/// `results` stops just before it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub results: Vec<StepResult>,
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn first_failure(&self) -> Option<&BatchFailure> {
        self.failures.first()
    }

    /// Collapse into the step results, or the first failure's error.
    pub fn into_result(self) -> Result<Vec<StepResult>> {
        match self.failures.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(self.results),
        }
    }
}

/// Client that applies the snapshot policy and records metrics.
pub struct OptimizedClient {
    sessions: Arc<SessionManager>,
    policy: SnapshotPolicy,
    batch_threshold: usize,
    metrics_enabled: bool,
    call_timeout: Duration,
    admin_timeout: Duration,
    metrics: StdMutex<Metrics>,
}

impl OptimizedClient {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        let config = sessions.config();
        Self {
            policy: config.snapshot_policy,
            batch_threshold: config.batch_threshold,
            metrics_enabled: config.metrics_enabled,
            call_timeout: config.call_timeout,
            admin_timeout: config.admin_timeout,
            sessions,
            metrics: StdMutex::new(Metrics::new()),
        }
    }

    /// Client that spawns real server processes.
    pub fn from_config(config: ClientConfig) -> Self {
        Self::new(Arc::new(SessionManager::with_process_launcher(config)))
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn policy(&self) -> SnapshotPolicy {
        self.policy
    }

    /// Apply the snapshot policy to a sequence by position.
    pub fn plan(&self, operations: Vec<Operation>) -> Vec<Operation> {
        let total = operations.len();
        operations
            .into_iter()
            .enumerate()
            .map(|(index, mut op)| {
                op.include_snapshot = self.policy.include_snapshot(op.tool.kind(), index, total);
                op
            })
            .collect()
    }

    /// Validate and run one tool call by name.
    pub async fn call(&self, tool: &str, arguments: Value) -> Result<Value> {
        let call = ToolCall::parse(tool, arguments)?;
        self.execute_single(call).await
    }

    pub async fn execute_single(&self, tool: ToolCall) -> Result<Value> {
        let op = Operation {
            include_snapshot: self.policy.include_snapshot(tool.kind(), 0, 1),
            tool,
        };

        let session = self.sessions.get_session().await?;
        let started = Instant::now();
        let (result, suppressed) = self.dispatch(session.connection(), &op).await;
        let elapsed = started.elapsed();
        session.release().await;

        self.with_metrics(|m| m.record(elapsed, suppressed, false));
        tracing::debug!(
            tool = op.tool.name(),
            include_snapshot = op.include_snapshot,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = result.is_ok(),
            "Call finished"
        );
        result
    }

    /// Run `operations` in order on one session, stopping at the first failure.
    pub async fn execute_batch(&self, operations: Vec<Operation>) -> BatchOutcome {
        self.execute_batch_with(operations, BatchOptions::default())
            .await
    }

    pub async fn execute_batch_with(
        &self,
        operations: Vec<Operation>,
        options: BatchOptions,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if operations.is_empty() {
            return outcome;
        }
        if operations.len() < self.batch_threshold {
            tracing::warn!(
                size = operations.len(),
                threshold = self.batch_threshold,
                "Batch is below the batching threshold; single calls would do as well"
            );
        }

        let planned = self.plan(operations);
        let session = match self.sessions.get_session().await {
            Ok(session) => session,
            Err(error) => {
                outcome.failures.push(BatchFailure {
                    index: 0,
                    tool: planned[0].tool.name().to_string(),
                    error,
                });
                return outcome;
            }
        };

        let started = Instant::now();
        let mut suppressed = 0u64;
        let mut dispatched = 0u64;
        for (index, op) in planned.iter().enumerate() {
            let step_started = Instant::now();
            let (result, was_suppressed) = self.dispatch(session.connection(), op).await;
            dispatched += 1;
            if was_suppressed {
                suppressed += 1;
            }

            match result {
                Ok(result) => outcome.results.push(StepResult {
                    index,
                    tool: op.tool.name().to_string(),
                    include_snapshot: op.include_snapshot,
                    duration_ms: step_started.elapsed().as_millis() as u64,
                    result,
                }),
                Err(error) => {
                    tracing::warn!(index, tool = op.tool.name(), error = %error, "Batch step failed");
                    outcome.failures.push(BatchFailure {
                        index,
                        tool: op.tool.name().to_string(),
                        error,
                    });
                    if !options.continue_on_error {
                        break;
                    }
                }
            }
        }
        let elapsed = started.elapsed();
        session.release().await;

        self.with_metrics(|m| {
            m.record(elapsed, false, true);
            m.record_suppressed(suppressed);
            m.record_batched_calls(dispatched);
        });
        tracing::info!(
            steps = planned.len(),
            dispatched,
            suppressed,
            failures = outcome.failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch finished"
        );
        outcome
    }

    /// Navigate to `url`, then run `interactions` in order as one batch.
    pub async fn navigate_and_interact(
        &self,
        url: &str,
        interactions: Vec<Interaction>,
    ) -> BatchOutcome {
        let operations = std::iter::once(ToolCall::navigate(url))
            .chain(interactions.into_iter().map(ToolCall::from))
            .map(Operation::new)
            .collect();
        self.execute_batch(operations).await
    }

    /// Tools advertised by the server.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let session = self.sessions.get_session().await?;
        let tools = session.connection().list_tools(self.admin_timeout).await;
        session.release().await;
        tools
    }

    /// Current metrics. All zeros when metrics are disabled.
    pub fn get_metrics(&self) -> MetricsSummary {
        self.lock_metrics().summary()
    }

    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }

    async fn dispatch(&self, conn: &Connection, op: &Operation) -> (Result<Value>, bool) {
        let mut arguments = op.tool.arguments();
        let suppressed = !op.include_snapshot && suppress_snapshot(&mut arguments);
        let timeout = match op.tool.kind() {
            ToolKind::Administrative => self.admin_timeout,
            _ => self.call_timeout,
        };
        let result = conn
            .call_tool(&op.tool.remote_name(), arguments, timeout)
            .await;
        (result, suppressed)
    }

    fn with_metrics(&self, f: impl FnOnce(&mut Metrics)) {
        if self.metrics_enabled {
            f(&mut self.lock_metrics());
        }
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, Metrics> {
        self.metrics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
