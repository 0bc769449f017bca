//! Background loops that consume the server's output streams.
//!
//! The response demultiplexer owns stdout: each decoded response completes
//! exactly one pending request, notifications go to a queue, and malformed
//! frames are logged and skipped. When stdout ends, every waiter is failed.
//!
//! The stderr drain keeps the server's diagnostic pipe empty so the process
//! never blocks on a full buffer. Lines are forwarded to tracing.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{Inbound, Notification};
use crate::dispatcher::PendingTable;
use crate::error::ClientError;
use crate::transport::ConnectionId;

/// Tracing target for lines the server writes to stderr.
pub const SERVER_LOG_TARGET: &str = "browsewire::server";

/// Lines longer than this are cut before logging.
const MAX_LOGGED_LINE: usize = 4096;

pub(crate) struct DemuxContext {
    pub connection: ConnectionId,
    pub pending: Arc<PendingTable>,
    pub notifications: mpsc::UnboundedSender<Notification>,
    pub dead: CancellationToken,
    pub shutdown: CancellationToken,
}

/// Read frames until stdout closes or the transport is shut down.
pub(crate) async fn run_demux<R>(stdout: R, ctx: DemuxContext)
where
    R: AsyncRead + Unpin,
{
    let DemuxContext {
        connection,
        pending,
        notifications,
        dead,
        shutdown,
    } = ctx;
    let mut frames = FramedRead::new(stdout, JsonLinesCodec::new());

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::debug!(%connection, "Demux stopping on shutdown");
                break;
            }
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(Ok(Inbound::Response(response)))) => {
                let id = response.id;
                if !pending.deliver(response) {
                    // Caller already timed out or gave up.
                    tracing::debug!(%connection, id, "Dropping response with no pending request");
                }
            }
            Some(Ok(Ok(Inbound::Notification(notification)))) => {
                tracing::trace!(
                    %connection,
                    method = notification.method.as_deref().unwrap_or("<none>"),
                    "Server notification"
                );
                // Receiver gone means the connection is being dropped.
                let _ = notifications.send(notification);
            }
            Some(Ok(Err(malformed))) => {
                let excerpt = malformed.excerpt.clone();
                let error = ClientError::from(malformed);
                tracing::warn!(
                    %connection,
                    %error,
                    %excerpt,
                    "Skipping malformed frame from automation server"
                );
            }
            Some(Err(e)) => {
                tracing::error!(%connection, error = %e, "Read from automation server failed");
                break;
            }
            None => {
                tracing::info!(%connection, "Automation server closed stdout");
                break;
            }
        }
    }

    // Mark dead before failing waiters: anything registered after this
    // point fails on send instead of waiting for a response that never comes.
    dead.cancel();
    let failed = pending.fail_all(ClientError::TransportDown);
    if failed > 0 {
        tracing::warn!(%connection, failed, "Failed in-flight requests after transport loss");
    }
}

/// Forward stderr lines to tracing until the pipe closes.
pub(crate) async fn run_stderr_drain<R>(stderr: R, connection: ConnectionId)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                let shown: String = line.chars().take(MAX_LOGGED_LINE).collect();
                tracing::debug!(target: SERVER_LOG_TARGET, %connection, "{}", shown);
            }
            Err(e) => {
                tracing::debug!(%connection, error = %e, "Stderr drain stopped");
                break;
            }
        }
    }
    tracing::trace!(%connection, "Stderr closed");
}
