//! Connection establishment with the analysis process.
//!
//! The analysis process takes an unspecified time to open its listening
//! socket after being spawned, so connecting is retried with a fixed backoff
//! until an overall deadline. Reaching the deadline is not a failure of the
//! session: the caller continues in degraded mode, where queries fail fast
//! instead of blocking. There is no reconnection after the deadline.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry policy for [`connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Pause after a failed attempt.
    pub backoff: Duration,
    /// Deadline after which no further attempt is started.
    pub overall_timeout: Duration,
}

/// An established socket link to the analysis process.
#[derive(Debug)]
pub struct Connection {
    remote: SocketAddr,
    stream: TcpStream,
}

impl Connection {
    /// Address of the analysis process.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Gives up the underlying duplex stream.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Result of [`connect`].
#[derive(Debug)]
pub enum ConnectOutcome {
    /// A connection was established.
    Connected {
        /// The live connection.
        connection: Connection,
        /// Number of attempts made, including the successful one.
        attempts: u32,
    },
    /// The deadline passed without a successful attempt.
    TimedOut {
        /// Number of attempts made.
        attempts: u32,
        /// Time spent retrying.
        elapsed: Duration,
    },
    /// The cancellation token fired before a connection was made.
    Cancelled,
}

/// Connects to `remote`, retrying until `policy.overall_timeout` elapses.
///
/// Each attempt is itself bounded by the remaining time, and the backoff
/// sleep is cut short at the deadline, so the call returns within the
/// overall timeout plus scheduling noise. Cancelling `cancel` stops the
/// retries immediately.
pub async fn connect(
    remote: SocketAddr,
    policy: ConnectPolicy,
    cancel: &CancellationToken,
) -> ConnectOutcome {
    let started = Instant::now();
    let deadline = started + policy.overall_timeout;
    let mut attempts = 0u32;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        attempts += 1;

        let attempt = tokio::time::timeout(deadline - now, TcpStream::connect(remote));
        let result = tokio::select! {
            () = cancel.cancelled() => return ConnectOutcome::Cancelled,
            result = attempt => result,
        };

        match result {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "failed to set TCP_NODELAY");
                }
                info!(
                    %remote,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis(),
                    "connected to analysis process"
                );
                return ConnectOutcome::Connected {
                    connection: Connection { remote, stream },
                    attempts,
                };
            }
            Ok(Err(e)) => debug!(%remote, attempt = attempts, error = %e, "connect attempt failed"),
            Err(_) => debug!(%remote, attempt = attempts, "connect attempt hit the deadline"),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            () = cancel.cancelled() => return ConnectOutcome::Cancelled,
            () = tokio::time::sleep(policy.backoff.min(remaining)) => {}
        }
    }

    let elapsed = started.elapsed();
    warn!(
        %remote,
        attempts,
        elapsed_ms = elapsed.as_millis(),
        "analysis process not reachable before deadline, continuing degraded"
    );
    ConnectOutcome::TimedOut { attempts, elapsed }
}
