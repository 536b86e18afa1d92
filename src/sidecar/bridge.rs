//! Byte transport between the protocol layer and the analysis process.
//!
//! The bridge does not look at the messages it carries. It splits the
//! connection into a reader and a writer, hands them to whatever drives the
//! protocol (the JSON-RPC main loop in practice), and publishes why the
//! transport stopped once that driver returns.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use super::connect::Connection;

/// Inbound half of the bridge, as a `futures::io::AsyncRead`.
pub type BridgeReader = Compat<OwnedReadHalf>;

/// Outbound half of the bridge, as a `futures::io::AsyncWrite`.
pub type BridgeWriter = Compat<OwnedWriteHalf>;

/// Why the bridge stopped carrying bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote end closed the stream.
    RemoteClosed,
    /// The stream or the protocol driver failed.
    Failed(String),
    /// The bridge was shut down locally.
    Aborted,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteClosed => f.write_str("remote closed the connection"),
            Self::Failed(reason) => write!(f, "transport failed: {reason}"),
            Self::Aborted => f.write_str("closed locally"),
        }
    }
}

/// A connection ready to be driven.
#[derive(Debug)]
pub struct Bridge {
    remote: SocketAddr,
    reader: BridgeReader,
    writer: BridgeWriter,
}

impl Bridge {
    /// Splits `connection` into its two directions.
    pub fn new(connection: Connection) -> Self {
        let remote = connection.remote();
        let (reader, writer) = connection.into_stream().into_split();
        Self {
            remote,
            reader: reader.compat(),
            writer: writer.compat_write(),
        }
    }

    /// Address of the analysis process.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Runs `drive` over the two halves on a background task.
    ///
    /// `drive` owns both directions until it returns; its result decides the
    /// published [`CloseReason`].
    pub fn spawn<F, Fut, E>(self, drive: F) -> BridgeHandle
    where
        F: FnOnce(BridgeReader, BridgeWriter) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let remote = self.remote;
        let (closed_tx, closed_rx) = watch::channel(None);
        let running = drive(self.reader, self.writer);

        let task = tokio::spawn(async move {
            let reason = match running.await {
                Ok(()) => CloseReason::RemoteClosed,
                Err(e) => CloseReason::Failed(e.to_string()),
            };
            match &reason {
                CloseReason::RemoteClosed => debug!(%remote, "bridge closed by remote"),
                other => warn!(%remote, reason = %other, "bridge stopped"),
            }
            let _ = closed_tx.send(Some(reason));
        });

        BridgeHandle {
            remote,
            closed_rx,
            task,
        }
    }
}

/// Handle on a running bridge. Dropping it shuts the bridge down.
#[derive(Debug)]
pub struct BridgeHandle {
    remote: SocketAddr,
    closed_rx: watch::Receiver<Option<CloseReason>>,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// Address of the analysis process.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Why the bridge stopped, if it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed_rx.borrow().clone()
    }

    /// Whether the bridge has stopped.
    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some() || self.task.is_finished()
    }

    /// A receiver that observes the close reason, for read-only holders.
    pub fn subscribe(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed_rx.clone()
    }

    /// Resolves once the bridge stops.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_rx.clone();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Aborted),
            Err(_) => CloseReason::Aborted,
        };
        reason
    }

    /// Stops carrying bytes in both directions.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::connect::{ConnectOutcome, ConnectPolicy, connect};
    use futures::{AsyncReadExt, AsyncWriteExt};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    async fn connected_pair() -> (Bridge, tokio::net::TcpStream) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let policy = ConnectPolicy {
            backoff: Duration::from_millis(50),
            overall_timeout: Duration::from_secs(2),
        };
        let cancel = CancellationToken::new();
        let (outcome, accepted) = tokio::join!(connect(addr, policy, &cancel), listener.accept());
        let ConnectOutcome::Connected { connection, .. } = outcome else {
            panic!("connection failed");
        };
        (Bridge::new(connection), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_carries_bytes_both_ways_in_order() {
        let (bridge, mut remote) = connected_pair().await;
        let (seen_tx, seen_rx) = oneshot::channel();

        let handle = bridge.spawn(|mut reader, mut writer| async move {
            writer.write_all(b"Content-Length: 2\r\n\r\n{}").await?;
            writer.flush().await?;
            let mut inbound = Vec::new();
            reader.read_to_end(&mut inbound).await?;
            let _ = seen_tx.send(inbound);
            Ok::<_, std::io::Error>(())
        });

        let mut outbound = [0u8; 23];
        tokio::io::AsyncReadExt::read_exact(&mut remote, &mut outbound)
            .await
            .unwrap();
        assert_eq!(&outbound, b"Content-Length: 2\r\n\r\n{}");

        tokio::io::AsyncWriteExt::write_all(&mut remote, b"first ")
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut remote, b"second")
            .await
            .unwrap();
        drop(remote);

        assert_eq!(seen_rx.await.unwrap(), b"first second");
        assert_eq!(handle.closed().await, CloseReason::RemoteClosed);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_driver_error_reported() {
        let (bridge, _remote) = connected_pair().await;
        let handle = bridge.spawn(|_reader, _writer| async move {
            Err::<(), _>(std::io::Error::other("framing broke"))
        });

        match handle.closed().await {
            CloseReason::Failed(reason) => assert!(reason.contains("framing broke")),
            other => panic!("unexpected close reason: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_signals_closure() {
        let (bridge, _remote) = connected_pair().await;
        let handle = bridge.spawn(|mut reader, _writer| async move {
            let mut sink = Vec::new();
            reader.read_to_end(&mut sink).await?;
            Ok::<_, std::io::Error>(())
        });

        assert!(!handle.is_closed());
        handle.abort();
        assert_eq!(handle.closed().await, CloseReason::Aborted);
    }
}
