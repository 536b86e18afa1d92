//! Error types for the mro-lens sidecar bridge.
//!
//! Errors are organized by subsystem: the session lifecycle (port, process,
//! connection, teardown), the LSP client talking to the analysis sidecar, and
//! configuration loading.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while driving a session through its lifecycle.
///
/// `PortExhausted`, `SpawnFailure` and `UnexpectedProcessExit` abort the
/// session. `ConnectTimeout` and `TerminationTimeout` are reported but never
/// abort anything: the first degrades the session, the second still marks it
/// terminated.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No local TCP port could be obtained, not even an ephemeral one.
    #[error("no local port available: {0}")]
    PortExhausted(String),

    /// The analysis process could not be launched.
    #[error("failed to spawn analysis process '{executable}': {reason}")]
    SpawnFailure {
        /// The executable that failed to start.
        executable: String,
        /// Why the spawn failed.
        reason: String,
    },

    /// The analysis process never accepted a connection in time.
    #[error("analysis process not reachable on port {port} after {elapsed:?}")]
    ConnectTimeout {
        /// The port the process was told to listen on.
        port: u16,
        /// Time spent retrying.
        elapsed: Duration,
    },

    /// The analysis process exited while the session still needed it.
    #[error("analysis process exited unexpectedly: {0}")]
    UnexpectedProcessExit(String),

    /// The analysis process group did not die within the allotted wait.
    #[error("analysis process {pid} still alive after {waited:?}")]
    TerminationTimeout {
        /// Process id of the group leader.
        pid: u32,
        /// How long termination was awaited.
        waited: Duration,
    },

    /// Activation was requested while a session is already in progress.
    #[error("session already active (phase: {0})")]
    AlreadyActive(String),

    /// Activation was requested on a session that has already been torn down.
    #[error("session has ended; start a new one")]
    SessionEnded,

    /// The host asked for shutdown before activation completed.
    #[error("activation cancelled by shutdown request")]
    Cancelled,

    /// IO error while managing session resources.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to LSP client operations against the analysis sidecar.
#[derive(Debug, Error)]
pub enum LspError {
    /// The session runs in degraded mode: no connection was ever established.
    #[error("analysis server not connected")]
    NotConnected,

    /// The connection existed but has been closed.
    #[error("connection to analysis server closed")]
    ConnectionClosed,

    /// Failed to initialize the analysis server.
    #[error("analysis server initialization failed: {0}")]
    InitializationFailed(String),

    /// A request to the analysis server timed out.
    #[error("analysis server request timed out after {0:?}")]
    Timeout(Duration),

    /// Failed to send a request or the server answered with an error.
    #[error("request to analysis server failed: {0}")]
    RequestFailed(String),

    /// Invalid position in document.
    #[error("invalid position: line {line}, column {column}")]
    InvalidPosition {
        /// The line number.
        line: u32,
        /// The column number.
        column: u32,
    },

    /// Document not found or not open.
    #[error("document not found: {0}")]
    DocumentNotFound(String),
}

/// Errors related to loading a session configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Path of the file.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The configuration is not valid JSON or has unknown fields.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds a value the session cannot work with.
    #[error("invalid config value for '{field}': {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// A unified error type for the entire crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Session lifecycle error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// LSP-related error.
    #[error("LSP error: {0}")]
    Lsp(#[from] LspError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for mro-lens operations.
pub type Result<T> = std::result::Result<T, Error>;
