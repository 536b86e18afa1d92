//! Session lifecycle coordination.
//!
//! A [`Session`] is the single owner of everything one activation creates:
//! the reserved port, the analysis process, the bridge and the protocol
//! client. It sequences the sidecar components through
//!
//! ```text
//! Idle -> PortAllocating -> Spawning -> Connecting -> Bridged -> Terminating -> Terminated
//!                                          |             ^
//!                                          +-> Degraded -+
//! ```
//!
//! `Terminated` is absorbing; a new activation needs a new session.
//!
//! # Example
//!
//! ```ignore
//! use mro_lens::{Session, SessionConfig};
//!
//! let mut session = Session::new(SessionConfig::default());
//! let client = session.activate().await?;
//! // ... serve requests with `client` ...
//! session.deactivate().await;
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::lsp::{MroClient, MroClientConfig};
use crate::sidecar::{
    self, AllocatedPort, Bridge, BridgeHandle, CloseReason, ConnectOutcome, ConnectPolicy,
    PortAllocator, ProcessExit, SpawnSpec, SupervisedProcess, TerminatePolicy,
};

/// Phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Created, not yet activated.
    Idle,
    /// Choosing the port the analysis process will listen on.
    PortAllocating,
    /// Launching the analysis process.
    Spawning,
    /// Retrying the connection to the analysis process.
    Connecting,
    /// The connection deadline passed; continuing without a connection.
    Degraded,
    /// Steady state, with or without a working connection.
    Bridged,
    /// Tearing down.
    Terminating,
    /// Done. Absorbing.
    Terminated,
}

impl Phase {
    /// Lower-case name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PortAllocating => "port-allocating",
            Self::Spawning => "spawning",
            Self::Connecting => "connecting",
            Self::Degraded => "degraded",
            Self::Bridged => "bridged",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    /// Whether `next` may directly follow this phase.
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::{
            Bridged, Connecting, Degraded, Idle, PortAllocating, Spawning, Terminated, Terminating,
        };
        matches!(
            (self, next),
            (Idle, PortAllocating | Terminated)
                | (PortAllocating, Spawning | Terminating)
                | (Spawning, Connecting | Terminating)
                | (Connecting, Bridged | Degraded | Terminating)
                | (Degraded, Bridged | Terminating)
                | (Bridged, Terminating)
                | (Terminating, Terminated)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current phase plus the time each phase was entered.
#[derive(Debug, Clone)]
pub struct LifecycleState {
    history: Vec<(Phase, Instant)>,
}

impl LifecycleState {
    fn new() -> Self {
        Self {
            history: vec![(Phase::Idle, Instant::now())],
        }
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        self.history.last().map_or(Phase::Idle, |(phase, _)| *phase)
    }

    /// When the current phase was entered.
    pub fn entered_at(&self) -> Option<Instant> {
        self.history.last().map(|(_, at)| *at)
    }

    /// Every phase entered so far, oldest first.
    pub fn history(&self) -> &[(Phase, Instant)] {
        &self.history
    }

    /// Phases entered so far, without timestamps.
    pub fn phases(&self) -> Vec<Phase> {
        self.history.iter().map(|(phase, _)| *phase).collect()
    }

    fn advance(&mut self, next: Phase) {
        let current = self.phase();
        debug_assert!(
            current.can_advance_to(next),
            "illegal phase transition {current} -> {next}"
        );
        self.history.push((next, Instant::now()));
    }
}

/// Why [`Session::run_until_shutdown`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Deactivation was requested through the cancellation token.
    Requested,
    /// The analysis process exited on its own.
    ProcessExited(ProcessExit),
}

/// One activation of the analysis sidecar.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    ports: PortAllocator,
    state: LifecycleState,
    phase_tx: watch::Sender<Phase>,
    cancel: CancellationToken,
    port: Option<AllocatedPort>,
    process: Option<SupervisedProcess>,
    bridge: Option<BridgeHandle>,
    client: Option<MroClient>,
    pid: Option<u32>,
    degraded: bool,
    terminated_cleanly: bool,
}

impl Session {
    /// Creates an idle session drawing ports from the process-wide allocator,
    /// so sessions of one host process never receive the same port.
    pub fn new(config: SessionConfig) -> Self {
        let ports = PortAllocator::shared(config.host);
        Self::with_port_allocator(config, ports)
    }

    /// Creates an idle session drawing ports from `ports`. Sessions only avoid
    /// each other's ports when they share an allocator.
    pub fn with_port_allocator(config: SessionConfig, ports: PortAllocator) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        Self {
            config,
            ports,
            state: LifecycleState::new(),
            phase_tx,
            cancel: CancellationToken::new(),
            port: None,
            process: None,
            bridge: None,
            client: None,
            pid: None,
            degraded: false,
            terminated_cleanly: false,
        }
    }

    /// The configuration the session runs with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Phase history.
    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    /// A receiver observing phase changes.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Token that, once cancelled, stops connection retries and ends
    /// [`Session::run_until_shutdown`]. Hand it to signal handlers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The protocol client, once bridged.
    pub fn client(&self) -> Option<MroClient> {
        self.client.clone()
    }

    /// Port reserved for the analysis process, while the session holds it.
    pub fn port(&self) -> Option<u16> {
        self.port.as_ref().map(AllocatedPort::port)
    }

    /// Pid of the analysis process, once spawned.
    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the session runs without a working connection.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Brings the session from `Idle` to `Bridged`.
    ///
    /// Failing to connect in time is not an error: the session enters
    /// `Degraded` and the returned client fails every request fast. Every
    /// error path terminates whatever was already spawned and leaves the
    /// session `Terminated`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AlreadyActive`] if the session is past `Idle`
    /// - [`SessionError::SessionEnded`] if the session is `Terminated`
    /// - [`SessionError::PortExhausted`], [`SessionError::SpawnFailure`] or
    ///   [`SessionError::UnexpectedProcessExit`] when startup fails
    /// - [`SessionError::Cancelled`] if the cancellation token fired first
    pub async fn activate(&mut self) -> Result<MroClient, SessionError> {
        match self.phase() {
            Phase::Idle => {}
            Phase::Terminated => return Err(SessionError::SessionEnded),
            other => return Err(SessionError::AlreadyActive(other.to_string())),
        }

        match self.start().await {
            Ok(client) => Ok(client),
            Err(e) => {
                match &e {
                    SessionError::Cancelled => info!("activation cancelled, tearing down"),
                    other => error!(error = %other, "session failed to start"),
                }
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Waits until deactivation is requested or the analysis process dies,
    /// then tears the session down.
    ///
    /// A closed connection alone does not end the session: the process is
    /// still owned and must be terminated on deactivation.
    pub async fn run_until_shutdown(&mut self) -> ShutdownReason {
        let reason = match (self.phase(), self.process.as_ref()) {
            (Phase::Bridged, Some(process)) => {
                let mut bridge_reported = false;
                loop {
                    tokio::select! {
                        () = self.cancel.cancelled() => break ShutdownReason::Requested,
                        exit = process.exited() => break ShutdownReason::ProcessExited(exit),
                        reason = bridge_closed(self.bridge.as_ref()), if !bridge_reported => {
                            warn!(%reason, "connection to analysis process lost");
                            bridge_reported = true;
                        }
                    }
                }
            }
            _ => ShutdownReason::Requested,
        };

        if let ShutdownReason::ProcessExited(exit) = reason {
            let err = SessionError::UnexpectedProcessExit(exit.to_string());
            error!(error = %err, "tearing down session");
        }
        self.teardown().await;
        reason
    }

    /// Tears the session down. Idempotent.
    ///
    /// Returns `true` when the analysis process group was confirmed dead and
    /// `false` when the termination wait ran out; the session is
    /// `Terminated` either way.
    pub async fn deactivate(&mut self) -> bool {
        self.cancel.cancel();
        self.teardown().await
    }

    async fn start(&mut self) -> Result<MroClient, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        self.enter(Phase::PortAllocating);
        let allocated = self.ports.allocate(&self.config.preferred_ports)?;
        let port = allocated.port();
        self.port = Some(allocated);

        self.enter(Phase::Spawning);
        let spec = SpawnSpec {
            executable: self.config.executable.clone(),
            args: self.config.args.clone(),
            working_dir: self.config.working_dir.clone(),
        };
        let process = sidecar::spawn(&spec, port)?;
        self.pid = Some(process.pid());

        self.enter(Phase::Connecting);
        let remote = SocketAddr::new(self.config.host, port);
        let policy = ConnectPolicy {
            backoff: self.config.connect_backoff(),
            overall_timeout: self.config.connect_timeout(),
        };
        let connected = tokio::select! {
            outcome = sidecar::connect(remote, policy, &self.cancel) => Ok(outcome),
            exit = process.exited() => Err(exit),
        };
        self.process = Some(process);

        let connection = match connected {
            Err(exit) => return Err(SessionError::UnexpectedProcessExit(exit.to_string())),
            Ok(ConnectOutcome::Cancelled) => return Err(SessionError::Cancelled),
            Ok(ConnectOutcome::TimedOut { attempts, elapsed }) => {
                let timeout = SessionError::ConnectTimeout { port, elapsed };
                warn!(error = %timeout, attempts, "continuing without analysis server");
                None
            }
            Ok(ConnectOutcome::Connected { connection, .. }) => Some(connection),
        };

        let client_config = MroClientConfig {
            workspace_root: self.config.workspace_root.clone(),
            init_timeout: self.config.init_timeout(),
            request_timeout: self.config.request_timeout(),
        };

        let linked = match connection {
            None => None,
            Some(connection) => {
                let handshake = MroClient::connect(Bridge::new(connection), client_config.clone());
                tokio::select! {
                    () = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                    result = handshake => match result {
                        Ok(linked) => Some(linked),
                        Err(e) => {
                            warn!(error = %e, "analysis server handshake failed, continuing without it");
                            None
                        }
                    },
                }
            }
        };

        let client = match linked {
            Some((client, bridge)) => {
                self.bridge = Some(bridge);
                client
            }
            None => {
                self.degraded = true;
                self.enter(Phase::Degraded);
                MroClient::degraded(client_config)
            }
        };

        self.enter(Phase::Bridged);
        info!(port, pid = self.pid, degraded = self.degraded, "session active");
        self.client = Some(client.clone());
        Ok(client)
    }

    /// Everything after `Terminating` is entered tolerates being dropped at an
    /// await point: a later call resumes with whatever is still owned.
    async fn teardown(&mut self) -> bool {
        match self.phase() {
            Phase::Terminated => return self.terminated_cleanly,
            Phase::Idle => {
                self.terminated_cleanly = true;
                self.enter(Phase::Terminated);
                return true;
            }
            Phase::Terminating => debug!("resuming interrupted teardown"),
            _ => self.enter(Phase::Terminating),
        }

        let policy = TerminatePolicy {
            max_wait: self.config.terminate_timeout(),
            poll_interval: self.config.terminate_poll(),
            kill_grace: self.config.kill_grace(),
        };

        if let Some(client) = self.client.take() {
            let process_alive = self.process.as_ref().is_some_and(|p| !p.has_exited());
            if process_alive && client.is_connected() {
                match tokio::time::timeout(policy.poll_interval, client.shutdown()).await {
                    Ok(Ok(())) => debug!("analysis server acknowledged shutdown"),
                    Ok(Err(e)) => debug!(error = %e, "analysis server shutdown failed"),
                    Err(_) => debug!("analysis server did not acknowledge shutdown in time"),
                }
            }
            client.close();
        }

        if let Some(bridge) = self.bridge.take() {
            bridge.abort();
        }

        let confirmed = match self.process.as_mut() {
            Some(process) => {
                let confirmed = process.terminate(policy).await;
                if !confirmed {
                    let err = SessionError::TerminationTimeout {
                        pid: process.pid(),
                        waited: policy.max_wait,
                    };
                    error!(
                        error = %err,
                        pgid = process.process_group(),
                        "marking session terminated with a live process group"
                    );
                }
                confirmed
            }
            None => true,
        };
        self.process = None;

        if let Some(port) = self.port.take() {
            debug!(port = port.port(), "released port");
        }

        self.terminated_cleanly = confirmed;
        self.enter(Phase::Terminated);
        confirmed
    }

    fn enter(&mut self, next: Phase) {
        let previous = self.state.phase();
        self.state.advance(next);
        self.phase_tx.send_replace(next);
        debug!(from = %previous, phase = %next, "session phase changed");
    }
}

async fn bridge_closed(bridge: Option<&BridgeHandle>) -> CloseReason {
    match bridge {
        Some(bridge) => bridge.closed().await,
        None => std::future::pending().await,
    }
}
