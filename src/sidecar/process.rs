//! Supervision of the external analysis process.
//!
//! The process is started in its own process group so that a single signal to
//! the group reaches every descendant it forks. Its exit is observed by a
//! background task and published on a watch channel; stdout and stderr are
//! forwarded line by line to the tracing subscriber.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use futures::io::{AsyncBufReadExt, AsyncRead, BufReader};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;

/// What to launch and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Executable of the analysis process.
    pub executable: String,
    /// Arguments placed before the port.
    pub args: Vec<String>,
    /// Working directory of the process.
    pub working_dir: PathBuf,
}

/// How the supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited with the given status.
    Exited(ExitStatus),
    /// The exit status could not be collected.
    Lost,
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(status) => write!(f, "{status}"),
            Self::Lost => f.write_str("exit status unavailable"),
        }
    }
}

/// Bounds on [`SupervisedProcess::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminatePolicy {
    /// Upper bound on the whole termination.
    pub max_wait: Duration,
    /// Interval between two checks of the exit flag.
    pub poll_interval: Duration,
    /// Time after the polite signal before the group is killed outright.
    pub kill_grace: Duration,
}

/// Signal delivered by [`kill_process_tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSignal {
    /// Ask the processes to stop (SIGTERM).
    Terminate,
    /// Stop the processes unconditionally (SIGKILL).
    Kill,
}

/// Signals a process and all of its descendants.
///
/// On Unix this targets the process group `-pid`, which requires the process
/// to lead its own group (see [`spawn`]). On Windows it runs
/// `taskkill /t /f /pid <pid>`, which walks the child tree and ignores the
/// signal kind. A group that no longer exists is not an error.
///
/// # Errors
///
/// Returns an error if the pid is not a valid group id or the signal could not
/// be delivered.
pub fn kill_process_tree(pid: u32, signal: TreeSignal) -> io::Result<()> {
    #[cfg(unix)]
    {
        let pgid = libc::pid_t::try_from(pid)
            .ok()
            .filter(|pgid| *pgid > 1)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pgid {pid}"))
            })?;
        let signo = match signal {
            TreeSignal::Terminate => libc::SIGTERM,
            TreeSignal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
        // addresses the process group led by `pgid`.
        let rc = unsafe { libc::kill(-pgid, signo) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    {
        let _ = signal;
        let output = std::process::Command::new("taskkill")
            .args(["/t", "/f", "/pid", &pid.to_string()])
            .output()?;
        // 128: no such process
        if !output.status.success() && output.status.code() != Some(128) {
            return Err(io::Error::other(format!(
                "taskkill failed for pid {pid} (exit {:?})",
                output.status.code()
            )));
        }
        Ok(())
    }
}

/// The running analysis process.
///
/// Dropping a process that was neither terminated nor observed exiting kills
/// its whole group.
#[derive(Debug)]
pub struct SupervisedProcess {
    pid: u32,
    port: u16,
    spec: SpawnSpec,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    signals_sent: u32,
    terminated: bool,
}

/// Launches the analysis process as `<executable> <args..> <port>`.
///
/// The child is detached into its own process group and is not killed when
/// its handle is dropped; [`SupervisedProcess`] owns that responsibility.
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns [`SessionError::SpawnFailure`] if the executable cannot be started.
pub fn spawn(spec: &SpawnSpec, port: u16) -> Result<SupervisedProcess, SessionError> {
    let mut std_cmd = std::process::Command::new(&spec.executable);
    std_cmd
        .args(&spec.args)
        .arg(port.to_string())
        .current_dir(&spec.working_dir);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        std_cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    let mut cmd = async_process::Command::from(std_cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    let mut child = cmd.spawn().map_err(|e| SessionError::SpawnFailure {
        executable: spec.executable.clone(),
        reason: e.to_string(),
    })?;
    let pid = child.id();

    info!(
        pid,
        port,
        executable = %spec.executable,
        working_dir = %spec.working_dir.display(),
        "spawned analysis process"
    );

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(pid, OutputStream::Stdout, stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(pid, OutputStream::Stderr, stderr));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        let exit = match child.status().await {
            Ok(status) => ProcessExit::Exited(status),
            Err(e) => {
                warn!(pid, error = %e, "failed to collect analysis process status");
                ProcessExit::Lost
            }
        };
        info!(pid, %exit, "analysis process exited");
        // sweep descendants before the leader's pid can be reused
        #[cfg(unix)]
        {
            if let Err(e) = kill_process_tree(pid, TreeSignal::Kill) {
                debug!(pid, error = %e, "failed to sweep analysis process group");
            }
        }
        let _ = exit_tx.send(Some(exit));
    });

    Ok(SupervisedProcess {
        pid,
        port,
        spec: spec.clone(),
        exit_rx,
        signals_sent: 0,
        terminated: false,
    })
}

impl SupervisedProcess {
    /// Process id of the analysis process.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Process group id; the process leads its own group.
    pub fn process_group(&self) -> u32 {
        self.pid
    }

    /// Port the process was told to listen on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The launch parameters.
    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }

    /// How the process ended, if it has.
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Whether the process has been observed exiting.
    pub fn has_exited(&self) -> bool {
        self.exit().is_some()
    }

    /// Whether [`SupervisedProcess::terminate`] has confirmed termination.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Number of signals delivered to the process group so far.
    pub fn signals_sent(&self) -> u32 {
        self.signals_sent
    }

    /// Resolves once the process exits.
    pub async fn exited(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(ProcessExit::Lost),
            Err(_) => ProcessExit::Lost,
        };
        exit
    }

    /// Terminates the whole process group within `policy.max_wait`.
    ///
    /// Sends SIGTERM to the group, escalates to SIGKILL after
    /// `policy.kill_grace`, and checks for exit every `policy.poll_interval`.
    /// Descendants are swept by the task that reaps the leader, so a group
    /// whose leader already exited is never signalled here. Returns `true` on
    /// confirmed termination and
    /// `false` when `max_wait` elapsed first. Calling it again after a
    /// confirmed termination returns `true` without signalling.
    pub async fn terminate(&mut self, policy: TerminatePolicy) -> bool {
        if self.terminated {
            debug!(pid = self.pid, "analysis process already terminated");
            return true;
        }

        let started = Instant::now();
        let deadline = started + policy.max_wait;
        let mut escalated = false;

        if !self.has_exited() {
            info!(pid = self.pid, pgid = self.process_group(), "stopping analysis process group");
            self.signal(TreeSignal::Terminate);
        }

        loop {
            if self.has_exited() {
                self.terminated = true;
                info!(
                    pid = self.pid,
                    elapsed_ms = started.elapsed().as_millis(),
                    "analysis process group terminated"
                );
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                error!(
                    pid = self.pid,
                    pgid = self.process_group(),
                    waited_ms = policy.max_wait.as_millis(),
                    "analysis process group did not terminate in time; it may be leaked"
                );
                return false;
            }

            if !escalated && now.duration_since(started) >= policy.kill_grace {
                warn!(pid = self.pid, "analysis process ignored SIGTERM, sending SIGKILL");
                self.signal(TreeSignal::Kill);
                escalated = true;
            }

            let wait = policy.poll_interval.min(deadline - now);
            let mut rx = self.exit_rx.clone();
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(wait).await;
                    }
                }
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn signal(&mut self, signal: TreeSignal) {
        match kill_process_tree(self.pid, signal) {
            Ok(()) => self.signals_sent += 1,
            Err(e) => warn!(pid = self.pid, ?signal, error = %e, "failed to signal process group"),
        }
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        if !self.terminated && !self.has_exited() {
            warn!(pid = self.pid, "analysis process dropped while running, killing its group");
            let _ = kill_process_tree(self.pid, TreeSignal::Kill);
        }
    }
}

/// Log target of forwarded child output.
const OUTPUT_TARGET: &str = "mro_lens::sidecar";

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

async fn forward_output(pid: u32, stream: OutputStream, output: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(output).lines();
    while let Some(Ok(line)) = lines.next().await {
        match stream {
            OutputStream::Stdout => {
                info!(target: OUTPUT_TARGET, pid, stdout = %line, "analysis process stdout");
            }
            OutputStream::Stderr => {
                warn!(target: OUTPUT_TARGET, pid, stderr = %line, "analysis process stderr");
            }
        }
    }
}
