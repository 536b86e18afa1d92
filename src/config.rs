//! Session configuration.
//!
//! Every policy constant of a session (preferred ports, connect backoff and
//! deadline, termination wait, request timeouts) lives here so it can be
//! changed from a JSON file or command-line flags without touching code.
//!
//! ```json
//! {
//!   "executable": "pipenv",
//!   "args": ["run", "python", "-m", "python_server"],
//!   "preferredPorts": [3000, 3001],
//!   "connectTimeoutMs": 5000
//! }
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration of one sidecar session.
///
/// Durations are stored in milliseconds so the JSON form stays flat; use the
/// accessor methods to get [`Duration`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionConfig {
    /// Executable of the analysis process.
    pub executable: String,
    /// Arguments placed before the port argument.
    pub args: Vec<String>,
    /// Working directory of the analysis process (the install root).
    pub working_dir: PathBuf,
    /// Workspace root announced to the analysis process on `initialize`.
    pub workspace_root: PathBuf,
    /// Address the analysis process listens on.
    pub host: IpAddr,
    /// Ports tried in order before falling back to an ephemeral one.
    pub preferred_ports: Vec<u16>,
    /// Pause between two connection attempts.
    pub connect_backoff_ms: u64,
    /// Overall deadline for establishing the connection.
    pub connect_timeout_ms: u64,
    /// Upper bound on waiting for the process group to die.
    pub terminate_timeout_ms: u64,
    /// Interval between two checks while waiting for termination.
    pub terminate_poll_ms: u64,
    /// Time after SIGTERM before the group is sent SIGKILL.
    pub kill_grace_ms: u64,
    /// Deadline for the `initialize` handshake.
    pub init_timeout_ms: u64,
    /// Deadline for every other request.
    pub request_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable: "python3".to_string(),
            args: vec!["-m".to_string(), "python_server".to_string()],
            working_dir: PathBuf::from("."),
            workspace_root: PathBuf::from("."),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            preferred_ports: vec![3000, 3001, 3002],
            connect_backoff_ms: 1_000,
            connect_timeout_ms: 3_000,
            terminate_timeout_ms: 10_000,
            terminate_poll_ms: 1_000,
            kill_grace_ms: 3_000,
            init_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    /// Creates a new builder starting from the defaults.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed JSON or unknown fields and
    /// [`ConfigError::Invalid`] when a value fails validation.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise the
    /// same errors as [`SessionConfig::from_json_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Checks values that would make a session unusable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executable.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "executable",
                reason: "must not be empty".to_string(),
            });
        }
        if self.preferred_ports.contains(&0) {
            return Err(ConfigError::Invalid {
                field: "preferredPorts",
                reason: "port 0 is not a valid candidate".to_string(),
            });
        }
        let non_zero = [
            ("connectBackoffMs", self.connect_backoff_ms),
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("terminateTimeoutMs", self.terminate_timeout_ms),
            ("terminatePollMs", self.terminate_poll_ms),
            ("initTimeoutMs", self.init_timeout_ms),
            ("requestTimeoutMs", self.request_timeout_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Pause between two connection attempts.
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    /// Overall deadline for establishing the connection.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Upper bound on waiting for the process group to die.
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    /// Interval between two termination checks.
    pub fn terminate_poll(&self) -> Duration {
        Duration::from_millis(self.terminate_poll_ms)
    }

    /// Time after SIGTERM before SIGKILL is sent.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Deadline for the `initialize` handshake.
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Deadline for every other request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Sets the analysis executable.
    #[must_use]
    pub fn executable(mut self, executable: impl Into<String>) -> Self {
        self.config.executable = executable.into();
        self
    }

    /// Sets the arguments placed before the port.
    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the working directory of the analysis process.
    #[must_use]
    pub fn working_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.working_dir = path.into();
        self
    }

    /// Sets the workspace root announced on `initialize`.
    #[must_use]
    pub fn workspace_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.workspace_root = path.into();
        self
    }

    /// Sets the preferred port candidates.
    #[must_use]
    pub fn preferred_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.config.preferred_ports = ports.into_iter().collect();
        self
    }

    /// Sets the connection backoff and overall deadline.
    #[must_use]
    pub fn connect_policy(mut self, backoff: Duration, timeout: Duration) -> Self {
        self.config.connect_backoff_ms = duration_ms(backoff);
        self.config.connect_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the termination wait, poll interval and SIGKILL grace.
    #[must_use]
    pub fn terminate_policy(mut self, timeout: Duration, poll: Duration, grace: Duration) -> Self {
        self.config.terminate_timeout_ms = duration_ms(timeout);
        self.config.terminate_poll_ms = duration_ms(poll);
        self.config.kill_grace_ms = duration_ms(grace);
        self
    }

    /// Sets the initialization timeout.
    #[must_use]
    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.config.init_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = duration_ms(timeout);
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// Same as [`SessionConfig::validate`].
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
