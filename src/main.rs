//! mro-lens - Entry Point
//!
//! Starts an MRO analysis sidecar, runs one editor action against it, and
//! tears the sidecar down again. Sidecar failures are logged and degrade the
//! output to nothing; they never make the process fail.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use mro_lens::{Providers, Session, SessionConfig, ShutdownReason};

/// Shows Python method resolution order via an analysis sidecar.
#[derive(Parser, Debug)]
#[command(name = "mro-lens")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Executable of the analysis server.
    #[arg(long)]
    server: Option<String>,

    /// Arguments for the analysis server, placed before the port.
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    server_args: Vec<String>,

    /// Working directory of the analysis server.
    #[arg(long)]
    server_dir: Option<PathBuf>,

    /// Workspace root announced to the analysis server.
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Preferred ports, tried in order.
    #[arg(long = "port", value_name = "PORT")]
    ports: Vec<u16>,

    /// Overall connection deadline in milliseconds.
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    /// Upper bound on waiting for the analysis server to die, in milliseconds.
    #[arg(long)]
    terminate_timeout_ms: Option<u64>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every class of a file with its resolution order.
    Lens {
        /// Python file to analyse.
        file: PathBuf,
    },
    /// Print the resolution order of the class named at a position.
    Hover {
        /// Python file to analyse.
        file: PathBuf,
        /// 1-indexed line.
        line: u32,
        /// 1-indexed column.
        column: u32,
    },
    /// Keep the sidecar running until interrupted.
    Serve,
}

impl Args {
    /// Parses the log level string into a tracing Level.
    fn parse_log_level(&self) -> Result<Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(Level::TRACE),
            "debug" => Ok(Level::DEBUG),
            "info" => Ok(Level::INFO),
            "warn" => Ok(Level::WARN),
            "error" => Ok(Level::ERROR),
            other => anyhow::bail!("invalid log level: {}", other),
        }
    }

    /// Loads the config file, if any, and applies flag overrides.
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)
                .with_context(|| format!("failed to load config: {}", path.display()))?,
            None => SessionConfig::default(),
        };

        if let Some(server) = &self.server {
            config.executable.clone_from(server);
        }
        if !self.server_args.is_empty() {
            config.args.clone_from(&self.server_args);
        }
        if let Some(dir) = &self.server_dir {
            config.working_dir.clone_from(dir);
        }
        if let Some(workspace) = &self.workspace {
            config.workspace_root.clone_from(workspace);
        }
        if !self.ports.is_empty() {
            config.preferred_ports.clone_from(&self.ports);
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout_ms = ms;
        }
        if let Some(ms) = self.terminate_timeout_ms {
            config.terminate_timeout_ms = ms;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Initializes the tracing subscriber for logging.
fn init_tracing(level: Level, json: bool) -> Result<()> {
    // Create an env filter that respects RUST_LOG but has a default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("mro_lens={level},async_lsp={level}"))
    });

    // stdout carries command output, logs go to stderr
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()
    };
    result.context("failed to initialize tracing subscriber")?;

    Ok(())
}

/// Cancels `token` on Ctrl-C or, on Unix, SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("interrupted"),
                        _ = sigterm.recv() => info!("received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("interrupted");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupted");
        }
        token.cancel();
    });
}

async fn run_command(command: &Command, providers: &Providers) {
    match command {
        Command::Lens { file } => {
            for class in providers.class_chains(file).await {
                let (line, column) = class.start;
                println!("{line}:{column} {}", class.chain.join(" -> "));
            }
        }
        Command::Hover { file, line, column } => {
            let chain = providers.hover_chain(file, *line, *column).await;
            if !chain.is_empty() {
                println!("{}", chain.join(" -> "));
            }
        }
        Command::Serve => {}
    }
}

/// Main entry point.
#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = args.parse_log_level()?;
    init_tracing(log_level, args.log_json)?;

    let config = args.session_config()?;
    info!(
        executable = %config.executable,
        working_dir = %config.working_dir.display(),
        "starting mro-lens"
    );

    let mut session = Session::new(config);
    cancel_on_signal(session.cancellation_token());

    let client = match session.activate().await {
        Ok(client) => client,
        Err(e) => {
            // already torn down; the host keeps running
            error!(error = %e, "analysis session unavailable");
            return Ok(());
        }
    };
    let providers = Providers::new(client);

    match &args.command {
        Command::Serve => {
            info!(port = session.port(), "serving until interrupted");
            match session.run_until_shutdown().await {
                ShutdownReason::Requested => info!("session stopped"),
                ShutdownReason::ProcessExited(exit) => warn!(%exit, "analysis server went away"),
            }
        }
        command => {
            let token = session.cancellation_token();
            tokio::select! {
                () = run_command(command, &providers) => {}
                () = token.cancelled() => {}
            }
            if !session.deactivate().await {
                warn!("analysis server may still be running");
            }
        }
    }

    info!("mro-lens shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_log_level() {
        let args = Args::parse_from(["mro-lens", "--log-level", "debug", "serve"]);
        assert_eq!(args.parse_log_level().unwrap(), Level::DEBUG);

        let args = Args::parse_from(["mro-lens", "--log-level", "loud", "serve"]);
        assert!(args.parse_log_level().is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "mro-lens",
            "--server",
            "pipenv",
            "--server-arg",
            "run",
            "--server-arg",
            "python",
            "--port",
            "4100",
            "--connect-timeout-ms",
            "500",
            "hover",
            "diamond.py",
            "4",
            "7",
        ]);
        let config = args.session_config().unwrap();
        assert_eq!(config.executable, "pipenv");
        assert_eq!(config.args, vec!["run", "python"]);
        assert_eq!(config.preferred_ports, vec![4100]);
        assert_eq!(config.connect_timeout_ms, 500);
        assert!(matches!(
            args.command,
            Command::Hover {
                line: 4,
                column: 7,
                ..
            }
        ));
    }

    #[test]
    fn test_zero_timeout_flag_rejected() {
        let args = Args::parse_from(["mro-lens", "--terminate-timeout-ms", "0", "serve"]);
        assert!(args.session_config().is_err());
    }
}
