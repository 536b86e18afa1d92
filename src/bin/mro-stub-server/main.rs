//! mro-stub-server - a small MRO analysis server.
//!
//! Listens on the port given as its last argument and answers the MRO
//! protocol (`initialize`, document sync, `textDocument/codeLens`,
//! `codeLens/resolve`, `textDocument/hover`) from a lexical class scan and a
//! C3 merge. Used as the sidecar in end-to-end tests and for local runs of
//! `mro-lens` without a Python installation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use lsp_types::TextDocumentSyncKind;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod c3;
mod document;
mod scan;
mod server;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SyncMode {
    Full,
    Incremental,
}

impl From<SyncMode> for TextDocumentSyncKind {
    fn from(mode: SyncMode) -> Self {
        match mode {
            SyncMode::Full => TextDocumentSyncKind::FULL,
            SyncMode::Incremental => TextDocumentSyncKind::INCREMENTAL,
        }
    }
}

/// Canned MRO analysis server.
#[derive(Parser, Debug)]
#[command(name = "mro-stub-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,

    /// Document synchronization kind to advertise.
    #[arg(long, value_enum, default_value_t = SyncMode::Incremental)]
    sync: SyncMode,

    /// Wait this long before listening.
    #[arg(long, default_value_t = 0)]
    startup_delay_ms: u64,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Port to listen on.
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mro_stub_server={}", args.log_level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    if args.startup_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    let addr = SocketAddr::new(args.host, args.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    println!("mro-stub-server listening on {addr}");

    let sync = TextDocumentSyncKind::from(args.sync);
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        info!(%peer, "client connected");
        tokio::spawn(async move {
            match server::serve(stream, sync).await {
                Ok(()) => info!(%peer, "client disconnected"),
                Err(e) => warn!(%peer, error = %e, "connection ended"),
            }
        });
    }
}
