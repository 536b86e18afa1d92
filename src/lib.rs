//! mro-lens
//!
//! Supervises a Python MRO analysis server running as a sidecar process and
//! bridges editor requests to it, so that the method resolution order of each
//! class can be shown as code lenses and hover text.
//!
//! # Overview
//!
//! This library provides:
//! - Port selection, process-group supervision and connection retries for the
//!   sidecar
//! - A byte bridge and an LSP client speaking the analysis server's protocol
//! - A session coordinator that sequences startup and bounded teardown
//! - Providers that turn every failure into an empty result for the host
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                ┌──────────────────┐
//! │      Host       │   providers    │     Session      │
//! │ (editor / CLI)  │◄──────────────►│  (coordinator)   │
//! └─────────────────┘                └────────┬─────────┘
//!                                             │ spawn / kill -pgid
//!                                      ┌──────▼──────┐
//!                                      │  MroClient  │
//!                                      └──────┬──────┘
//!                                             │ JSON-RPC over TCP
//!                                      ┌──────▼────────┐
//!                                      │ MRO analysis  │
//!                                      │    server     │
//!                                      └───────────────┘
//! ```
//!
//! # Modules
//!
//! - [`error`] - Error types for the entire crate
//! - [`config`] - Session policy constants
//! - [`sidecar`] - Port, process, connection and bridge plumbing
//! - [`lsp`] - Client for the analysis server
//! - [`session`] - Lifecycle coordinator
//! - [`editor`] - Host-facing providers and command
//!
//! # Example
//!
//! ```ignore
//! use mro_lens::{Providers, Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut session = Session::new(SessionConfig::default());
//!     let providers = Providers::new(session.activate().await?);
//!
//!     for class in providers.class_chains("diamond.py".as_ref()).await {
//!         println!("{}", class.chain.join(" -> "));
//!     }
//!
//!     session.deactivate().await;
//!     Ok(())
//! }
//! ```

// Enforce documentation and other quality attributes
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are too strict
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod editor;
pub mod error;
pub mod lsp;
pub mod session;
pub mod sidecar;

// Re-export commonly used types at the crate root
pub use config::SessionConfig;
pub use editor::{ClassLens, Notification, Providers, show_mro};
pub use error::{Error, Result};
pub use session::{Phase, Session, ShutdownReason};
