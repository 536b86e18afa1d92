//! Protocol client for the MRO analysis server.
//!
//! # Architecture
//!
//! - `client`: the JSON-RPC client, its document store and request deadlines
//! - `types`: conversions between editor positions, paths and protocol values,
//!   and extraction of ancestor chains from lens and hover payloads
//!
//! # Usage
//!
//! ```ignore
//! use mro_lens::lsp::MroClient;
//!
//! let uri = client.sync_file(path).await?;
//! let hover = client.hover(&uri, position).await?;
//! ```

pub mod client;
pub mod types;

use crate::error::LspError;

/// Result type for LSP operations.
pub type LspResult<T> = std::result::Result<T, LspError>;

pub use client::{MroClient, MroClientConfig, PendingRequest};
pub use lsp_types::{CodeLens, Hover, Position, Url};
