//! Host-facing providers and the `pythonMRO.showMRO` command.
//!
//! Nothing here returns an error. Failures of the analysis server, including
//! a session running degraded, are logged and turned into empty results so
//! the host never sees them.

use std::fmt;
use std::path::Path;

use lsp_types::{CodeLens, Range};
use tracing::{debug, warn};

use crate::lsp::MroClient;
use crate::lsp::types::{
    SHOW_MRO_COMMAND, chain_from_hover, chain_from_lens, chain_from_lens_data, from_lsp_position,
    to_lsp_position,
};

/// Text shown when the command is invoked without a chain.
pub const NO_MRO_MESSAGE: &str = "No MRO List provided!";

/// A transient message for the host to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The message text.
    pub message: String,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Handler of the `pythonMRO.showMRO` command.
pub fn show_mro(content: Option<&str>) -> Notification {
    Notification {
        message: content.unwrap_or(NO_MRO_MESSAGE).to_string(),
    }
}

/// Runs the command attached to a resolved lens.
///
/// Returns `None` if the lens carries no command or a command other than
/// `pythonMRO.showMRO`.
pub fn execute_lens_command(lens: &CodeLens) -> Option<Notification> {
    let command = lens.command.as_ref()?;
    if command.command != SHOW_MRO_COMMAND {
        debug!(command = %command.command, "ignoring unknown command");
        return None;
    }
    let content = command
        .arguments
        .as_ref()
        .and_then(|args| args.first())
        .and_then(|arg| arg.as_str());
    Some(show_mro(content))
}

/// A class found in a document together with its ancestor chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLens {
    /// Span of the class name, 0-indexed.
    pub range: Range,
    /// Start of the class name as 1-indexed (line, column).
    pub start: (u32, u32),
    /// The class itself first, `object` last.
    pub chain: Vec<String>,
}

impl ClassLens {
    /// Name of the class.
    pub fn name(&self) -> Option<&str> {
        self.chain.first().map(String::as_str)
    }
}

/// Code-lens and hover providers over an [`MroClient`].
#[derive(Debug, Clone)]
pub struct Providers {
    client: MroClient,
}

impl Providers {
    /// Wraps a client.
    pub fn new(client: MroClient) -> Self {
        Self { client }
    }

    /// The wrapped client.
    pub fn client(&self) -> &MroClient {
        &self.client
    }

    /// Unresolved lenses for every class in `path`, in source order.
    pub async fn class_lenses(&self, path: &Path) -> Vec<CodeLens> {
        let uri = match self.client.sync_file(path).await {
            Ok(uri) => uri,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not sync document");
                return Vec::new();
            }
        };
        match self.client.code_lenses(&uri).await {
            Ok(lenses) => lenses,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "code lens request failed");
                Vec::new()
            }
        }
    }

    /// Resolves a lens. On failure the lens is returned as given.
    pub async fn resolve(&self, lens: CodeLens) -> CodeLens {
        match self.client.resolve_code_lens(lens.clone()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(error = %e, "code lens resolution failed");
                lens
            }
        }
    }

    /// Every class in `path` with its resolved chain.
    pub async fn class_chains(&self, path: &Path) -> Vec<ClassLens> {
        let mut classes = Vec::new();
        for lens in self.class_lenses(path).await {
            let resolved = self.resolve(lens).await;
            let chain = chain_from_lens(&resolved)
                .or_else(|| chain_from_lens_data(&resolved))
                .unwrap_or_default();
            classes.push(ClassLens {
                range: resolved.range,
                start: from_lsp_position(resolved.range.start),
                chain,
            });
        }
        classes
    }

    /// The chain of the class whose name is at the 1-indexed `line`/`column`,
    /// or an empty chain.
    pub async fn hover_chain(&self, path: &Path, line: u32, column: u32) -> Vec<String> {
        let position = match to_lsp_position(line, column) {
            Ok(position) => position,
            Err(e) => {
                debug!(error = %e, "hover outside the document");
                return Vec::new();
            }
        };
        let uri = match self.client.sync_file(path).await {
            Ok(uri) => uri,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not sync document");
                return Vec::new();
            }
        };
        match self.client.hover(&uri, position).await {
            Ok(Some(hover)) => chain_from_hover(&hover),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "hover request failed");
                Vec::new()
            }
        }
    }
}
