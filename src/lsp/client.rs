//! Client for the MRO analysis server.
//!
//! Runs the JSON-RPC main loop over a [`Bridge`] and exposes the handful of
//! requests the analysis server answers: document synchronization, class
//! locations (`textDocument/codeLens`), chain resolution (`codeLens/resolve`)
//! and chain-at-position (`textDocument/hover`).
//!
//! A client built with [`MroClient::degraded`] has no connection at all; every
//! request fails immediately with [`LspError::NotConnected`]. This is what the
//! session hands out when the analysis server never became reachable.
//!
//! # Example
//!
//! ```ignore
//! use mro_lens::lsp::client::{MroClient, MroClientConfig};
//!
//! let (client, bridge_handle) = MroClient::connect(bridge, MroClientConfig::default()).await?;
//! let uri = client.sync_file(Path::new("diamond.py")).await?;
//! for lens in client.code_lenses(&uri).await? {
//!     let resolved = client.resolve_code_lens(lens).await?;
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_lsp::concurrency::ConcurrencyLayer;
use async_lsp::panic::CatchUnwindLayer;
use async_lsp::router::Router;
use async_lsp::tracing::TracingLayer;
use async_lsp::{LanguageServer, ServerSocket};
use lsp_types::{
    ClientCapabilities, ClientInfo, CodeLens, CodeLensClientCapabilities, CodeLensParams,
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams, Hover,
    HoverClientCapabilities, HoverParams, InitializeParams, InitializedParams, MarkupKind,
    PartialResultParams, Position, ServerCapabilities, TextDocumentClientCapabilities,
    TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem,
    TextDocumentPositionParams, TextDocumentSyncCapability, TextDocumentSyncClientCapabilities,
    TextDocumentSyncKind, TraceValue, Url, VersionedTextDocumentIdentifier,
    WorkDoneProgressParams, WorkspaceFolder, notification,
};
use tokio::sync::{Mutex, watch};
use tower::ServiceBuilder;
use tracing::{debug, info, warn};

use crate::error::LspError;
use crate::sidecar::{Bridge, BridgeHandle, CloseReason};

use super::LspResult;
use super::types::{PathToUri, full_range, language_id};

/// Notification handler state. The analysis server sends nothing that needs
/// to be remembered.
#[derive(Debug, Clone, Copy)]
struct ClientState;

/// Configuration for an [`MroClient`].
#[derive(Debug, Clone)]
pub struct MroClientConfig {
    /// Workspace root announced as `rootUri`.
    pub workspace_root: PathBuf,
    /// Timeout for the `initialize` handshake.
    pub init_timeout: Duration,
    /// Timeout for every other request.
    pub request_timeout: Duration,
}

impl Default for MroClientConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            init_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// An in-flight request: what was asked, under which local id, and until when.
///
/// The JSON-RPC layer matches responses to requests by their wire id, so
/// answers may arrive in any order; this record only carries the deadline
/// and keeps the in-flight count honest.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    method: &'static str,
    deadline: Instant,
    in_flight: Arc<AtomicUsize>,
}

impl PendingRequest {
    fn register(id: u64, method: &'static str, timeout: Duration, in_flight: &Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            id,
            method,
            deadline: Instant::now() + timeout,
            in_flight: Arc::clone(in_flight),
        }
    }

    /// Local correlation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The LSP method.
    pub fn method(&self) -> &'static str {
        self.method
    }

    /// Time after which the request is abandoned.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct DocumentState {
    version: i32,
    text: String,
}

#[derive(Debug)]
struct Link {
    socket: ServerSocket,
    capabilities: ServerCapabilities,
    bridge_state: watch::Receiver<Option<CloseReason>>,
}

#[derive(Debug)]
struct Inner {
    config: MroClientConfig,
    link: Option<Link>,
    closed: AtomicBool,
    documents: Mutex<HashMap<Url, DocumentState>>,
    next_request: AtomicU64,
    in_flight: Arc<AtomicUsize>,
}

/// Client for the MRO analysis server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MroClient {
    inner: Arc<Inner>,
}

impl MroClient {
    /// Creates a client without a connection. Every request fails fast.
    pub fn degraded(config: MroClientConfig) -> Self {
        Self::with_link(config, None)
    }

    /// Starts the protocol over `bridge` and performs the `initialize`
    /// handshake.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::Timeout`] or [`LspError::InitializationFailed`] if
    /// the handshake does not complete. The bridge is shut down in that case.
    pub async fn connect(
        bridge: Bridge,
        config: MroClientConfig,
    ) -> LspResult<(Self, BridgeHandle)> {
        let workspace_root = config.workspace_root.canonicalize().map_err(|e| {
            LspError::InitializationFailed(format!(
                "failed to canonicalize workspace root '{}': {e}",
                config.workspace_root.display()
            ))
        })?;
        let root_uri = Url::from_file_path(&workspace_root).map_err(|()| {
            LspError::InitializationFailed(format!(
                "invalid workspace root path: {}",
                workspace_root.display()
            ))
        })?;

        let (main_loop, socket) = async_lsp::MainLoop::new_client(|_server| {
            let mut router = Router::new(ClientState);

            router.notification::<notification::LogMessage>(|_this, params| {
                debug!(message = %params.message, "analysis server log");
                ControlFlow::Continue(())
            });

            router.notification::<notification::ShowMessage>(|_this, params| {
                info!(message = %params.message, "analysis server message");
                ControlFlow::Continue(())
            });

            router.unhandled_notification(|_this, notif| {
                debug!(method = %notif.method, "ignoring notification from analysis server");
                ControlFlow::Continue(())
            });

            ServiceBuilder::new()
                .layer(TracingLayer::default())
                .layer(CatchUnwindLayer::default())
                .layer(ConcurrencyLayer::default())
                .service(router)
        });

        let remote = bridge.remote();
        let handle = bridge.spawn(move |reader, writer| main_loop.run_buffered(reader, writer));

        #[allow(deprecated)]
        let init_params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: Some(root_uri.clone()),
            workspace_folders: Some(vec![WorkspaceFolder {
                uri: root_uri,
                name: workspace_root
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("workspace")
                    .to_string(),
            }]),
            capabilities: ClientCapabilities {
                text_document: Some(TextDocumentClientCapabilities {
                    synchronization: Some(TextDocumentSyncClientCapabilities {
                        dynamic_registration: Some(false),
                        will_save: Some(false),
                        will_save_wait_until: Some(false),
                        did_save: Some(false),
                    }),
                    hover: Some(HoverClientCapabilities {
                        dynamic_registration: Some(false),
                        content_format: Some(vec![MarkupKind::PlainText]),
                    }),
                    code_lens: Some(CodeLensClientCapabilities {
                        dynamic_registration: Some(false),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            trace: Some(TraceValue::Off),
            client_info: Some(ClientInfo {
                name: "mro-lens".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            work_done_progress_params: WorkDoneProgressParams::default(),
            ..Default::default()
        };

        let mut init_socket = socket.clone();
        let init_result = tokio::time::timeout(config.init_timeout, init_socket.initialize(init_params))
            .await
            .map_err(|_| {
                handle.abort();
                LspError::Timeout(config.init_timeout)
            })?
            .map_err(|e| {
                handle.abort();
                LspError::InitializationFailed(format!("initialize request failed: {e}"))
            })?;

        init_socket.initialized(InitializedParams {}).map_err(|e| {
            handle.abort();
            LspError::InitializationFailed(format!("initialized notification failed: {e}"))
        })?;

        info!(
            %remote,
            code_lens = init_result.capabilities.code_lens_provider.is_some(),
            hover = init_result.capabilities.hover_provider.is_some(),
            "analysis server initialized"
        );

        let link = Link {
            socket,
            capabilities: init_result.capabilities,
            bridge_state: handle.subscribe(),
        };
        Ok((Self::with_link(config, Some(link)), handle))
    }

    fn with_link(config: MroClientConfig, link: Option<Link>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                link,
                closed: AtomicBool::new(false),
                documents: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(1),
                in_flight: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Whether the client ever had a connection.
    pub fn is_degraded(&self) -> bool {
        self.inner.link.is_none()
    }

    /// Whether requests can currently reach the analysis server.
    pub fn is_connected(&self) -> bool {
        self.socket().is_ok()
    }

    /// Capabilities advertised by the analysis server.
    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.inner.link.as_ref().map(|link| &link.capabilities)
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Stops forwarding anything to the analysis server.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Sends `shutdown` and `exit`, then closes the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the `shutdown` request fails; the client is closed
    /// regardless.
    pub async fn shutdown(&self) -> LspResult<()> {
        let result = match self.socket() {
            Ok(mut socket) => {
                let shutdown = socket.shutdown(());
                let outcome = self.request("shutdown", shutdown).await;
                if outcome.is_ok() {
                    if let Err(e) = socket.exit(()) {
                        debug!(error = %e, "exit notification failed");
                    }
                }
                outcome
            }
            Err(LspError::NotConnected | LspError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        };
        self.close();
        result
    }

    // Document synchronization

    /// Opens `path`, or re-sends its content if it is already open and changed.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::DocumentNotFound`] if the file cannot be read, or the
    /// error of the underlying notification.
    pub async fn sync_file(&self, path: &Path) -> LspResult<Url> {
        let uri = path.to_lsp_uri()?;
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            LspError::DocumentNotFound(format!("failed to read '{}': {}", path.display(), e))
        })?;

        let unchanged = self
            .inner
            .documents
            .lock()
            .await
            .get(&uri)
            .map(|doc| doc.text == text);
        match unchanged {
            None => self.did_open(uri.clone(), language_id(path), text).await?,
            Some(false) => self.did_change(&uri, text).await?,
            Some(true) => {}
        }
        Ok(uri)
    }

    /// Sends `textDocument/didOpen` and tracks the document.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected.
    pub async fn did_open(&self, uri: Url, language_id: &str, text: String) -> LspResult<()> {
        let mut socket = self.socket()?;
        let mut documents = self.inner.documents.lock().await;

        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: language_id.to_string(),
                version: 0,
                text: text.clone(),
            },
        };
        socket
            .did_open(params)
            .map_err(|e| LspError::RequestFailed(format!("didOpen notification failed: {e}")))?;

        debug!(%uri, "opened document");
        documents.insert(uri, DocumentState { version: 0, text });
        Ok(())
    }

    /// Replaces the content of an open document.
    ///
    /// With incremental sync the previous text is replaced through a single
    /// ranged change; with full sync the text is sent as is.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::DocumentNotFound`] if the document was never opened.
    pub async fn did_change(&self, uri: &Url, text: String) -> LspResult<()> {
        let mut socket = self.socket()?;
        let mut documents = self.inner.documents.lock().await;
        let Some(document) = documents.get_mut(uri) else {
            return Err(LspError::DocumentNotFound(format!("document not open: {uri}")));
        };

        let change = match self.sync_kind() {
            TextDocumentSyncKind::INCREMENTAL => TextDocumentContentChangeEvent {
                range: Some(full_range(&document.text)),
                range_length: None,
                text: text.clone(),
            },
            TextDocumentSyncKind::FULL => TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: text.clone(),
            },
            _ => {
                debug!(%uri, "analysis server does not sync documents, change not sent");
                document.text = text;
                return Ok(());
            }
        };

        let version = document.version + 1;
        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: uri.clone(),
                version,
            },
            content_changes: vec![change],
        };
        socket
            .did_change(params)
            .map_err(|e| LspError::RequestFailed(format!("didChange notification failed: {e}")))?;

        document.version = version;
        document.text = text;
        Ok(())
    }

    /// Closes a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected.
    pub async fn did_close(&self, uri: &Url) -> LspResult<()> {
        let mut socket = self.socket()?;
        let mut documents = self.inner.documents.lock().await;

        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
        };
        socket
            .did_close(params)
            .map_err(|e| LspError::RequestFailed(format!("didClose notification failed: {e}")))?;

        documents.remove(uri);
        Ok(())
    }

    // Queries

    /// Lists the class-name spans of a document, in source order.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected or the request fails.
    pub async fn code_lenses(&self, uri: &Url) -> LspResult<Vec<CodeLens>> {
        let mut socket = self.socket()?;
        let params = CodeLensParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let lenses = self
            .request("textDocument/codeLens", socket.code_lens(params))
            .await?;
        Ok(lenses.unwrap_or_default())
    }

    /// Resolves a lens into one carrying the `pythonMRO.showMRO` command.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected or the request fails.
    pub async fn resolve_code_lens(&self, lens: CodeLens) -> LspResult<CodeLens> {
        let mut socket = self.socket()?;
        self.request("codeLens/resolve", socket.code_lens_resolve(lens))
            .await
    }

    /// Asks for the ancestor chain at `position`.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected or the request fails.
    pub async fn hover(&self, uri: &Url, position: Position) -> LspResult<Option<Hover>> {
        let mut socket = self.socket()?;
        let params = HoverParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri: uri.clone() },
                position,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.request("textDocument/hover", socket.hover(params))
            .await
    }

    fn socket(&self) -> LspResult<ServerSocket> {
        let link = self.inner.link.as_ref().ok_or(LspError::NotConnected)?;
        if self.inner.closed.load(Ordering::Acquire) || link.bridge_state.borrow().is_some() {
            return Err(LspError::ConnectionClosed);
        }
        Ok(link.socket.clone())
    }

    fn sync_kind(&self) -> TextDocumentSyncKind {
        match self
            .capabilities()
            .and_then(|caps| caps.text_document_sync.as_ref())
        {
            Some(TextDocumentSyncCapability::Kind(kind)) => *kind,
            Some(TextDocumentSyncCapability::Options(options)) => {
                options.change.unwrap_or(TextDocumentSyncKind::NONE)
            }
            None => TextDocumentSyncKind::NONE,
        }
    }

    async fn request<T>(
        &self,
        method: &'static str,
        response: impl Future<Output = Result<T, async_lsp::Error>>,
    ) -> LspResult<T> {
        let timeout = self.inner.config.request_timeout;
        let pending = PendingRequest::register(
            self.inner.next_request.fetch_add(1, Ordering::Relaxed),
            method,
            timeout,
            &self.inner.in_flight,
        );
        debug!(request = pending.id(), method, "forwarding request");

        match tokio::time::timeout_at(pending.deadline().into(), response).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(async_lsp::Error::ServiceStopped)) => Err(LspError::ConnectionClosed),
            Ok(Err(async_lsp::Error::Response(e))) => Err(LspError::RequestFailed(format!(
                "{} failed: {} (code: {:?})",
                pending.method(),
                e.message,
                e.code
            ))),
            Ok(Err(e)) => Err(LspError::RequestFailed(format!(
                "{} failed: {e}",
                pending.method()
            ))),
            Err(_) => {
                warn!(request = pending.id(), method, "request timed out");
                Err(LspError::Timeout(timeout))
            }
        }
    }
}
