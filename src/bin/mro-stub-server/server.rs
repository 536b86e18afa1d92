//! The MRO analysis protocol served over one connection.

use std::collections::HashMap;
use std::future::{Ready, ready};
use std::ops::ControlFlow;

use async_lsp::ResponseError;
use async_lsp::concurrency::ConcurrencyLayer;
use async_lsp::panic::CatchUnwindLayer;
use async_lsp::router::Router;
use async_lsp::server::LifecycleLayer;
use async_lsp::tracing::TracingLayer;
use lsp_types::{
    CodeLens, CodeLensOptions, CodeLensParams, Command, DidChangeTextDocumentParams,
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, Hover, HoverContents, HoverParams,
    HoverProviderCapability, InitializeParams, InitializeResult, MarkedString, ServerCapabilities,
    ServerInfo, TextDocumentSyncCapability, TextDocumentSyncKind, TextDocumentSyncOptions, Url,
    notification, request,
};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tower::ServiceBuilder;
use tracing::{debug, info};

use crate::document::Document;

const SHOW_MRO_COMMAND: &str = "pythonMRO.showMRO";
const SHOW_MRO_TITLE: &str = "Show MRO list";

/// Per-connection state.
#[derive(Debug)]
struct ServerState {
    sync: TextDocumentSyncKind,
    documents: HashMap<Url, Document>,
}

impl ServerState {
    fn new(sync: TextDocumentSyncKind) -> Self {
        Self {
            sync,
            documents: HashMap::new(),
        }
    }

    fn initialize(&self, params: &InitializeParams) -> InitializeResult {
        #[allow(deprecated)]
        let root = params.root_uri.as_ref().map(Url::to_string);
        info!(root = root.as_deref().unwrap_or("<none>"), "initializing");

        InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(self.sync),
                        ..Default::default()
                    },
                )),
                code_lens_provider: Some(CodeLensOptions {
                    resolve_provider: Some(true),
                }),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: "mro-stub-server".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        }
    }

    fn did_open(&mut self, params: DidOpenTextDocumentParams) {
        let document = params.text_document;
        debug!(uri = %document.uri, "opened");
        self.documents
            .insert(document.uri, Document::new(document.text));
    }

    fn did_change(&mut self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let sync = self.sync;
        let document = self.documents.entry(uri).or_default();
        for mut change in params.content_changes {
            if sync == TextDocumentSyncKind::FULL {
                change.range = None;
            }
            document.apply(change);
        }
    }

    fn did_close(&mut self, params: DidCloseTextDocumentParams) {
        self.documents.remove(&params.text_document.uri);
    }

    /// The open document, or the file on disk if it was never opened.
    fn document(&self, uri: &Url) -> Option<Document> {
        if let Some(document) = self.documents.get(uri) {
            return Some(document.clone());
        }
        let path = uri.to_file_path().ok()?;
        std::fs::read_to_string(path).ok().map(Document::new)
    }

    fn code_lenses(&self, params: &CodeLensParams) -> Option<Vec<CodeLens>> {
        let document = self.document(&params.text_document.uri)?;
        let lenses = document
            .classes()
            .into_iter()
            .map(|class| CodeLens {
                range: class.range,
                command: None,
                data: Some(Value::from(class.chain)),
            })
            .collect();
        Some(lenses)
    }

    fn hover(&self, params: &HoverParams) -> Option<Hover> {
        let position = &params.text_document_position_params;
        let document = self.document(&position.text_document.uri)?;
        let class = document.class_at(position.position)?;
        Some(Hover {
            contents: HoverContents::Array(
                class.chain.into_iter().map(MarkedString::String).collect(),
            ),
            range: Some(class.range),
        })
    }
}

fn resolve_code_lens(mut lens: CodeLens) -> CodeLens {
    let chain: Option<Vec<&str>> = lens
        .data
        .as_ref()
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect());
    lens.command = Some(Command {
        title: SHOW_MRO_TITLE.to_string(),
        command: SHOW_MRO_COMMAND.to_string(),
        arguments: chain.map(|chain| vec![Value::from(chain.join("\n"))]),
    });
    lens
}

fn reply<T>(value: T) -> Ready<Result<T, ResponseError>> {
    ready(Ok(value))
}

/// Serves one client until it disconnects or sends `exit`.
pub async fn serve(stream: TcpStream, sync: TextDocumentSyncKind) -> async_lsp::Result<()> {
    let (main_loop, _client) = async_lsp::MainLoop::new_server(|_client| {
        let mut router = Router::new(ServerState::new(sync));
        router
            .request::<request::Initialize, _>(|st, params| reply(st.initialize(&params)))
            .request::<request::Shutdown, _>(|_, ()| reply(()))
            .request::<request::CodeLensRequest, _>(|st, params| reply(st.code_lenses(&params)))
            .request::<request::CodeLensResolve, _>(|_, lens| reply(resolve_code_lens(lens)))
            .request::<request::HoverRequest, _>(|st, params| reply(st.hover(&params)))
            .notification::<notification::Initialized>(|_, _| ControlFlow::Continue(()))
            .notification::<notification::DidOpenTextDocument>(|st, params| {
                st.did_open(params);
                ControlFlow::Continue(())
            })
            .notification::<notification::DidChangeTextDocument>(|st, params| {
                st.did_change(params);
                ControlFlow::Continue(())
            })
            .notification::<notification::DidCloseTextDocument>(|st, params| {
                st.did_close(params);
                ControlFlow::Continue(())
            });

        ServiceBuilder::new()
            .layer(TracingLayer::default())
            .layer(LifecycleLayer::default())
            .layer(CatchUnwindLayer::default())
            .layer(ConcurrencyLayer::default())
            .service(router)
    });

    let (reader, writer) = stream.into_split();
    main_loop
        .run_buffered(reader.compat(), writer.compat_write())
        .await
}
