use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_lsp::jsonrpc::{self, ErrorCode, Result};
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer};
use tracing::{debug, info, warn};

use crate::activation::{ActivationRecord, Selector};
use crate::config::{SETTINGS_SECTION, Settings};
use crate::host::platform::{DEFAULT_ENV_FILE, env_file_path};
use crate::host::{ConfigurationChange, SettingsProvider, Workspace, WorkspaceEvents};
use crate::lsp::host::HostWorkspace;
use crate::middleware::{Method, ProtocolCall};

/// Editor-facing server that routes every call to the backend activated for
/// the document's scope.
pub struct Proxy {
    client: Client,
    host: Arc<HostWorkspace>,
    events: WorkspaceEvents,
    selector: Selector,
    /// Resolve requests carry no document; they go where the last one went.
    last_uri: Mutex<Option<Url>>,
    /// Whether the editor accepts a dynamically registered file watcher.
    can_watch_files: AtomicBool,
}

const ENV_FILE_WATCHER_ID: &str = "python-ls-broker/env-file";

impl Proxy {
    pub fn new(
        client: Client,
        host: Arc<HostWorkspace>,
        events: WorkspaceEvents,
        selector: Selector,
    ) -> Self {
        Self {
            client,
            host,
            events,
            selector,
            last_uri: Mutex::new(None),
            can_watch_files: AtomicBool::new(false),
        }
    }

    pub fn server_capabilities() -> ServerCapabilities {
        ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Options(
                TextDocumentSyncOptions {
                    open_close: Some(true),
                    change: Some(TextDocumentSyncKind::INCREMENTAL),
                    will_save: Some(true),
                    will_save_wait_until: Some(true),
                    save: Some(TextDocumentSyncSaveOptions::Supported(true)),
                },
            )),
            completion_provider: Some(CompletionOptions {
                resolve_provider: Some(true),
                trigger_characters: Some(vec![".".to_string()]),
                ..Default::default()
            }),
            hover_provider: Some(HoverProviderCapability::Simple(true)),
            signature_help_provider: Some(SignatureHelpOptions {
                trigger_characters: Some(vec!["(".to_string(), ",".to_string()]),
                ..Default::default()
            }),
            declaration_provider: Some(DeclarationCapability::Simple(true)),
            definition_provider: Some(OneOf::Left(true)),
            references_provider: Some(OneOf::Left(true)),
            document_highlight_provider: Some(OneOf::Left(true)),
            document_symbol_provider: Some(OneOf::Left(true)),
            workspace_symbol_provider: Some(OneOf::Left(true)),
            code_action_provider: Some(CodeActionProviderCapability::Simple(true)),
            code_lens_provider: Some(CodeLensOptions {
                resolve_provider: Some(true),
            }),
            document_formatting_provider: Some(OneOf::Left(true)),
            document_range_formatting_provider: Some(OneOf::Left(true)),
            document_on_type_formatting_provider: Some(DocumentOnTypeFormattingOptions {
                first_trigger_character: "\n".to_string(),
                more_trigger_character: None,
            }),
            rename_provider: Some(OneOf::Right(RenameOptions {
                prepare_provider: Some(true),
                work_done_progress_options: Default::default(),
            })),
            document_link_provider: Some(DocumentLinkOptions {
                resolve_provider: Some(true),
                work_done_progress_options: Default::default(),
            }),
            workspace: Some(WorkspaceServerCapabilities {
                workspace_folders: Some(WorkspaceFoldersServerCapabilities {
                    supported: Some(true),
                    change_notifications: Some(OneOf::Left(true)),
                }),
                file_operations: None,
            }),
            ..Default::default()
        }
    }

    /// True when `uri` is the env file that applies to its folder.
    fn is_env_file(&self, uri: &Url) -> bool {
        let Ok(path) = uri.to_file_path() else {
            return false;
        };
        let folder = self.host.folder_for(Some(uri));
        env_file_path(&self.host.settings(Some(uri)), folder.as_ref()).is_some_and(|env| env == path)
    }

    /// Asks the editor to report changes to env files.
    fn watch_env_files(&self) {
        let name = self
            .host
            .settings(None)
            .env_file
            .as_deref()
            .and_then(|p| std::path::Path::new(p).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_ENV_FILE.to_string());
        let registration = Registration {
            id: ENV_FILE_WATCHER_ID.to_string(),
            method: "workspace/didChangeWatchedFiles".to_string(),
            register_options: Some(json!({
                "watchers": [{ "globPattern": format!("**/{name}") }]
            })),
        };

        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.register_capability(vec![registration]).await {
                warn!("Failed to register env file watcher: {}", e);
            }
        });
    }

    fn host_first_folder(&self) -> Option<Url> {
        self.host.folders().into_iter().next().map(|f| f.uri)
    }

    fn remember(&self, uri: &Url) {
        *self.last_uri.lock().unwrap_or_else(PoisonError::into_inner) = Some(uri.clone());
    }

    fn last_uri(&self) -> Option<Url> {
        self.last_uri
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn record(&self, uri: Option<&Url>) -> Option<Arc<ActivationRecord>> {
        match self.selector.get(uri, None).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(
                    "No backend for {}: {}",
                    uri.map(Url::as_str).unwrap_or("<no document>"),
                    e
                );
                None
            }
        }
    }

    /// Notifications run inline so the backend sees them in arrival order.
    async fn notify<P: Serialize>(&self, uri: &Url, method: Method, params: P) {
        self.remember(uri);
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => {
                warn!("Failed to encode {}: {}", method, e);
                return;
            }
        };
        let Some(record) = self.record(Some(uri)).await else {
            return;
        };
        if let Err(e) = record.handle(ProtocolCall::new(method, params)).await {
            warn!("{} failed: {}", method, e.message);
        }
    }

    /// Requests run on their own task; dropping this future (the editor
    /// cancelled) cancels the token, which forwards `$/cancelRequest`.
    async fn forward<P, R>(&self, uri: Option<Url>, method: Method, params: P) -> Result<Option<R>>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if let Some(uri) = &uri {
            self.remember(uri);
        }
        let params = serde_json::to_value(params).map_err(internal_error)?;
        let Some(record) = self.record(uri.as_ref()).await else {
            return Ok(None);
        };

        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let call = ProtocolCall::new(method, params).with_token(token);
        let result = tokio::spawn(async move { record.handle(call).await })
            .await
            .map_err(internal_error)??;
        guard.disarm();

        match result {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(internal_error),
        }
    }

    /// Resolve requests answer with the unresolved item when the backend has
    /// nothing better.
    async fn resolve<T>(&self, method: Method, item: T) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let resolved = self.forward(self.last_uri(), method, item.clone()).await?;
        Ok(resolved.unwrap_or(item))
    }
}

fn internal_error<E: std::fmt::Display>(e: E) -> jsonrpc::Error {
    jsonrpc::Error {
        code: ErrorCode::InternalError,
        message: e.to_string().into(),
        data: None,
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Proxy {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        self.client
            .log_message(MessageType::INFO, "LSP server initializing")
            .await;

        #[allow(deprecated)]
        let folders = params.workspace_folders.unwrap_or_else(|| {
            params
                .root_uri
                .map(|uri| {
                    vec![WorkspaceFolder {
                        name: uri
                            .path_segments()
                            .and_then(|mut s| s.next_back())
                            .unwrap_or_default()
                            .to_string(),
                        uri,
                    }]
                })
                .unwrap_or_default()
        });
        self.host.set_folders(folders);

        let can_watch = params
            .capabilities
            .workspace
            .as_ref()
            .and_then(|w| w.did_change_watched_files.as_ref())
            .and_then(|c| c.dynamic_registration)
            .unwrap_or(false);
        self.can_watch_files.store(can_watch, Ordering::SeqCst);

        if let Some(options) = params
            .initialization_options
            .filter(|o| o.get(SETTINGS_SECTION).is_some())
        {
            self.host.set_settings(Settings::from_value(&options));
        }

        Ok(InitializeResult {
            capabilities: Self::server_capabilities(),
            server_info: Some(ServerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    async fn initialized(&self, _params: InitializedParams) {
        self.client
            .log_message(MessageType::INFO, "LSP server initialized")
            .await;

        if self.can_watch_files.load(Ordering::SeqCst) {
            self.watch_env_files();
        }

        // warm the cache for the first folder without holding up the editor
        let resource = self.host_first_folder();
        let selector = self.selector.clone();
        tokio::spawn(async move { selector.activate(resource.as_ref()).await });
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down; disposing {} activations", self.selector.keys().len());
        self.selector.dispose().await;
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri.clone();
        self.notify(&uri, Method::DidOpen, params).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri.clone();
        self.notify(&uri, Method::DidChange, params).await;
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let uri = params.text_document.uri.clone();
        self.notify(&uri, Method::DidSave, params).await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri.clone();
        self.notify(&uri, Method::DidClose, params).await;
    }

    async fn will_save(&self, params: WillSaveTextDocumentParams) {
        let uri = params.text_document.uri.clone();
        self.notify(&uri, Method::WillSave, params).await;
    }

    async fn will_save_wait_until(
        &self,
        params: WillSaveTextDocumentParams,
    ) -> Result<Option<Vec<TextEdit>>> {
        let uri = params.text_document.uri.clone();
        self.forward(Some(uri), Method::WillSaveWaitUntil, params)
            .await
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let uri = params.text_document_position.text_document.uri.clone();
        self.forward(Some(uri), Method::Completion, params).await
    }

    async fn completion_resolve(&self, params: CompletionItem) -> Result<CompletionItem> {
        self.resolve(Method::CompletionResolve, params).await
    }

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        let uri = params
            .text_document_position_params
            .text_document
            .uri
            .clone();
        self.forward(Some(uri), Method::Hover, params).await
    }

    async fn signature_help(&self, params: SignatureHelpParams) -> Result<Option<SignatureHelp>> {
        let uri = params
            .text_document_position_params
            .text_document
            .uri
            .clone();
        self.forward(Some(uri), Method::SignatureHelp, params).await
    }

    async fn goto_declaration(
        &self,
        params: request::GotoDeclarationParams,
    ) -> Result<Option<request::GotoDeclarationResponse>> {
        let uri = params
            .text_document_position_params
            .text_document
            .uri
            .clone();
        self.forward(Some(uri), Method::Declaration, params).await
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        let uri = params
            .text_document_position_params
            .text_document
            .uri
            .clone();
        self.forward(Some(uri), Method::Definition, params).await
    }

    async fn references(&self, params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        let uri = params.text_document_position.text_document.uri.clone();
        self.forward(Some(uri), Method::References, params).await
    }

    async fn document_highlight(
        &self,
        params: DocumentHighlightParams,
    ) -> Result<Option<Vec<DocumentHighlight>>> {
        let uri = params
            .text_document_position_params
            .text_document
            .uri
            .clone();
        self.forward(Some(uri), Method::DocumentHighlight, params)
            .await
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        let uri = params.text_document.uri.clone();
        self.forward(Some(uri), Method::DocumentSymbol, params).await
    }

    async fn symbol(
        &self,
        params: WorkspaceSymbolParams,
    ) -> Result<Option<Vec<SymbolInformation>>> {
        self.forward(self.last_uri(), Method::WorkspaceSymbol, params)
            .await
    }

    async fn code_action(&self, params: CodeActionParams) -> Result<Option<CodeActionResponse>> {
        let uri = params.text_document.uri.clone();
        self.forward(Some(uri), Method::CodeAction, params).await
    }

    async fn code_lens(&self, params: CodeLensParams) -> Result<Option<Vec<CodeLens>>> {
        let uri = params.text_document.uri.clone();
        self.forward(Some(uri), Method::CodeLens, params).await
    }

    async fn code_lens_resolve(&self, params: CodeLens) -> Result<CodeLens> {
        self.resolve(Method::CodeLensResolve, params).await
    }

    async fn formatting(&self, params: DocumentFormattingParams) -> Result<Option<Vec<TextEdit>>> {
        let uri = params.text_document.uri.clone();
        self.forward(Some(uri), Method::Formatting, params).await
    }

    async fn range_formatting(
        &self,
        params: DocumentRangeFormattingParams,
    ) -> Result<Option<Vec<TextEdit>>> {
        let uri = params.text_document.uri.clone();
        self.forward(Some(uri), Method::RangeFormatting, params).await
    }

    async fn on_type_formatting(
        &self,
        params: DocumentOnTypeFormattingParams,
    ) -> Result<Option<Vec<TextEdit>>> {
        let uri = params.text_document_position.text_document.uri.clone();
        self.forward(Some(uri), Method::OnTypeFormatting, params)
            .await
    }

    async fn rename(&self, params: RenameParams) -> Result<Option<WorkspaceEdit>> {
        let uri = params.text_document_position.text_document.uri.clone();
        self.forward(Some(uri), Method::Rename, params).await
    }

    async fn prepare_rename(
        &self,
        params: TextDocumentPositionParams,
    ) -> Result<Option<PrepareRenameResponse>> {
        let uri = params.text_document.uri.clone();
        self.forward(Some(uri), Method::PrepareRename, params).await
    }

    async fn document_link(&self, params: DocumentLinkParams) -> Result<Option<Vec<DocumentLink>>> {
        let uri = params.text_document.uri.clone();
        self.forward(Some(uri), Method::DocumentLink, params).await
    }

    async fn document_link_resolve(&self, params: DocumentLink) -> Result<DocumentLink> {
        self.resolve(Method::DocumentLinkResolve, params).await
    }

    async fn did_change_workspace_folders(&self, params: DidChangeWorkspaceFoldersParams) {
        self.host.remove_folders(&params.event.removed);
        self.host.add_folders(params.event.added);

        let evicted = self.selector.remove_stale_scopes().await;
        if !evicted.is_empty() {
            info!("Disposed {} activations for closed folders", evicted.len());
        }
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        let Some(section) = params.settings.get(SETTINGS_SECTION) else {
            debug!("Ignoring configuration change without a python section");
            return;
        };

        let settings = Settings::from_value(section);
        let previous = self.host.settings(None);
        let runtime_changed = settings.python_path != previous.python_path;
        let env_file_changed = settings.env_file != previous.env_file;
        if !self.host.set_settings(settings) {
            return;
        }

        let mut sections = vec![SETTINGS_SECTION.to_string()];
        if let Some(keys) = section.as_object() {
            sections.extend(keys.keys().map(|key| format!("{SETTINGS_SECTION}.{key}")));
        }
        self.events.settings_changed(ConfigurationChange::new(sections));
        if runtime_changed {
            self.events.runtime_changed();
        }
        if env_file_changed {
            self.events.environment_changed();
        }
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        if let Some(change) = params.changes.iter().find(|c| self.is_env_file(&c.uri)) {
            info!("Env file {} changed", change.uri);
            self.events.environment_changed();
        }
    }
}
