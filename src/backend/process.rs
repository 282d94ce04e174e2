//! Language server child process
//!
//! Spawns the configured server with piped stdio, performs the
//! `initialize` / `initialized` handshake and only then opens the
//! middleware's connect gate. Server-initiated traffic is routed back
//! through the middleware to the host.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tower_lsp::jsonrpc;
use tower_lsp::lsp_types::{
    ConfigurationParams, LogMessageParams, MessageType, PublishDiagnosticsParams,
};
use tracing::{debug, error, info, trace, warn};

use crate::activation::options::AnalysisOptions;
use crate::activation::types::{Scope, Variant};
use crate::backend::connection::{Connection, IncomingHandler};
use crate::backend::{BackendError, BackendFactory, BackendInstance};
use crate::host::HostClient;
use crate::middleware::{
    ConfigurationSources, Handler, Interceptor, Middleware, ProtocolCall, handler,
};
use crate::telemetry::TelemetrySink;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Program and arguments used to launch a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ServerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Clone)]
pub struct ProcessBackendFactory {
    variant: Variant,
    command: ServerCommand,
    host: Arc<dyn HostClient>,
    telemetry: Arc<dyn TelemetrySink>,
    sources: Option<ConfigurationSources>,
    addons: Vec<Arc<dyn Interceptor>>,
}

impl ProcessBackendFactory {
    pub fn new(
        variant: Variant,
        command: ServerCommand,
        host: Arc<dyn HostClient>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            variant,
            command,
            host,
            telemetry,
            sources: None,
            addons: Vec::new(),
        }
    }

    pub fn with_configuration_sources(mut self, sources: ConfigurationSources) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_addon(mut self, addon: Arc<dyn Interceptor>) -> Self {
        self.addons.push(addon);
        self
    }
}

impl BackendFactory for ProcessBackendFactory {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn create(&self, scope: &Scope) -> Result<Arc<dyn BackendInstance>, BackendError> {
        let mut middleware = Middleware::new(self.variant, self.telemetry.clone());
        if let Some(sources) = &self.sources {
            middleware = middleware.with_configuration_sources(sources.clone());
        }
        for addon in &self.addons {
            middleware = middleware.with_addon(addon.clone());
        }
        debug!("Creating {} backend for {}", self.variant, scope.key());

        Ok(Arc::new(ProcessBackend {
            variant: self.variant,
            command: self.command.clone(),
            host: self.host.clone(),
            middleware: Arc::new(middleware),
            connection: Arc::new(Mutex::new(None)),
            child: tokio::sync::Mutex::new(None),
        }))
    }
}

pub struct ProcessBackend {
    variant: Variant,
    command: ServerCommand,
    host: Arc<dyn HostClient>,
    middleware: Arc<Middleware>,
    connection: Arc<Mutex<Option<Arc<Connection>>>>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl ProcessBackend {
    fn connection(&self) -> Option<Arc<Connection>> {
        current(&self.connection)
    }

    fn spawn(&self) -> Result<Child, BackendError> {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.command.cwd {
            command.current_dir(cwd);
        }

        command.spawn().map_err(|source| BackendError::Spawn {
            program: self.command.program.clone(),
            source,
        })
    }
}

#[async_trait]
impl BackendInstance for ProcessBackend {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn middleware(&self) -> Arc<Middleware> {
        self.middleware.clone()
    }

    fn terminal(&self) -> Handler {
        let slot = self.connection.clone();
        handler(move |call: ProtocolCall| {
            let connection = current(&slot);
            async move {
                let Some(connection) = connection else {
                    return Err(jsonrpc::Error::internal_error());
                };
                let method = call.method.lsp_name();
                if call.method.is_notification() {
                    connection
                        .notify(method, call.params)
                        .await
                        .map_err(|e| internal(e.to_string()))?;
                    return Ok(None);
                }
                connection
                    .request(method, call.params, &call.token)
                    .await
                    .map(Some)
            }
        })
    }

    async fn start(&self, options: AnalysisOptions) -> Result<(), BackendError> {
        if self.connection().is_some() {
            return Err(BackendError::Start("already running".to_string()));
        }

        let mut child = self.spawn()?;
        let stdin = child.stdin.take().ok_or(BackendError::ConnectionClosed)?;
        let stdout = child.stdout.take().ok_or(BackendError::ConnectionClosed)?;
        if let Some(stderr) = child.stderr.take() {
            let variant = self.variant;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "backend", "[{}] {}", variant, line);
                }
            });
        }

        let traffic = Arc::new(ServerTraffic {
            variant: self.variant,
            middleware: self.middleware.clone(),
            host: self.host.clone(),
        });
        let connection = Arc::new(Connection::spawn(stdout, stdin, traffic));

        let params = initialize_params(&options);
        let response = connection
            .request("initialize", params, &CancellationToken::new())
            .await
            .map_err(|e| BackendError::Rejected {
                method: "initialize".to_string(),
                message: e.message.into_owned(),
            })?;

        let version = response
            .pointer("/serverInfo/version")
            .and_then(Value::as_str)
            .map(String::from);
        info!(
            "{} backend initialized (version {})",
            self.variant,
            version.as_deref().unwrap_or("unknown")
        );
        self.middleware.set_server_version(version);
        self.middleware
            .set_document_selector(options.document_selector.clone());

        connection.notify("initialized", json!({})).await?;

        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = Some(connection);
        *self.child.lock().await = Some(child);
        self.middleware.connect();
        Ok(())
    }

    async fn dispose(&self) -> Result<(), BackendError> {
        self.middleware.disconnect();

        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            shut_down(&connection, self.variant).await;
            connection.close();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await.is_err() {
                debug!("{} backend did not exit in time, killing", self.variant);
                child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Asks the server to shut down and, once it agrees, to exit.
async fn shut_down(connection: &Connection, variant: Variant) -> bool {
    let token = CancellationToken::new();
    let shutdown = connection.request("shutdown", Value::Null, &token);
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await {
        Ok(Ok(_)) => connection.notify("exit", Value::Null).await.is_ok(),
        Ok(Err(e)) => {
            debug!("{} backend rejected shutdown: {}", variant, e);
            false
        }
        Err(_) => {
            debug!("{} backend did not answer shutdown in time", variant);
            false
        }
    }
}

/// Handles requests and notifications a server sends back.
struct ServerTraffic {
    variant: Variant,
    middleware: Arc<Middleware>,
    host: Arc<dyn HostClient>,
}

#[async_trait]
impl IncomingHandler for ServerTraffic {
    async fn request(&self, method: &str, params: Value) -> jsonrpc::Result<Value> {
        match method {
            "workspace/configuration" => {
                let params: ConfigurationParams = serde_json::from_value(params)
                    .map_err(|e| jsonrpc::Error::invalid_params(e.to_string()))?;
                let host = self.host.clone();
                let settings = self
                    .middleware
                    .configuration(params, |params| async move {
                        host.configuration(params.items).await
                    })
                    .await?;
                Ok(Value::Array(settings))
            }
            "client/registerCapability"
            | "client/unregisterCapability"
            | "window/workDoneProgress/create" => Ok(Value::Null),
            _ => {
                debug!("{} backend sent unsupported request {}", self.variant, method);
                Err(jsonrpc::Error::method_not_found())
            }
        }
    }

    async fn notification(&self, method: &str, params: Value) {
        match method {
            "textDocument/publishDiagnostics" => {
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(params) => {
                        let next = forward_diagnostics(self.host.clone());
                        self.middleware.handle_diagnostics(params, next).await;
                    }
                    Err(e) => warn!("Malformed diagnostics from {} backend: {}", self.variant, e),
                }
            }
            "window/logMessage" | "window/showMessage" => {
                if let Ok(log) = serde_json::from_value::<LogMessageParams>(params) {
                    match log.typ {
                        MessageType::ERROR => error!(target: "backend", "{}", log.message),
                        MessageType::WARNING => warn!(target: "backend", "{}", log.message),
                        MessageType::INFO => info!(target: "backend", "{}", log.message),
                        _ => debug!(target: "backend", "{}", log.message),
                    }
                }
            }
            _ => trace!("Ignoring {} from {} backend", method, self.variant),
        }
    }
}

fn forward_diagnostics(host: Arc<dyn HostClient>) -> Handler {
    handler(move |call: ProtocolCall| {
        let host = host.clone();
        async move {
            let params: PublishDiagnosticsParams = serde_json::from_value(call.params)
                .map_err(|e| jsonrpc::Error::invalid_params(e.to_string()))?;
            host.publish_diagnostics(params).await;
            Ok(None)
        }
    })
}

fn initialize_params(options: &AnalysisOptions) -> Value {
    let folders = options.workspace_folder.as_ref().map(|folder| vec![folder]);
    json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "rootUri": options.workspace_folder.as_ref().map(|f| f.uri.as_str()),
        "workspaceFolders": folders,
        "initializationOptions": options.initialization_options,
        "capabilities": {
            "workspace": {
                "configuration": true,
                "workspaceFolders": true,
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": true,
                    "willSaveWaitUntil": true,
                    "didSave": true,
                },
                "completion": {
                    "completionItem": { "snippetSupport": true }
                },
                "hover": { "contentFormat": ["markdown", "plaintext"] },
                "publishDiagnostics": { "relatedInformation": true },
            },
        },
    })
}

fn current(slot: &Mutex<Option<Arc<Connection>>>) -> Option<Arc<Connection>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn internal(message: String) -> jsonrpc::Error {
    jsonrpc::Error {
        code: jsonrpc::ErrorCode::InternalError,
        message: message.into(),
        data: None,
    }
}
