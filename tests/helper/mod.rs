//! Shared fakes for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_lsp::ClientSocket;
use tower_lsp::jsonrpc::Request;
use tower_lsp::lsp_types::{Url, WorkspaceFolder};

use python_ls_broker::activation::{
    AnalysisOptions, Backends, OptionsServices, RuntimeIdentity, Scope, Selector, Variant,
    VariantServices,
};
use python_ls_broker::backend::{BackendError, BackendFactory, BackendInstance};
use python_ls_broker::config::{FullVariant, Settings};
use python_ls_broker::host::{
    Compatibility, EnvironmentVariables, Experiments, InstallError, Installer, Prompter,
    RuntimeResolver, SettingsProvider, Workspace, WorkspaceEvents,
};
use python_ls_broker::middleware::{CallResult, Handler, Method, Middleware, handler};
use python_ls_broker::telemetry::{TelemetryEvent, TelemetrySink};

pub const RUNTIME: &str = "/usr/bin/py3";

pub fn folder(uri: &str) -> WorkspaceFolder {
    WorkspaceFolder {
        uri: Url::parse(uri).unwrap(),
        name: uri.rsplit('/').next().unwrap_or_default().to_string(),
    }
}

pub fn uri(s: &str) -> Url {
    Url::parse(s).unwrap()
}

/// Lets spawned tasks and debounce windows run to completion on a paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(10)).await;
}

// ---------------------------------------------------------------------------
// Host collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TestWorkspace {
    folders: Mutex<Vec<WorkspaceFolder>>,
}

impl TestWorkspace {
    pub fn with_folders(folders: Vec<WorkspaceFolder>) -> Self {
        Self {
            folders: Mutex::new(folders),
        }
    }

    pub fn remove(&self, uri: &str) {
        self.folders
            .lock()
            .unwrap()
            .retain(|f| f.uri.as_str() != uri);
    }
}

impl Workspace for TestWorkspace {
    fn folders(&self) -> Vec<WorkspaceFolder> {
        self.folders.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct TestSettings {
    settings: Mutex<Settings>,
}

impl TestSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.settings.lock().unwrap());
    }
}

impl SettingsProvider for TestSettings {
    fn settings(&self, _resource: Option<&Url>) -> Settings {
        self.settings.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct TestEnvironment {
    vars: Mutex<HashMap<String, String>>,
}

impl TestEnvironment {
    pub fn set(&self, key: &str, value: &str) {
        self.vars
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl EnvironmentVariables for TestEnvironment {
    async fn variables(&self, _resource: Option<&Url>) -> anyhow::Result<HashMap<String, String>> {
        Ok(self.vars.lock().unwrap().clone())
    }
}

pub struct TestRuntime {
    path: Mutex<PathBuf>,
}

impl TestRuntime {
    pub fn new(path: &str) -> Self {
        Self {
            path: Mutex::new(PathBuf::from(path)),
        }
    }

    pub fn set(&self, path: &str) {
        *self.path.lock().unwrap() = PathBuf::from(path);
    }
}

#[async_trait]
impl RuntimeResolver for TestRuntime {
    async fn active_runtime(
        &self,
        _resource: Option<&Url>,
    ) -> anyhow::Result<Option<RuntimeIdentity>> {
        Ok(Some(RuntimeIdentity::new(self.path.lock().unwrap().clone())))
    }
}

pub struct Supported(pub bool);

impl Compatibility for Supported {
    fn is_full_supported(&self, _variant: FullVariant) -> bool {
        self.0
    }
}

pub struct NoAssignment;

impl Experiments for NoAssignment {
    fn prefers_simple(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct TestInstaller {
    pub missing: AtomicBool,
}

#[async_trait]
impl Installer for TestInstaller {
    async fn ensure_available(&self, variant: Variant, _scope: &Scope) -> Result<(), InstallError> {
        if self.missing.load(Ordering::SeqCst) {
            return Err(InstallError::NotInstalled(variant.to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingPrompter {
    pub prompts: AtomicUsize,
}

impl Prompter for CountingPrompter {
    fn prompt_not_installed(&self, _variant: Variant) {
        self.prompts.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name == name)
            .count()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn emit(&self, event: TelemetryEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Lifecycle counters shared by every instance a factory creates.
#[derive(Default)]
pub struct Counters {
    pub created: AtomicUsize,
    pub started: AtomicUsize,
    pub disposed: AtomicUsize,
    pub calls: AtomicUsize,
    pub options: Mutex<Vec<AnalysisOptions>>,
}

impl Counters {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<AnalysisOptions> {
        self.options.lock().unwrap().last().cloned()
    }
}

#[derive(Clone)]
pub struct FakeFactory {
    variant: Variant,
    pub counters: Arc<Counters>,
    fail_start: Arc<AtomicBool>,
    start_delay: Option<Duration>,
    responses: Arc<Mutex<HashMap<Method, Value>>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl FakeFactory {
    pub fn new(variant: Variant, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            variant,
            counters: Arc::new(Counters::default()),
            fail_start: Arc::new(AtomicBool::new(false)),
            start_delay: None,
            responses: Arc::new(Mutex::new(HashMap::new())),
            telemetry,
        }
    }

    pub fn failing(self) -> Self {
        self.set_failing(true);
        self
    }

    /// Applies to every instance created by this factory and its clones.
    pub fn set_failing(&self, failing: bool) {
        self.fail_start.store(failing, Ordering::SeqCst);
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn with_response(self, method: Method, value: Value) -> Self {
        self.responses.lock().unwrap().insert(method, value);
        self
    }
}

impl BackendFactory for FakeFactory {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn create(&self, _scope: &Scope) -> Result<Arc<dyn BackendInstance>, BackendError> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeBackend {
            factory: self.clone(),
            middleware: Arc::new(Middleware::new(self.variant, self.telemetry.clone())),
        }))
    }
}

pub struct FakeBackend {
    factory: FakeFactory,
    middleware: Arc<Middleware>,
}

#[async_trait]
impl BackendInstance for FakeBackend {
    fn variant(&self) -> Variant {
        self.factory.variant
    }

    fn middleware(&self) -> Arc<Middleware> {
        self.middleware.clone()
    }

    fn terminal(&self) -> Handler {
        let counters = self.factory.counters.clone();
        let responses = self.factory.responses.clone();
        handler(move |call| {
            counters.calls.fetch_add(1, Ordering::SeqCst);
            let response = if call.method.is_notification() {
                None
            } else {
                Some(
                    responses
                        .lock()
                        .unwrap()
                        .get(&call.method)
                        .cloned()
                        .unwrap_or(Value::Null),
                )
            };
            async move { CallResult::Ok(response) }
        })
    }

    async fn start(&self, options: AnalysisOptions) -> Result<(), BackendError> {
        if let Some(delay) = self.factory.start_delay {
            tokio::time::sleep(delay).await;
        }
        self.factory.counters.started.fetch_add(1, Ordering::SeqCst);
        self.factory.counters.options.lock().unwrap().push(options.clone());
        if self.factory.fail_start.load(Ordering::SeqCst) {
            return Err(BackendError::Start(format!("{} refused to start", self.factory.variant)));
        }
        self.middleware.set_document_selector(options.document_selector);
        self.middleware.connect();
        Ok(())
    }

    async fn dispose(&self) -> Result<(), BackendError> {
        self.middleware.disconnect();
        self.factory.counters.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Selector fixture
// ---------------------------------------------------------------------------

pub struct Fixture {
    pub workspace: Arc<TestWorkspace>,
    pub settings: Arc<TestSettings>,
    pub environment: Arc<TestEnvironment>,
    pub runtime: Arc<TestRuntime>,
    pub events: WorkspaceEvents,
    pub installer: Arc<TestInstaller>,
    pub prompter: Arc<CountingPrompter>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub supported: bool,
    pub full: FakeFactory,
    pub simple: FakeFactory,
}

impl Fixture {
    pub fn new(folders: Vec<WorkspaceFolder>) -> Self {
        let telemetry = Arc::new(RecordingTelemetry::default());
        Self {
            workspace: Arc::new(TestWorkspace::with_folders(folders)),
            settings: Arc::new(TestSettings::default()),
            environment: Arc::new(TestEnvironment::default()),
            runtime: Arc::new(TestRuntime::new(RUNTIME)),
            events: WorkspaceEvents::new(),
            installer: Arc::new(TestInstaller::default()),
            prompter: Arc::new(CountingPrompter::default()),
            full: FakeFactory::new(Variant::FullB, telemetry.clone()),
            simple: FakeFactory::new(Variant::Simple, telemetry.clone()),
            telemetry,
            supported: true,
        }
    }

    pub fn options_services(&self) -> OptionsServices {
        OptionsServices::new(
            self.workspace.clone(),
            self.settings.clone(),
            self.environment.clone(),
            self.events.clone(),
        )
    }

    pub fn variant_services(&self) -> VariantServices {
        VariantServices {
            settings: self.settings.clone(),
            experiments: Arc::new(NoAssignment),
            compatibility: Arc::new(Supported(self.supported)),
            installer: self.installer.clone(),
            prompter: self.prompter.clone(),
            telemetry: self.telemetry.clone(),
        }
    }

    pub fn selector(&self) -> Selector {
        Selector::new(
            self.runtime.clone(),
            self.variant_services(),
            self.options_services(),
            Backends::new()
                .with(Arc::new(self.full.clone()))
                .with(Arc::new(self.simple.clone())),
        )
    }

    pub fn scope(&self, resource: &str, folder_uri: Option<&str>) -> Scope {
        Scope {
            resource: Some(uri(resource)),
            folder: folder_uri.map(folder),
            runtime: RuntimeIdentity::new(RUNTIME),
        }
    }
}

// ---------------------------------------------------------------------------
// LSP service driving
// ---------------------------------------------------------------------------

pub fn create_initialize_request(id: i64) -> Request {
    create_initialize_request_with_folders(id, &[])
}

pub fn create_initialize_request_with_folders(id: i64, folders: &[&str]) -> Request {
    create_initialize_request_with_capabilities(id, folders, json!({}))
}

pub fn create_initialize_request_with_capabilities(
    id: i64,
    folders: &[&str],
    capabilities: Value,
) -> Request {
    let folders: Vec<Value> = folders
        .iter()
        .map(|f| json!({ "uri": f, "name": f.rsplit('/').next().unwrap_or_default() }))
        .collect();
    Request::build("initialize")
        .id(id)
        .params(json!({
            "capabilities": capabilities,
            "workspaceFolders": folders,
        }))
        .finish()
}

pub fn create_initialized_notification() -> Request {
    Request::build("initialized").params(json!({})).finish()
}

pub fn create_did_open_notification(uri: &str, text: &str) -> Request {
    Request::build("textDocument/didOpen")
        .params(json!({
            "textDocument": {
                "uri": uri,
                "languageId": "python",
                "version": 1,
                "text": text
            }
        }))
        .finish()
}

pub fn create_hover_request(id: i64, uri: &str) -> Request {
    Request::build("textDocument/hover")
        .id(id)
        .params(json!({
            "textDocument": { "uri": uri },
            "position": { "line": 0, "character": 0 }
        }))
        .finish()
}

pub fn create_did_change_configuration_notification(settings: Value) -> Request {
    Request::build("workspace/didChangeConfiguration")
        .params(json!({ "settings": settings }))
        .finish()
}

pub fn create_did_change_watched_files_notification(uris: &[&str]) -> Request {
    let changes: Vec<Value> = uris
        .iter()
        .map(|uri| json!({ "uri": uri, "type": 2 }))
        .collect();
    Request::build("workspace/didChangeWatchedFiles")
        .params(json!({ "changes": changes }))
        .finish()
}

pub fn create_did_change_workspace_folders_notification(removed: &[&str]) -> Request {
    let removed: Vec<Value> = removed
        .iter()
        .map(|f| json!({ "uri": f, "name": f.rsplit('/').next().unwrap_or_default() }))
        .collect();
    Request::build("workspace/didChangeWorkspaceFolders")
        .params(json!({ "event": { "added": [], "removed": removed } }))
        .finish()
}

/// Drains server-to-client messages into a channel so the service never blocks.
pub fn spawn_notification_collector(mut socket: ClientSocket) -> mpsc::UnboundedReceiver<Request> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(request) = socket.next().await {
            if tx.send(request).is_err() {
                break;
            }
        }
    });
    rx
}

pub async fn wait_for_notification(
    rx: &mut mpsc::UnboundedReceiver<Request>,
    method: &str,
) -> Option<Request> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(request) = rx.recv().await {
            if request.method() == method {
                return Some(request);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
