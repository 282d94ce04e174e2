//! Protocol middleware
//! - method.rs: intercepted methods and the telemetry capture table
//! - chain.rs: interceptor chain composed around the terminal handler
//! - capture.rs: telemetry rate limiting window

pub mod capture;
pub mod chain;
pub mod method;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tokio::time::Instant;
use tower_lsp::jsonrpc;
use tower_lsp::lsp_types::{ConfigurationParams, DocumentFilter, PublishDiagnosticsParams, Url};
use tracing::{debug, trace, warn};

use crate::activation::types::Variant;
use crate::config::SETTINGS_SECTION;
use crate::host::{EnvironmentVariables, RuntimeResolver};
use crate::telemetry::{self, TelemetryEvent, TelemetrySink};

pub use capture::{CaptureLimits, CaptureWindow};
pub use chain::{CallResult, Chain, Handler, Interceptor, Next, ProtocolCall, handler};
pub use method::{CaptureRule, Method, MethodTable};

/// Files whose basename starts with this marker are internal scratch files;
/// their diagnostics never reach the host.
pub const HIDDEN_FILE_PREFIX: &str = "_HiddenFile_";

/// Key under which the resolved interpreter is injected into `python` settings.
const PYTHON_PATH_KEY: &str = "pythonPath";
/// Key under which `PYTHONPATH` from the computed environment is injected.
const ENV_PYTHON_PATH_KEY: &str = "_envPYTHONPATH";

/// Collaborators used to augment `workspace/configuration` answers.
#[derive(Clone)]
pub struct ConfigurationSources {
    pub runtimes: Arc<dyn RuntimeResolver>,
    pub environment: Arc<dyn EnvironmentVariables>,
}

/// Sits between the host and one backend connection.
pub struct Middleware {
    event_name: &'static str,
    server_version: Mutex<Option<String>>,
    connected: AtomicBool,
    document_selector: Mutex<Vec<DocumentFilter>>,
    telemetry: Arc<dyn TelemetrySink>,
    table: MethodTable,
    limits: CaptureLimits,
    capture: Mutex<CaptureWindow>,
    addons: Chain,
    sources: Option<ConfigurationSources>,
}

impl Middleware {
    pub fn new(variant: Variant, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            event_name: variant.request_event_name(),
            server_version: Mutex::new(None),
            connected: AtomicBool::new(false),
            document_selector: Mutex::new(Vec::new()),
            telemetry,
            table: MethodTable::default(),
            limits: CaptureLimits::default(),
            capture: Mutex::new(CaptureWindow::default()),
            addons: Chain::new(),
            sources: None,
        }
    }

    pub fn with_table(mut self, table: MethodTable) -> Self {
        self.table = table;
        self
    }

    pub fn with_limits(mut self, limits: CaptureLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Appends an addon interceptor that sees calls before the terminal handler.
    pub fn with_addon(mut self, addon: Arc<dyn Interceptor>) -> Self {
        self.addons = self.addons.with(addon);
        self
    }

    pub fn with_configuration_sources(mut self, sources: ConfigurationSources) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn set_server_version(&self, version: Option<String>) {
        *self
            .server_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = version;
    }

    pub fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Restricts the documents this backend claims. An empty selector claims
    /// every document.
    pub fn set_document_selector(&self, selector: Vec<DocumentFilter>) {
        *self
            .document_selector
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = selector;
    }

    /// False when the call names a document outside the selector.
    pub fn claims(&self, call: &ProtocolCall) -> bool {
        let Some(uri) = call
            .params
            .pointer("/textDocument/uri")
            .and_then(Value::as_str)
            .and_then(|uri| Url::parse(uri).ok())
        else {
            return true;
        };
        let language = call
            .params
            .pointer("/textDocument/languageId")
            .and_then(Value::as_str);

        let selector = self
            .document_selector
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        selector.is_empty()
            || selector
                .iter()
                .any(|filter| filter_matches(filter, &uri, language))
    }

    /// Runs `call` through the addon chain into `terminal` and captures
    /// telemetry once the call has settled.
    ///
    /// Language-feature calls made while disconnected are dropped and answer
    /// `Ok(None)`.
    pub async fn intercept(&self, call: ProtocolCall, terminal: Handler) -> CallResult {
        let method = call.method;
        if !method.bypasses_connect_gate() && !self.is_connected() {
            trace!("Suppressing {} while disconnected", method);
            return Ok(None);
        }
        if !self.claims(&call) {
            trace!("Document of {} belongs to another backend", method);
            return Ok(None);
        }

        let started = Instant::now();
        let called = Arc::new(AtomicBool::new(false));
        let tracked = {
            let called = called.clone();
            handler(move |call: ProtocolCall| {
                called.store(true, Ordering::SeqCst);
                terminal(call)
            })
        };

        let result = self.addons.compose(tracked)(call).await;

        if let Ok(value) = &result {
            self.capture(method, started, called.load(Ordering::SeqCst), value.as_ref());
        }
        result
    }

    /// Forwards diagnostics to the host unless they belong to a hidden file.
    pub async fn handle_diagnostics(&self, params: PublishDiagnosticsParams, next: Handler) {
        if is_hidden(&params.uri) {
            trace!("Dropping diagnostics for hidden file {}", params.uri);
            return;
        }

        let params = match serde_json::to_value(&params) {
            Ok(params) => params,
            Err(e) => {
                warn!("Failed to serialize diagnostics for {}: {}", params.uri, e);
                return;
            }
        };

        if let Err(e) = self
            .intercept(ProtocolCall::new(Method::PublishDiagnostics, params), next)
            .await
        {
            warn!("Failed to forward diagnostics: {}", e.message);
        }
    }

    /// Answers a backend `workspace/configuration` request.
    ///
    /// The host's answer comes from `next`; every item in the `python`
    /// section is then augmented with the resolved interpreter path and the
    /// computed `PYTHONPATH`. Not gated by `connect()`.
    pub async fn configuration<F, Fut>(
        &self,
        params: ConfigurationParams,
        next: F,
    ) -> jsonrpc::Result<Vec<Value>>
    where
        F: FnOnce(ConfigurationParams) -> Fut,
        Fut: Future<Output = jsonrpc::Result<Vec<Value>>>,
    {
        let items = params.items.clone();
        let mut settings = next(params).await?;

        let Some(sources) = &self.sources else {
            return Ok(settings);
        };

        for (item, value) in items.iter().zip(settings.iter_mut()) {
            if item.section.as_deref() != Some(SETTINGS_SECTION) {
                continue;
            }
            if value.is_null() {
                *value = Value::Object(Map::new());
            }
            let Some(section) = value.as_object_mut() else {
                debug!("Skipping non-object settings for {:?}", item.scope_uri);
                continue;
            };
            augment_section(sources, item.scope_uri.as_ref(), section).await;
        }

        Ok(settings)
    }

    fn capture(&self, method: Method, started: Instant, called: bool, result: Option<&Value>) {
        // nothing reached the backend, so there is nothing to measure
        if !called {
            return;
        }

        let rule = self.table.get(method);
        let Some(debounce) = rule.debounce else {
            return;
        };

        let admitted = self
            .capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(method, debounce, started, self.limits);
        if !admitted {
            return;
        }

        let version = self
            .server_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        let mut event = TelemetryEvent::new(self.event_name)
            .with_measure("duration", started.elapsed().as_secs_f64() * 1000.0)
            .with_property("lsVersion", version)
            .with_property("method", method.telemetry_name());

        if let Some(measure) = rule.measure {
            for (key, value) in measure(result.unwrap_or(&Value::Null)) {
                event = event.with_measure(key, value);
            }
        }

        telemetry::send(self.telemetry.as_ref(), event);
    }
}

async fn augment_section(
    sources: &ConfigurationSources,
    scope: Option<&Url>,
    section: &mut Map<String, Value>,
) {
    match sources.runtimes.active_runtime(scope).await {
        Ok(Some(runtime)) => {
            section.insert(
                PYTHON_PATH_KEY.to_string(),
                Value::String(runtime.path.to_string_lossy().into_owned()),
            );
        }
        Ok(None) => debug!("No active interpreter for {:?}", scope),
        Err(e) => warn!("Failed to resolve interpreter for {:?}: {}", scope, e),
    }

    match sources.environment.variables(scope).await {
        Ok(vars) => {
            if let Some(path) = vars.get("PYTHONPATH").filter(|p| !p.is_empty()) {
                section.insert(ENV_PYTHON_PATH_KEY.to_string(), Value::String(path.clone()));
            }
        }
        Err(e) => warn!("Failed to read environment for {:?}: {}", scope, e),
    }
}

/// Language is only checked when the call states it (`didOpen`).
fn filter_matches(filter: &DocumentFilter, uri: &Url, language: Option<&str>) -> bool {
    let language_ok = match (filter.language.as_deref(), language) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => true,
    };
    let scheme_ok = filter
        .scheme
        .as_deref()
        .is_none_or(|scheme| scheme == uri.scheme());
    let pattern_ok = filter
        .pattern
        .as_deref()
        .is_none_or(|pattern| pattern_matches(pattern, uri));
    language_ok && scheme_ok && pattern_ok
}

/// Folder patterns have the form `<root>/**/*`; anything else is not
/// interpreted and matches.
fn pattern_matches(pattern: &str, uri: &Url) -> bool {
    let Some(root) = pattern.strip_suffix("/**/*") else {
        return true;
    };
    uri.to_file_path()
        .is_ok_and(|path| path.starts_with(std::path::Path::new(root)))
}

fn is_hidden(uri: &Url) -> bool {
    uri.path_segments()
        .and_then(|mut segments| segments.next_back())
        .is_some_and(|name| name.starts_with(HIDDEN_FILE_PREFIX))
}
