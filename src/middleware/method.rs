//! Intercepted protocol methods and their telemetry capture table

use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;

use crate::config::{DEBOUNCE_FREQUENT_CALL, DEBOUNCE_RARE_CALL};

/// Every protocol method the middleware intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    DidOpen,
    DidClose,
    DidChange,
    DidSave,
    WillSave,
    WillSaveWaitUntil,
    Completion,
    CompletionResolve,
    Hover,
    SignatureHelp,
    Definition,
    Declaration,
    References,
    DocumentHighlight,
    DocumentSymbol,
    WorkspaceSymbol,
    CodeAction,
    CodeLens,
    CodeLensResolve,
    Formatting,
    RangeFormatting,
    OnTypeFormatting,
    Rename,
    PrepareRename,
    DocumentLink,
    DocumentLinkResolve,
    PublishDiagnostics,
}

impl Method {
    pub const ALL: [Method; 27] = [
        Method::DidOpen,
        Method::DidClose,
        Method::DidChange,
        Method::DidSave,
        Method::WillSave,
        Method::WillSaveWaitUntil,
        Method::Completion,
        Method::CompletionResolve,
        Method::Hover,
        Method::SignatureHelp,
        Method::Definition,
        Method::Declaration,
        Method::References,
        Method::DocumentHighlight,
        Method::DocumentSymbol,
        Method::WorkspaceSymbol,
        Method::CodeAction,
        Method::CodeLens,
        Method::CodeLensResolve,
        Method::Formatting,
        Method::RangeFormatting,
        Method::OnTypeFormatting,
        Method::Rename,
        Method::PrepareRename,
        Method::DocumentLink,
        Method::DocumentLinkResolve,
        Method::PublishDiagnostics,
    ];

    /// Wire name of the method.
    pub fn lsp_name(self) -> &'static str {
        match self {
            Method::DidOpen => "textDocument/didOpen",
            Method::DidClose => "textDocument/didClose",
            Method::DidChange => "textDocument/didChange",
            Method::DidSave => "textDocument/didSave",
            Method::WillSave => "textDocument/willSave",
            Method::WillSaveWaitUntil => "textDocument/willSaveWaitUntil",
            Method::Completion => "textDocument/completion",
            Method::CompletionResolve => "completionItem/resolve",
            Method::Hover => "textDocument/hover",
            Method::SignatureHelp => "textDocument/signatureHelp",
            Method::Definition => "textDocument/definition",
            Method::Declaration => "textDocument/declaration",
            Method::References => "textDocument/references",
            Method::DocumentHighlight => "textDocument/documentHighlight",
            Method::DocumentSymbol => "textDocument/documentSymbol",
            Method::WorkspaceSymbol => "workspace/symbol",
            Method::CodeAction => "textDocument/codeAction",
            Method::CodeLens => "textDocument/codeLens",
            Method::CodeLensResolve => "codeLens/resolve",
            Method::Formatting => "textDocument/formatting",
            Method::RangeFormatting => "textDocument/rangeFormatting",
            Method::OnTypeFormatting => "textDocument/onTypeFormatting",
            Method::Rename => "textDocument/rename",
            Method::PrepareRename => "textDocument/prepareRename",
            Method::DocumentLink => "textDocument/documentLink",
            Method::DocumentLinkResolve => "documentLink/resolve",
            Method::PublishDiagnostics => "textDocument/publishDiagnostics",
        }
    }

    pub fn from_lsp_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.lsp_name() == name)
    }

    /// Notifications expect no response from the backend.
    pub fn is_notification(self) -> bool {
        matches!(
            self,
            Method::DidOpen
                | Method::DidClose
                | Method::DidChange
                | Method::DidSave
                | Method::WillSave
                | Method::PublishDiagnostics
        )
    }

    /// Open/close must reach the backend even before it reports ready, so the
    /// host can announce documents that were already open.
    pub fn bypasses_connect_gate(self) -> bool {
        matches!(self, Method::DidOpen | Method::DidClose)
    }

    /// Method name safe for telemetry pipelines that scrub slash-delimited paths.
    pub fn telemetry_name(self) -> String {
        self.lsp_name().replace('/', ".")
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.lsp_name())
    }
}

/// Lazily computed extra measures attached to a telemetry event.
pub type MeasureFn = fn(&Value) -> Vec<(&'static str, f64)>;

#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureRule {
    /// Minimum interval between two events for the method; `None` disables capture.
    pub debounce: Option<Duration>,
    pub measure: Option<MeasureFn>,
}

/// Capture configuration for every intercepted method.
#[derive(Debug, Clone)]
pub struct MethodTable {
    entries: IndexMap<Method, CaptureRule>,
}

impl MethodTable {
    pub fn get(&self, method: Method) -> CaptureRule {
        self.entries.get(&method).copied().unwrap_or_default()
    }

    pub fn with_debounce(mut self, method: Method, debounce: Duration) -> Self {
        self.entries.entry(method).or_default().debounce = Some(debounce);
        self
    }

    pub fn without_capture(mut self, method: Method) -> Self {
        self.entries.entry(method).or_default().debounce = None;
        self
    }

    /// Methods that currently produce telemetry, in declaration order.
    pub fn captured(&self) -> impl Iterator<Item = Method> + '_ {
        self.entries
            .iter()
            .filter(|(_, rule)| rule.debounce.is_some())
            .map(|(method, _)| *method)
    }
}

impl Default for MethodTable {
    fn default() -> Self {
        let mut entries: IndexMap<Method, CaptureRule> =
            Method::ALL.into_iter().map(|m| (m, CaptureRule::default())).collect();

        let frequent = [
            Method::Completion,
            Method::CompletionResolve,
            Method::Hover,
            Method::SignatureHelp,
            Method::DocumentSymbol,
            Method::CodeAction,
            Method::CodeLens,
            Method::CodeLensResolve,
            Method::PublishDiagnostics,
        ];
        let rare = [
            Method::Definition,
            Method::Declaration,
            Method::References,
            Method::WorkspaceSymbol,
            Method::Rename,
            Method::PrepareRename,
        ];

        for method in frequent {
            entries[&method].debounce = Some(DEBOUNCE_FREQUENT_CALL);
        }
        for method in rare {
            entries[&method].debounce = Some(DEBOUNCE_RARE_CALL);
        }
        entries[&Method::Completion].measure = Some(completion_length);

        Self { entries }
    }
}

/// Completion results are either a bare item array or a `CompletionList`.
fn completion_length(result: &Value) -> Vec<(&'static str, f64)> {
    let items = result
        .as_array()
        .or_else(|| result.get("items").and_then(Value::as_array));
    match items {
        Some(items) => vec![("resultLength", items.len() as f64)],
        None => Vec::new(),
    }
}
