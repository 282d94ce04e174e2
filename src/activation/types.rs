//! Common types for activation (Variant, Scope, ScopeKey)

use std::fmt;
use std::path::PathBuf;

use tower_lsp::lsp_types::{Url, WorkspaceFolder};

use crate::config::FullVariant;

/// The three mutually exclusive backend implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Lightweight fallback, always startable.
    Simple,
    /// Downloadable self-contained analysis server.
    FullA,
    /// Server shipped by a separately installed package.
    FullB,
}

impl Variant {
    pub fn is_full(self) -> bool {
        !matches!(self, Variant::Simple)
    }

    /// Telemetry event name used for protocol request capture.
    pub fn request_event_name(self) -> &'static str {
        match self {
            Variant::Simple => "jedi_language_server.request",
            Variant::FullA => "python_language_server.request",
            Variant::FullB => "language_server.request",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Simple => "simple",
            Variant::FullA => "full-a",
            Variant::FullB => "full-b",
        }
    }
}

impl From<FullVariant> for Variant {
    fn from(value: FullVariant) -> Self {
        match value {
            FullVariant::A => Variant::FullA,
            FullVariant::B => Variant::FullB,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interpreter a scope is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeIdentity {
    pub path: PathBuf,
    pub version: Option<String>,
}

impl RuntimeIdentity {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Cache key: workspace folder identity plus runtime path.
///
/// The folder part is empty when the resource has no folder context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey {
    folder: String,
    runtime: String,
}

impl ScopeKey {
    pub fn new(folder: Option<&WorkspaceFolder>, runtime: &RuntimeIdentity) -> Self {
        Self {
            folder: folder.map(|f| f.uri.to_string()).unwrap_or_default(),
            runtime: runtime.path.to_string_lossy().into_owned(),
        }
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.folder, self.runtime)
    }
}

/// A resource bound to a runtime, the unit served by one backend instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub resource: Option<Url>,
    pub folder: Option<WorkspaceFolder>,
    pub runtime: RuntimeIdentity,
}

impl Scope {
    pub fn key(&self) -> ScopeKey {
        ScopeKey::new(self.folder.as_ref(), &self.runtime)
    }
}
