//! Host collaborators
//! - mod.rs: interfaces the broker consumes from the editor host
//! - events.rs: change notifications published by the host
//! - platform.rs: process-level implementations used by the binary

pub mod events;
pub mod platform;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tower_lsp::jsonrpc;
use tower_lsp::lsp_types::{ConfigurationItem, PublishDiagnosticsParams, Url, WorkspaceFolder};

use crate::activation::types::{RuntimeIdentity, Scope, Variant};
use crate::config::{FullVariant, Settings};

pub use events::{ConfigurationChange, WorkspaceEvents};

/// Open workspace folders.
pub trait Workspace: Send + Sync {
    fn folders(&self) -> Vec<WorkspaceFolder>;

    /// Returns the folder containing `resource`, preferring the deepest match.
    fn folder_for(&self, resource: Option<&Url>) -> Option<WorkspaceFolder> {
        let resource = resource?;
        self.folders()
            .into_iter()
            .filter(|folder| contains(&folder.uri, resource))
            .max_by_key(|folder| folder.uri.as_str().len())
    }
}

fn contains(folder: &Url, resource: &Url) -> bool {
    let base = folder.as_str().trim_end_matches('/');
    let target = resource.as_str();
    target == base
        || target
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Per-resource settings lookup.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self, resource: Option<&Url>) -> Settings;
}

/// Environment variables as the host computes them (process env plus `.env` files).
#[async_trait]
pub trait EnvironmentVariables: Send + Sync {
    async fn variables(&self, resource: Option<&Url>) -> anyhow::Result<HashMap<String, String>>;
}

/// Resolves the active interpreter for a resource.
#[async_trait]
pub trait RuntimeResolver: Send + Sync {
    async fn active_runtime(&self, resource: Option<&Url>)
    -> anyhow::Result<Option<RuntimeIdentity>>;
}

/// Platform / prerequisite gate for the full servers.
#[cfg_attr(test, mockall::automock)]
pub trait Compatibility: Send + Sync {
    fn is_full_supported(&self, variant: FullVariant) -> bool;
}

/// A/B assignment hook.
#[cfg_attr(test, mockall::automock)]
pub trait Experiments: Send + Sync {
    fn prefers_simple(&self) -> bool;
}

/// User-facing prompt shown when a full server is missing.
#[cfg_attr(test, mockall::automock)]
pub trait Prompter: Send + Sync {
    fn prompt_not_installed(&self, variant: Variant);
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("Failed to install {variant}: {message}")]
    Failed { variant: Variant, message: String },
}

/// Makes sure a backend's binaries are present before it is started.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn ensure_available(&self, variant: Variant, scope: &Scope) -> Result<(), InstallError>;
}

/// Requests that flow from a backend back to the editor.
#[async_trait]
pub trait HostClient: Send + Sync {
    async fn configuration(&self, items: Vec<ConfigurationItem>) -> jsonrpc::Result<Vec<Value>>;

    async fn publish_diagnostics(&self, params: PublishDiagnosticsParams);
}

/// Experiments implementation with no assignments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExperiments;

impl Experiments for NoExperiments {
    fn prefers_simple(&self) -> bool {
        false
    }
}
