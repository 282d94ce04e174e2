//! Host collaborators backed by the editor connection

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tower_lsp::Client;
use tower_lsp::jsonrpc;
use tower_lsp::lsp_types::{
    ConfigurationItem, MessageType, PublishDiagnosticsParams, Url, WorkspaceFolder,
};
use tracing::{debug, warn};

use crate::activation::types::Variant;
use crate::config::Settings;
use crate::host::{HostClient, Prompter, SettingsProvider, Workspace};
use crate::telemetry::{TelemetryEvent, TelemetrySink};

/// Workspace folders and `python` settings as last reported by the editor.
#[derive(Debug, Default)]
pub struct HostWorkspace {
    folders: RwLock<Vec<WorkspaceFolder>>,
    settings: RwLock<Settings>,
}

impl HostWorkspace {
    pub fn new(settings: Settings) -> Self {
        Self {
            folders: RwLock::new(Vec::new()),
            settings: RwLock::new(settings),
        }
    }

    pub fn set_folders(&self, folders: Vec<WorkspaceFolder>) {
        *self.folders.write().unwrap_or_else(PoisonError::into_inner) = folders;
    }

    pub fn add_folders(&self, added: Vec<WorkspaceFolder>) {
        let mut folders = self.folders.write().unwrap_or_else(PoisonError::into_inner);
        for folder in added {
            if !folders.iter().any(|f| f.uri == folder.uri) {
                folders.push(folder);
            }
        }
    }

    pub fn remove_folders(&self, removed: &[WorkspaceFolder]) {
        self.folders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|f| !removed.iter().any(|r| r.uri == f.uri));
    }

    /// Replaces the settings, returning whether anything changed.
    pub fn set_settings(&self, settings: Settings) -> bool {
        let mut current = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        if *current == settings {
            return false;
        }
        *current = settings;
        true
    }
}

impl Workspace for HostWorkspace {
    fn folders(&self) -> Vec<WorkspaceFolder> {
        self.folders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SettingsProvider for HostWorkspace {
    fn settings(&self, _resource: Option<&Url>) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Forwards backend-originated requests to the editor.
pub struct ClientHost {
    client: Client,
}

impl ClientHost {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HostClient for ClientHost {
    async fn configuration(&self, items: Vec<ConfigurationItem>) -> jsonrpc::Result<Vec<Value>> {
        self.client.configuration(items).await
    }

    async fn publish_diagnostics(&self, params: PublishDiagnosticsParams) {
        self.client
            .publish_diagnostics(params.uri, params.diagnostics, params.version)
            .await;
    }
}

/// Shows the not-installed notice as an editor message.
pub struct ClientPrompter {
    client: Client,
}

impl ClientPrompter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Prompter for ClientPrompter {
    fn prompt_not_installed(&self, variant: Variant) {
        let client = self.client.clone();
        tokio::spawn(async move {
            client
                .show_message(
                    MessageType::WARNING,
                    format!(
                        "The {variant} language server is not installed; \
                         using the simple analyzer instead."
                    ),
                )
                .await;
        });
    }
}

/// Sends telemetry to the editor as `telemetry/event` and to the log.
pub struct ClientTelemetry {
    client: Client,
    fallback: Arc<dyn TelemetrySink>,
}

impl ClientTelemetry {
    pub fn new(client: Client, fallback: Arc<dyn TelemetrySink>) -> Self {
        Self { client, fallback }
    }
}

impl TelemetrySink for ClientTelemetry {
    fn emit(&self, event: TelemetryEvent) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "eventName": event.name,
            "measures": event.measures,
            "properties": event.properties,
        });
        self.fallback.emit(event)?;

        let client = self.client.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { client.telemetry_event(payload).await });
            }
            Err(e) => warn!("Dropping telemetry event outside runtime: {}", e),
        }
        debug!("Queued telemetry event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(uri: &str) -> WorkspaceFolder {
        WorkspaceFolder {
            uri: Url::parse(uri).unwrap(),
            name: uri.rsplit('/').next().unwrap_or_default().to_string(),
        }
    }

    #[test]
    fn adding_existing_folder_is_a_no_op() {
        let host = HostWorkspace::default();
        host.add_folders(vec![folder("file:///a"), folder("file:///b")]);
        host.add_folders(vec![folder("file:///a")]);

        assert_eq!(host.folders().len(), 2);
    }

    #[test]
    fn removing_folder_keeps_the_rest() {
        let host = HostWorkspace::default();
        host.set_folders(vec![folder("file:///a"), folder("file:///b")]);

        host.remove_folders(&[folder("file:///a")]);

        assert_eq!(host.folders(), vec![folder("file:///b")]);
    }

    #[test]
    fn set_settings_reports_changes_only() {
        let host = HostWorkspace::default();

        assert!(!host.set_settings(Settings::default()));
        assert!(host.set_settings(Settings {
            extra_paths: vec!["/opt".to_string()],
            ..Settings::default()
        }));
    }
}
