//! Analysis options provider
//!
//! Builds the initialization payload for one scope and announces when it
//! would come out differently. Settings and environment refreshes are
//! coalesced and then compared by value against the last observed payload
//! inputs; an interpreter change is announced immediately.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tower_lsp::lsp_types::{DocumentFilter, Url, WorkspaceFolder};
use tracing::{debug, trace, warn};

use crate::activation::error::OptionsError;
use crate::activation::types::{Scope, Variant};
use crate::config::{RESTART_DEBOUNCE, SETTINGS_SECTION, Settings};
use crate::debounce::Debouncer;
use crate::host::{
    ConfigurationChange, EnvironmentVariables, SettingsProvider, Workspace, WorkspaceEvents,
};

const LANGUAGE_ID: &str = "python";
const DEFAULT_EXCLUDES: [&str; 2] = ["**/Lib/**", "**/site-packages/**"];

/// Everything a backend needs to be started for one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOptions {
    pub document_selector: Vec<DocumentFilter>,
    pub workspace_folder: Option<WorkspaceFolder>,
    pub initialization_options: Value,
}

/// Collaborators the provider reads from.
#[derive(Clone)]
pub struct OptionsServices {
    pub workspace: Arc<dyn Workspace>,
    pub settings: Arc<dyn SettingsProvider>,
    pub environment: Arc<dyn EnvironmentVariables>,
    pub events: WorkspaceEvents,
    pub debounce: Duration,
    /// Install folder per variant, used for the bundled typeshed fallback.
    pub server_folders: HashMap<Variant, PathBuf>,
}

impl OptionsServices {
    pub fn new(
        workspace: Arc<dyn Workspace>,
        settings: Arc<dyn SettingsProvider>,
        environment: Arc<dyn EnvironmentVariables>,
        events: WorkspaceEvents,
    ) -> Self {
        Self {
            workspace,
            settings,
            environment,
            events,
            debounce: RESTART_DEBOUNCE,
            server_folders: HashMap::new(),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_server_folder(mut self, variant: Variant, folder: impl Into<PathBuf>) -> Self {
        self.server_folders.insert(variant, folder.into());
        self
    }
}

/// Payload inputs remembered between reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Tracked {
    env_python_path: String,
    excluded_files: Vec<String>,
    typeshed_paths: Vec<String>,
    extra_paths: Vec<String>,
}

struct ProviderState {
    services: OptionsServices,
    variant: Variant,
    scope: Mutex<Option<Scope>>,
    tracked: Mutex<Tracked>,
    changed: broadcast::Sender<()>,
}

pub struct AnalysisOptionsProvider {
    state: Arc<ProviderState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl AnalysisOptionsProvider {
    pub fn new(services: OptionsServices, variant: Variant) -> Self {
        let (changed, _) = broadcast::channel(16);
        Self {
            state: Arc::new(ProviderState {
                services,
                variant,
                scope: Mutex::new(None),
                tracked: Mutex::new(Tracked::default()),
                changed,
            }),
            listener: Mutex::new(None),
        }
    }

    /// Binds the provider to `scope` and starts watching for changes.
    pub async fn initialize(&self, scope: Scope) -> Result<(), OptionsError> {
        let resource = scope.resource.clone();
        *lock(&self.state.scope) = Some(scope);

        let settings = self.state.services.settings.settings(resource.as_ref());
        let env_python_path = self.state.env_python_path().await?;
        *lock(&self.state.tracked) = Tracked {
            env_python_path,
            ..self.state.settings_inputs(&settings)
        };

        let receivers = Receivers {
            settings: self.state.services.events.subscribe_settings(),
            environment: self.state.services.events.subscribe_environment(),
            runtime: self.state.services.events.subscribe_runtime(),
        };
        let handle = tokio::spawn(listen(Arc::downgrade(&self.state), receivers));
        if let Some(previous) = lock(&self.listener).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Fires once per detected change.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.state.changed.subscribe()
    }

    pub async fn options(&self) -> Result<AnalysisOptions, OptionsError> {
        let scope = lock(&self.state.scope)
            .clone()
            .ok_or(OptionsError::NotInitialized)?;
        let services = &self.state.services;
        let resource = scope.resource.as_ref();

        let settings = services.settings.settings(resource);
        let env_python_path = self.state.env_python_path().await?;
        let inputs = self.state.settings_inputs(&settings);
        *lock(&self.state.tracked) = Tracked {
            env_python_path: env_python_path.clone(),
            ..inputs.clone()
        };

        let folder = services.workspace.folder_for(resource);
        // the simple backend is shared by every folder, so it claims them all
        let multi_root = services.workspace.folders().len() > 1 && self.state.variant.is_full();

        let initialization_options = match self.state.variant {
            Variant::FullA => {
                let mut properties = serde_json::Map::new();
                properties.insert(
                    "InterpreterPath".to_string(),
                    json!(scope.runtime.path.to_string_lossy()),
                );
                match &scope.runtime.version {
                    Some(version) => {
                        properties.insert("Version".to_string(), json!(version));
                    }
                    None => debug!("Interpreter version unknown for {:?}", scope.runtime.path),
                }
                json!({
                    "interpreter": { "properties": properties },
                    "searchPaths": search_paths(&settings, &env_python_path, &scope.runtime.path),
                    "typeStubSearchPaths": inputs.typeshed_paths,
                    "cacheFolderPath": settings.cache_folder_path.as_ref().filter(|p| !p.is_empty()),
                    "excludeFiles": inputs.excluded_files,
                    "testEnvironment": cfg!(test),
                })
            }
            // settings are pulled later through workspace/configuration
            Variant::FullB => json!({}),
            Variant::Simple => json!({
                "workspace": {
                    "extraPaths": settings.extra_paths,
                    "environmentPath": scope.runtime.path.to_string_lossy(),
                }
            }),
        };

        Ok(AnalysisOptions {
            document_selector: document_selector(folder.as_ref(), multi_root),
            workspace_folder: folder,
            initialization_options,
        })
    }

    /// Stops watching. Subscribers see the channel close once the provider is dropped.
    pub fn dispose(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
    }
}

impl Drop for AnalysisOptionsProvider {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl ProviderState {
    fn notify(&self) {
        trace!("Analysis options changed for {} backend", self.variant);
        let _ = self.changed.send(());
    }

    fn resource(&self) -> Option<Url> {
        lock(&self.scope).as_ref().and_then(|s| s.resource.clone())
    }

    async fn env_python_path(&self) -> Result<String, OptionsError> {
        let vars = self
            .services
            .environment
            .variables(self.resource().as_ref())
            .await
            .map_err(OptionsError::Environment)?;
        Ok(vars.get("PYTHONPATH").cloned().unwrap_or_default())
    }

    fn settings_inputs(&self, settings: &Settings) -> Tracked {
        Tracked {
            env_python_path: String::new(),
            excluded_files: excluded_files(settings),
            typeshed_paths: self.typeshed_paths(settings),
            extra_paths: settings.extra_paths.clone(),
        }
    }

    fn typeshed_paths(&self, settings: &Settings) -> Vec<String> {
        if !settings.typeshed_paths.is_empty() {
            return settings.typeshed_paths.clone();
        }
        self.services
            .server_folders
            .get(&self.variant)
            .map(|folder| vec![folder.join("Typeshed").to_string_lossy().into_owned()])
            .unwrap_or_default()
    }

    fn check_settings(&self) {
        let settings = self.services.settings.settings(self.resource().as_ref());
        let current = self.settings_inputs(&settings);

        let changed = {
            let mut tracked = lock(&self.tracked);
            let changed = values_differ(&tracked.excluded_files, &current.excluded_files)
                || values_differ(&tracked.typeshed_paths, &current.typeshed_paths)
                || values_differ(&tracked.extra_paths, &current.extra_paths);
            tracked.excluded_files = current.excluded_files;
            tracked.typeshed_paths = current.typeshed_paths;
            tracked.extra_paths = current.extra_paths;
            changed
        };

        if changed {
            debug!("Changes in python settings detected in analysis options");
            self.notify();
        }
    }

    async fn check_environment(&self) {
        let current = match self.env_python_path().await {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to re-read environment: {}", e);
                return;
            }
        };

        let changed = {
            let mut tracked = lock(&self.tracked);
            let changed = tracked.env_python_path != current;
            tracked.env_python_path = current;
            changed
        };

        if changed {
            debug!("PYTHONPATH changed in environment");
            self.notify();
        }
    }
}

struct Receivers {
    settings: broadcast::Receiver<ConfigurationChange>,
    environment: broadcast::Receiver<()>,
    runtime: broadcast::Receiver<()>,
}

async fn listen(state: Weak<ProviderState>, mut rx: Receivers) {
    let Some(window) = state.upgrade().map(|s| s.services.debounce) else {
        return;
    };

    let settings_check = {
        let state = state.clone();
        Debouncer::new(window, move || {
            let state = state.clone();
            async move {
                if let Some(state) = state.upgrade() {
                    state.check_settings();
                }
            }
        })
    };
    let environment_check = {
        let state = state.clone();
        Debouncer::new(window, move || {
            let state = state.clone();
            async move {
                if let Some(state) = state.upgrade() {
                    state.check_environment().await;
                }
            }
        })
    };

    loop {
        tokio::select! {
            received = rx.settings.recv() => match received {
                Ok(change) if change.affects(SETTINGS_SECTION) => {
                    settings_check.trigger();
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => settings_check.trigger(),
                Err(RecvError::Closed) => break,
            },
            received = rx.environment.recv() => match received {
                Ok(()) | Err(RecvError::Lagged(_)) => environment_check.trigger(),
                Err(RecvError::Closed) => break,
            },
            received = rx.runtime.recv() => match received {
                Ok(()) | Err(RecvError::Lagged(_)) => match state.upgrade() {
                    Some(state) => state.notify(),
                    None => break,
                },
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn document_selector(folder: Option<&WorkspaceFolder>, multi_root: bool) -> Vec<DocumentFilter> {
    let mut selector = vec![
        DocumentFilter {
            language: Some(LANGUAGE_ID.to_string()),
            scheme: Some("file".to_string()),
            pattern: None,
        },
        DocumentFilter {
            language: Some(LANGUAGE_ID.to_string()),
            scheme: Some("untitled".to_string()),
            pattern: None,
        },
    ];

    // scope to the folder so sibling instances do not claim each other's files
    if let Some(folder) = folder.filter(|_| multi_root) {
        let root = folder
            .uri
            .to_file_path()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| folder.uri.path().to_string());
        selector[0].pattern = Some(format!("{}/**/*", root.trim_end_matches('/')));
    }
    selector
}

fn excluded_files(settings: &Settings) -> Vec<String> {
    let mut list: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    for section in [
        &settings.search_exclude,
        &settings.files_exclude,
        &settings.files_watcher_exclude,
    ] {
        list.extend(enabled_globs(section));
    }
    list.extend(
        settings
            .lint_ignore_patterns
            .iter()
            .filter(|p| !p.is_empty())
            .cloned(),
    );
    list
}

fn enabled_globs(section: &BTreeMap<String, bool>) -> impl Iterator<Item = String> + '_ {
    section
        .iter()
        .filter(|(pattern, enabled)| **enabled && (pattern.contains('*') || pattern.contains('/')))
        .map(|(pattern, _)| pattern.clone())
}

/// Extra paths, then `PYTHONPATH` entries, then the interpreter's directory.
fn search_paths(settings: &Settings, env_python_path: &str, runtime: &Path) -> Vec<String> {
    let mut paths = settings.extra_paths.clone();
    paths.extend(
        std::env::split_paths(env_python_path)
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_string_lossy().into_owned()),
    );
    if let Some(dir) = runtime.parent().filter(|d| !d.as_os_str().is_empty()) {
        paths.push(dir.to_string_lossy().into_owned());
    }
    paths
}

/// Length first, then element by element.
fn values_differ(old: &[String], new: &[String]) -> bool {
    old.len() != new.len() || old.iter().zip(new).any(|(a, b)| a != b)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
