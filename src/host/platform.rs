//! Process-level collaborator implementations used by the binary

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tower_lsp::lsp_types::{Url, WorkspaceFolder};
use tracing::debug;

use crate::activation::types::{RuntimeIdentity, Scope, Variant};
use crate::config::{FullVariant, Settings};
use crate::host::{
    Compatibility, EnvironmentVariables, InstallError, Installer, RuntimeResolver,
    SettingsProvider, Workspace,
};

/// Default env file name, looked up in the workspace folder.
pub const DEFAULT_ENV_FILE: &str = ".env";

const WORKSPACE_FOLDER_VAR: &str = "${workspaceFolder}";
const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Process environment overlaid with the folder's env file.
///
/// Variables from the file win, except `PYTHONPATH` and `PATH`, where the
/// process value is appended to the file's.
pub struct EnvFileEnvironment {
    settings: Arc<dyn SettingsProvider>,
    workspace: Arc<dyn Workspace>,
}

impl EnvFileEnvironment {
    pub fn new(settings: Arc<dyn SettingsProvider>, workspace: Arc<dyn Workspace>) -> Self {
        Self {
            settings,
            workspace,
        }
    }
}

#[async_trait]
impl EnvironmentVariables for EnvFileEnvironment {
    async fn variables(&self, resource: Option<&Url>) -> anyhow::Result<HashMap<String, String>> {
        let mut vars: HashMap<String, String> = std::env::vars().collect();
        let folder = self.workspace.folder_for(resource);
        let Some(path) = env_file_path(&self.settings.settings(resource), folder.as_ref()) else {
            return Ok(vars);
        };

        let file_vars = tokio::task::spawn_blocking(move || read_env_file(&path)).await??;
        for (key, value) in file_vars {
            let merged = match (key.as_str(), vars.get(&key)) {
                ("PYTHONPATH" | "PATH", Some(process)) if !process.is_empty() && !value.is_empty() => {
                    join_path_lists(&value, process)
                }
                _ => value,
            };
            vars.insert(key, merged);
        }
        Ok(vars)
    }
}

/// Env file that applies to a folder: `python.envFile` when set, otherwise
/// `.env` in the folder. `None` when neither can be located.
pub fn env_file_path(settings: &Settings, folder: Option<&WorkspaceFolder>) -> Option<PathBuf> {
    let root = folder.and_then(|f| f.uri.to_file_path().ok());
    let configured = settings
        .env_file
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty());

    let Some(configured) = configured else {
        return root.map(|root| root.join(DEFAULT_ENV_FILE));
    };

    let expanded = match &root {
        Some(root) => configured.replace(WORKSPACE_FOLDER_VAR, &root.to_string_lossy()),
        None if configured.contains(WORKSPACE_FOLDER_VAR) => return None,
        None => configured.to_string(),
    };
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        Some(path)
    } else {
        root.map(|root| root.join(path))
    }
}

fn read_env_file(path: &Path) -> anyhow::Result<Vec<(String, String)>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let vars = dotenv::from_path_iter(path)?.collect::<Result<Vec<_>, _>>()?;
    debug!("Read {} variables from {:?}", vars.len(), path);
    Ok(vars)
}

fn join_path_lists(first: &str, second: &str) -> String {
    std::env::join_paths(std::env::split_paths(first).chain(std::env::split_paths(second)))
        .map(|joined| joined.to_string_lossy().into_owned())
        .unwrap_or_else(|_| first.to_string())
}

/// Resolves the interpreter from the `pythonPath` setting, then an explicit
/// default, then the first `python3`/`python` on PATH.
///
/// The version is queried once per interpreter path with `--version`.
pub struct ConfiguredRuntime {
    settings: Arc<dyn SettingsProvider>,
    default_path: Option<PathBuf>,
    versions: Mutex<HashMap<PathBuf, Option<String>>>,
}

impl ConfiguredRuntime {
    pub fn new(settings: Arc<dyn SettingsProvider>, default_path: Option<PathBuf>) -> Self {
        Self {
            settings,
            default_path,
            versions: Mutex::new(HashMap::new()),
        }
    }

    async fn identity(&self, path: PathBuf) -> RuntimeIdentity {
        let cached = self
            .versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path)
            .cloned();
        let version = match cached {
            Some(version) => version,
            None => {
                let version = query_version(&path).await;
                self.versions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(path.clone(), version.clone());
                version
            }
        };

        let runtime = RuntimeIdentity::new(path);
        match version {
            Some(version) => runtime.with_version(version),
            None => runtime,
        }
    }
}

#[async_trait]
impl RuntimeResolver for ConfiguredRuntime {
    async fn active_runtime(
        &self,
        resource: Option<&Url>,
    ) -> anyhow::Result<Option<RuntimeIdentity>> {
        let configured = self
            .settings
            .settings(resource)
            .python_path
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let found = match configured.or_else(|| self.default_path.clone()) {
            Some(path) => Some(path),
            None => {
                let found = ["python3", "python"]
                    .iter()
                    .find_map(|name| which::which(name).ok());
                debug!("Resolved interpreter from PATH: {:?}", found);
                found
            }
        };

        match found {
            Some(path) => Ok(Some(self.identity(path).await)),
            None => Ok(None),
        }
    }
}

async fn query_version(path: &Path) -> Option<String> {
    let output = Command::new(path)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(VERSION_QUERY_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => {
            // old interpreters print the version on stderr
            let text = [output.stdout, output.stderr].concat();
            parse_version(&String::from_utf8_lossy(&text))
        }
        Ok(Ok(output)) => {
            debug!("{:?} --version exited with {}", path, output.status);
            None
        }
        Ok(Err(e)) => {
            debug!("Failed to run {:?} --version: {}", path, e);
            None
        }
        Err(_) => {
            debug!("{:?} --version timed out", path);
            None
        }
    }
}

/// `Python 3.11.4` -> `3.11.4`
fn parse_version(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.trim().strip_prefix("Python "))
        .map(|version| version.trim().to_string())
        .filter(|version| !version.is_empty())
}

/// The full servers ship binaries for the mainstream desktop targets only.
#[derive(Debug, Clone)]
pub struct PlatformCompatibility {
    os: String,
    arch: String,
}

impl PlatformCompatibility {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }
}

impl Default for PlatformCompatibility {
    fn default() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }
}

impl Compatibility for PlatformCompatibility {
    fn is_full_supported(&self, variant: FullVariant) -> bool {
        let os_ok = matches!(self.os.as_str(), "linux" | "macos" | "windows");
        let arch_ok = match variant {
            // self-contained build is only published for x86_64
            FullVariant::A => self.arch == "x86_64",
            FullVariant::B => matches!(self.arch.as_str(), "x86_64" | "aarch64"),
        };
        os_ok && arch_ok
    }
}

/// Checks that each variant's server program is resolvable on a search path.
pub struct PathInstaller {
    programs: HashMap<Variant, String>,
    search_path: Option<OsString>,
}

impl PathInstaller {
    pub fn new(programs: HashMap<Variant, String>) -> Self {
        Self {
            programs,
            search_path: std::env::var_os("PATH"),
        }
    }

    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }
}

#[async_trait]
impl Installer for PathInstaller {
    async fn ensure_available(&self, variant: Variant, scope: &Scope) -> Result<(), InstallError> {
        let Some(program) = self.programs.get(&variant) else {
            return Err(InstallError::NotInstalled(variant.to_string()));
        };

        let cwd = scope
            .folder
            .as_ref()
            .and_then(|f| f.uri.to_file_path().ok())
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        which::which_in(program, self.search_path.as_ref(), cwd)
            .map(|path| debug!("{} server found at {:?}", variant, path))
            .map_err(|_| InstallError::NotInstalled(program.clone()))
    }
}
