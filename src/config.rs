use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coalescing window for restarts and settings re-checks.
pub const RESTART_DEBOUNCE: Duration = Duration::from_secs(1);

/// Length of one telemetry capture window (1 hour).
pub const CAPTURE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Maximum number of telemetry events sent per capture window.
pub const CAPTURE_LIMIT: usize = 100;

/// For calls that are likely to happen often during a session (hover, completion, symbols).
pub const DEBOUNCE_FREQUENT_CALL: Duration = Duration::from_secs(5 * 60);

/// For calls that are less likely to happen during a session (go-to-def, workspace symbols).
pub const DEBOUNCE_RARE_CALL: Duration = Duration::from_secs(60);

/// Settings section owned by this broker.
pub const SETTINGS_SECTION: &str = "python";

/// Returns the path to the data directory for python-ls-broker.
/// Uses $XDG_DATA_HOME/python-ls-broker if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/python-ls-broker,
/// or ./python-ls-broker if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

pub const LOG_FILE_NAME: &str = "python-ls-broker.log";

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let data_dir = xdg_data_home
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("python-ls-broker")
}

/// Which of the two full servers to prefer when the simple one is not requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullVariant {
    /// Downloadable self-contained analysis server.
    A,
    /// Server shipped by a separately installed package.
    #[default]
    B,
}

/// Per-resource view of the `python` settings section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub use_simple_variant: bool,
    /// Development mode: run the full server from its local folder, skip downloads.
    pub download_disabled: bool,
    pub full_variant: FullVariant,
    pub python_path: Option<String>,
    /// Env file overlaid on the process environment; `${workspaceFolder}` is
    /// expanded and relative paths resolve against the folder.
    pub env_file: Option<String>,
    pub extra_paths: Vec<String>,
    pub typeshed_paths: Vec<String>,
    pub cache_folder_path: Option<String>,
    pub lint_ignore_patterns: Vec<String>,
    pub search_exclude: BTreeMap<String, bool>,
    pub files_exclude: BTreeMap<String, bool>,
    pub files_watcher_exclude: BTreeMap<String, bool>,
}

impl Settings {
    /// Reads settings out of a `{ "python": { ... } }` document, or the bare
    /// section itself. Unknown or malformed values fall back to defaults.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let section = value.get(SETTINGS_SECTION).unwrap_or(value);
        serde_json::from_value(section.clone()).unwrap_or_default()
    }
}
