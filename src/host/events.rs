use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Describes which settings sections a configuration change touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationChange {
    sections: Vec<String>,
}

impl ConfigurationChange {
    pub fn new<I, S>(sections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sections: sections.into_iter().map(Into::into).collect(),
        }
    }

    /// True when `section` (or one of its children) changed.
    pub fn affects(&self, section: &str) -> bool {
        self.sections.iter().any(|changed| {
            changed == section
                || changed
                    .strip_prefix(section)
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

/// Broadcast hub for host change notifications.
///
/// Cloning shares the underlying channels.
#[derive(Debug, Clone)]
pub struct WorkspaceEvents {
    settings: broadcast::Sender<ConfigurationChange>,
    environment: broadcast::Sender<()>,
    runtime: broadcast::Sender<()>,
}

impl WorkspaceEvents {
    pub fn new() -> Self {
        let (settings, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (environment, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (runtime, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings,
            environment,
            runtime,
        }
    }

    pub fn settings_changed(&self, change: ConfigurationChange) {
        // no receivers just means nobody is listening yet
        let _ = self.settings.send(change);
    }

    pub fn environment_changed(&self) {
        let _ = self.environment.send(());
    }

    pub fn runtime_changed(&self) {
        let _ = self.runtime.send(());
    }

    pub fn subscribe_settings(&self) -> broadcast::Receiver<ConfigurationChange> {
        self.settings.subscribe()
    }

    pub fn subscribe_environment(&self) -> broadcast::Receiver<()> {
        self.environment.subscribe()
    }

    pub fn subscribe_runtime(&self) -> broadcast::Receiver<()> {
        self.runtime.subscribe()
    }
}

impl Default for WorkspaceEvents {
    fn default() -> Self {
        Self::new()
    }
}
