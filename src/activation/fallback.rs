//! Variant selection and fallback
//!
//! ```text
//! Unselected -> TryingFull -> Running(full)
//!            \            \-> FallenBack -> TryingSimple -> Running(simple) | Failed
//!             \-----------------------------/
//! ```
//!
//! Falling back is terminal: a failing simple variant fails the activation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::activation::error::ActivationError;
use crate::activation::manager::Manager;
use crate::activation::options::OptionsServices;
use crate::activation::selector::ActivationRecord;
use crate::activation::types::{Scope, Variant};
use crate::backend::BackendFactory;
use crate::config::Settings;
use crate::host::{
    Compatibility, Experiments, InstallError, Installer, Prompter, SettingsProvider,
};
use crate::telemetry::{self, TelemetryEvent, TelemetrySink};

/// Collaborators consulted while choosing a variant.
#[derive(Clone)]
pub struct VariantServices {
    pub settings: Arc<dyn SettingsProvider>,
    pub experiments: Arc<dyn Experiments>,
    pub compatibility: Arc<dyn Compatibility>,
    pub installer: Arc<dyn Installer>,
    pub prompter: Arc<dyn Prompter>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

/// Backend factories by variant.
#[derive(Clone, Default)]
pub struct Backends {
    factories: HashMap<Variant, Arc<dyn BackendFactory>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factories.insert(factory.variant(), factory);
        self
    }

    pub fn get(&self, variant: Variant) -> Option<Arc<dyn BackendFactory>> {
        self.factories.get(&variant).cloned()
    }
}

#[derive(Debug)]
pub enum ActivationState {
    Unselected,
    TryingFull(Variant),
    FallenBack { from: Option<Variant>, reason: String },
    TryingSimple,
    Running(Arc<ActivationRecord>),
    Failed(ActivationError),
}

impl ActivationState {
    fn name(&self) -> &'static str {
        match self {
            ActivationState::Unselected => "unselected",
            ActivationState::TryingFull(_) => "trying-full",
            ActivationState::FallenBack { .. } => "fallen-back",
            ActivationState::TryingSimple => "trying-simple",
            ActivationState::Running(_) => "running",
            ActivationState::Failed(_) => "failed",
        }
    }
}

/// First transition out of `Unselected`.
pub fn select(settings: &Settings, services: &VariantServices) -> ActivationState {
    if settings.use_simple_variant || services.experiments.prefers_simple() {
        debug!("Simple variant preferred");
        return ActivationState::TryingSimple;
    }

    let full = settings.full_variant;
    if !services.compatibility.is_full_supported(full) {
        let variant = Variant::from(full);
        info!("{} backend is not supported on this platform", variant);
        telemetry::send(
            services.telemetry.as_ref(),
            TelemetryEvent::new(telemetry::PLATFORM_NOT_SUPPORTED)
                .with_property("variant", variant.as_str()),
        );
        return ActivationState::TryingSimple;
    }

    ActivationState::TryingFull(full.into())
}

/// One run of the state machine for one scope.
pub(crate) struct Attempt<'a> {
    pub services: &'a VariantServices,
    pub backends: &'a Backends,
    pub options: &'a OptionsServices,
    /// Process-wide simple variant record.
    pub simple: &'a AsyncMutex<Option<Arc<ActivationRecord>>>,
    /// Whether the not-installed prompt has been shown.
    pub prompted: &'a AtomicBool,
}

impl Attempt<'_> {
    pub async fn run(&self, scope: &Scope) -> Result<Arc<ActivationRecord>, ActivationError> {
        let started = Instant::now();
        let settings = self.services.settings.settings(scope.resource.as_ref());
        let mut state = ActivationState::Unselected;

        loop {
            debug!("Activation of {} is {}", scope.key(), state.name());
            state = match state {
                ActivationState::Unselected => select(&settings, self.services),
                ActivationState::TryingFull(variant) => {
                    match self.start_full(variant, scope, &settings).await {
                        Ok(record) => ActivationState::Running(record),
                        Err(e) => {
                            warn!("{} backend failed to start: {}", variant, e);
                            ActivationState::FallenBack {
                                from: Some(variant),
                                reason: e.to_string(),
                            }
                        }
                    }
                }
                ActivationState::FallenBack { from, reason } => {
                    let mut event = TelemetryEvent::new(telemetry::FALLBACK)
                        .with_property("reason", reason);
                    if let Some(from) = from {
                        event = event.with_property("from", from.as_str());
                    }
                    telemetry::send(self.services.telemetry.as_ref(), event);
                    ActivationState::TryingSimple
                }
                ActivationState::TryingSimple => match self.start_simple(scope).await {
                    Ok(record) => ActivationState::Running(record),
                    Err(e) => ActivationState::Failed(e),
                },
                ActivationState::Running(record) => {
                    info!("Activated {} backend for {}", record.variant(), scope.key());
                    telemetry::send(
                        self.services.telemetry.as_ref(),
                        TelemetryEvent::new(telemetry::STARTUP)
                            .with_property("variant", record.variant().as_str())
                            .with_measure("duration", started.elapsed().as_secs_f64() * 1000.0),
                    );
                    return Ok(record);
                }
                ActivationState::Failed(e) => {
                    warn!("Activation of {} failed: {}", scope.key(), e);
                    return Err(e);
                }
            };
        }
    }

    async fn start_full(
        &self,
        variant: Variant,
        scope: &Scope,
        settings: &Settings,
    ) -> Result<Arc<ActivationRecord>, ActivationError> {
        // development mode runs the server from its local folder
        if !settings.download_disabled {
            if let Err(e) = self.services.installer.ensure_available(variant, scope).await {
                if matches!(e, InstallError::NotInstalled(_)) {
                    self.report_not_installed(variant);
                }
                return Err(e.into());
            }
        }

        let factory = self
            .backends
            .get(variant)
            .ok_or(ActivationError::NoBackend(variant))?;
        let manager = start_manager(factory, self.options, scope).await?;
        Ok(Arc::new(ActivationRecord::new(variant, manager)))
    }

    async fn start_simple(&self, scope: &Scope) -> Result<Arc<ActivationRecord>, ActivationError> {
        let mut slot = self.simple.lock().await;
        if let Some(record) = slot.as_ref().filter(|r| !r.is_disposed()) {
            debug!("Reusing simple backend for {}", scope.key());
            return Ok(record.clone());
        }

        let factory = self
            .backends
            .get(Variant::Simple)
            .ok_or(ActivationError::NoBackend(Variant::Simple))?;
        let manager = start_manager(factory, self.options, scope).await?;
        let record = Arc::new(ActivationRecord::new(Variant::Simple, manager));
        *slot = Some(record.clone());
        Ok(record)
    }

    fn report_not_installed(&self, variant: Variant) {
        telemetry::send(
            self.services.telemetry.as_ref(),
            TelemetryEvent::new(telemetry::NOT_INSTALLED).with_property("variant", variant.as_str()),
        );
        if !self.prompted.swap(true, Ordering::SeqCst) {
            self.services.prompter.prompt_not_installed(variant);
        }
    }
}

async fn start_manager(
    factory: Arc<dyn BackendFactory>,
    options: &OptionsServices,
    scope: &Scope,
) -> Result<Arc<Manager>, ActivationError> {
    let variant = factory.variant();
    let manager = Arc::new(Manager::new(factory, options.clone()));
    if let Err(source) = manager.start(scope.clone()).await {
        manager.dispose().await;
        return Err(ActivationError::Start { variant, source });
    }
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FullVariant;
    use crate::host::{MockCompatibility, MockExperiments, MockPrompter, NoExperiments};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tower_lsp::lsp_types::Url;

    struct Fixed(Settings);

    impl SettingsProvider for Fixed {
        fn settings(&self, _resource: Option<&Url>) -> Settings {
            self.0.clone()
        }
    }

    struct Installed;

    #[async_trait]
    impl Installer for Installed {
        async fn ensure_available(&self, _variant: Variant, _scope: &Scope) -> Result<(), InstallError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TelemetryEvent>>);

    impl TelemetrySink for Recorder {
        fn emit(&self, event: TelemetryEvent) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn services(
        settings: Settings,
        experiments: Arc<dyn Experiments>,
        compatibility: Arc<dyn Compatibility>,
        telemetry: Arc<Recorder>,
    ) -> VariantServices {
        VariantServices {
            settings: Arc::new(Fixed(settings)),
            experiments,
            compatibility,
            installer: Arc::new(Installed),
            prompter: Arc::new(MockPrompter::new()),
            telemetry,
        }
    }

    fn supported(expected: bool) -> Arc<dyn Compatibility> {
        let mut compatibility = MockCompatibility::new();
        compatibility
            .expect_is_full_supported()
            .returning(move |_| expected);
        Arc::new(compatibility)
    }

    #[test]
    fn explicit_opt_out_goes_straight_to_simple() {
        let settings = Settings {
            use_simple_variant: true,
            ..Settings::default()
        };
        let mut compatibility = MockCompatibility::new();
        compatibility.expect_is_full_supported().never();
        let services = services(
            settings.clone(),
            Arc::new(NoExperiments),
            Arc::new(compatibility),
            Arc::new(Recorder::default()),
        );

        assert!(matches!(
            select(&settings, &services),
            ActivationState::TryingSimple
        ));
    }

    #[test]
    fn experiment_assignment_prefers_simple() {
        let mut experiments = MockExperiments::new();
        experiments.expect_prefers_simple().return_const(true);
        let services = services(
            Settings::default(),
            Arc::new(experiments),
            supported(true),
            Arc::new(Recorder::default()),
        );

        assert!(matches!(
            select(&Settings::default(), &services),
            ActivationState::TryingSimple
        ));
    }

    #[test]
    fn unsupported_platform_skips_full_and_records_signal() {
        let recorder = Arc::new(Recorder::default());
        let services = services(
            Settings::default(),
            Arc::new(NoExperiments),
            supported(false),
            recorder.clone(),
        );

        assert!(matches!(
            select(&Settings::default(), &services),
            ActivationState::TryingSimple
        ));
        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, telemetry::PLATFORM_NOT_SUPPORTED);
    }

    #[test]
    fn supported_platform_tries_configured_full_variant() {
        let settings = Settings {
            full_variant: FullVariant::A,
            ..Settings::default()
        };
        let services = services(
            settings.clone(),
            Arc::new(NoExperiments),
            supported(true),
            Arc::new(Recorder::default()),
        );

        assert!(matches!(
            select(&settings, &services),
            ActivationState::TryingFull(Variant::FullA)
        ));
    }
}
