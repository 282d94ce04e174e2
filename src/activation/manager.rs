//! Per-scope backend lifecycle
//!
//! A manager owns at most one live backend instance. Option changes are
//! coalesced into a single restart; restarts and the initial start are
//! serialized on the instance slot so two starts never interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::activation::error::ManagerError;
use crate::activation::options::{AnalysisOptionsProvider, OptionsServices};
use crate::activation::types::{Scope, Variant};
use crate::backend::{BackendFactory, BackendInstance};
use crate::debounce::Debouncer;

pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    variant: Variant,
    factory: Arc<dyn BackendFactory>,
    options: AnalysisOptionsProvider,
    debounce: Duration,
    started: AtomicBool,
    disposed: AtomicBool,
    scope: Mutex<Option<Scope>>,
    slot: tokio::sync::Mutex<Option<Arc<dyn BackendInstance>>>,
    restarter: Mutex<Option<Debouncer>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(factory: Arc<dyn BackendFactory>, services: OptionsServices) -> Self {
        let variant = factory.variant();
        let debounce = services.debounce;
        Self {
            inner: Arc::new(ManagerInner {
                variant,
                factory,
                options: AnalysisOptionsProvider::new(services, variant),
                debounce,
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                scope: Mutex::new(None),
                slot: tokio::sync::Mutex::new(None),
                restarter: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn variant(&self) -> Variant {
        self.inner.variant
    }

    /// Starts the backend for `scope`. May only be called once.
    pub async fn start(&self, scope: Scope) -> Result<(), ManagerError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(ManagerError::Disposed);
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            error!("Manager for {} started twice", scope.key());
            return Err(ManagerError::AlreadyStarted);
        }

        *lock(&inner.scope) = Some(scope.clone());
        inner.options.initialize(scope.clone()).await?;

        let weak = Arc::downgrade(inner);
        *lock(&inner.restarter) = Some(Debouncer::new(inner.debounce, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    if let Err(e) = inner.restart_now().await {
                        warn!("Restart of {} backend failed: {}", inner.variant, e);
                    }
                }
            }
        }));
        let changes = inner.options.subscribe();
        *lock(&inner.listener) = Some(tokio::spawn(forward_changes(
            Arc::downgrade(inner),
            changes,
        )));

        let mut slot = inner.slot.lock().await;
        let instance = inner.launch(&scope).await?;

        // dispose() landed while the backend was starting
        if inner.disposed.load(Ordering::SeqCst) {
            dispose_quietly(instance.as_ref()).await;
            return Err(ManagerError::Disposed);
        }
        *slot = Some(instance);
        info!("Started {} backend for {}", inner.variant, scope.key());
        Ok(())
    }

    /// Schedules a restart after the debounce window.
    pub fn restart(&self) {
        match lock(&self.inner.restarter).as_ref() {
            Some(restarter) => restarter.trigger(),
            None => debug!("Restart requested before start"),
        }
    }

    /// Replaces the running backend with a fresh one right away.
    pub async fn restart_now(&self) -> Result<(), ManagerError> {
        self.inner.restart_now().await
    }

    /// Current backend, waiting out any restart in progress.
    pub async fn instance(&self) -> Option<Arc<dyn BackendInstance>> {
        self.inner.slot.lock().await.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Disposes the backend and all listeners. Safe to call more than once.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(listener) = lock(&inner.listener).take() {
            listener.abort();
        }
        // dropping the debouncer discards pending triggers; a restart already
        // running finishes and sees the disposed flag
        drop(lock(&inner.restarter).take());
        inner.options.dispose();

        let instance = inner.slot.lock().await.take();
        if let Some(instance) = instance {
            dispose_quietly(instance.as_ref()).await;
        }
        debug!("Disposed {} manager", inner.variant);
    }
}

impl ManagerInner {
    async fn launch(&self, scope: &Scope) -> Result<Arc<dyn BackendInstance>, ManagerError> {
        let options = self.options.options().await?;
        let instance = self.factory.create(scope)?;
        if let Err(e) = instance.start(options).await {
            dispose_quietly(instance.as_ref()).await;
            return Err(e.into());
        }
        Ok(instance)
    }

    async fn restart_now(&self) -> Result<(), ManagerError> {
        let mut slot = self.slot.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(scope) = lock(&self.scope).clone() else {
            return Ok(());
        };

        info!("Restarting {} backend for {}", self.variant, scope.key());
        if let Some(previous) = slot.take() {
            dispose_quietly(previous.as_ref()).await;
        }
        let instance = self.launch(&scope).await?;

        if self.disposed.load(Ordering::SeqCst) {
            dispose_quietly(instance.as_ref()).await;
            return Err(ManagerError::Disposed);
        }
        *slot = Some(instance);
        Ok(())
    }
}

async fn forward_changes(inner: Weak<ManagerInner>, mut changes: broadcast::Receiver<()>) {
    loop {
        match changes.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if let Some(restarter) = lock(&inner.restarter).as_ref() {
                    restarter.trigger();
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn dispose_quietly(instance: &dyn BackendInstance) {
    if let Err(e) = instance.dispose().await {
        warn!("Failed to dispose {} backend: {}", instance.variant(), e);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
