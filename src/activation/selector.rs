//! Activation selector and cache
//!
//! Maps a scope key to one shared activation future. The future is inserted
//! before anything is awaited, so every caller racing on the same key waits
//! on the same attempt. Rejected activations stay cached until their scope
//! is evicted, either because its folder closed or because the folder's
//! interpreter changed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tower_lsp::lsp_types::Url;
use tracing::{debug, info, warn};

use crate::activation::error::ActivationError;
use crate::activation::fallback::{Attempt, Backends, VariantServices};
use crate::activation::manager::Manager;
use crate::activation::options::OptionsServices;
use crate::activation::types::{RuntimeIdentity, Scope, ScopeKey, Variant};
use crate::host::RuntimeResolver;
use crate::middleware::{CallResult, Middleware, ProtocolCall};

pub type ActivationResult = Result<Arc<ActivationRecord>, Arc<ActivationError>>;
pub type ActivationFuture = Shared<BoxFuture<'static, ActivationResult>>;

/// The variant that ended up serving a scope, and its manager.
pub struct ActivationRecord {
    variant: Variant,
    manager: Arc<Manager>,
}

impl ActivationRecord {
    pub fn new(variant: Variant, manager: Arc<Manager>) -> Self {
        Self { variant, manager }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn is_disposed(&self) -> bool {
        self.manager.is_disposed()
    }

    /// True when both records are served by the same backend manager.
    pub fn shares_backend_with(&self, other: &ActivationRecord) -> bool {
        Arc::ptr_eq(&self.manager, &other.manager)
    }

    /// Middleware of the current backend instance, if one is running.
    pub async fn middleware(&self) -> Option<Arc<Middleware>> {
        self.manager.instance().await.map(|i| i.middleware())
    }

    /// Sends a host call to the backend serving this scope.
    pub async fn handle(&self, call: ProtocolCall) -> CallResult {
        match self.manager.instance().await {
            Some(instance) => instance.handle(call).await,
            None => {
                debug!("No running {} backend for {}", self.variant, call.method);
                Ok(None)
            }
        }
    }

    pub async fn dispose(&self) {
        self.manager.dispose().await;
    }
}

impl fmt::Debug for ActivationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationRecord")
            .field("variant", &self.variant)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[derive(Clone)]
pub struct Selector {
    inner: Arc<SelectorInner>,
}

struct SelectorInner {
    runtimes: Arc<dyn RuntimeResolver>,
    services: VariantServices,
    options: OptionsServices,
    backends: Backends,
    cache: Mutex<HashMap<ScopeKey, ActivationFuture>>,
    simple: AsyncMutex<Option<Arc<ActivationRecord>>>,
    prompted: AtomicBool,
    runtime_watch: Mutex<Option<JoinHandle<()>>>,
}

impl Selector {
    pub fn new(
        runtimes: Arc<dyn RuntimeResolver>,
        services: VariantServices,
        options: OptionsServices,
        backends: Backends,
    ) -> Self {
        let changes = options.events.subscribe_runtime();
        let inner = Arc::new(SelectorInner {
            runtimes,
            services,
            options,
            backends,
            cache: Mutex::new(HashMap::new()),
            simple: AsyncMutex::new(None),
            prompted: AtomicBool::new(false),
            runtime_watch: Mutex::new(None),
        });

        let watch = tokio::spawn(watch_runtimes(Arc::downgrade(&inner), changes));
        *lock(&inner.runtime_watch) = Some(watch);
        Self { inner }
    }

    /// Resolves the scope a resource belongs to. Without an explicit runtime
    /// the active interpreter for the resource is used.
    pub async fn scope_for(
        &self,
        resource: Option<&Url>,
        runtime: Option<RuntimeIdentity>,
    ) -> Result<Scope, ActivationError> {
        let runtime = match runtime {
            Some(runtime) => runtime,
            None => self
                .inner
                .runtimes
                .active_runtime(resource)
                .await
                .map_err(ActivationError::Runtime)?
                .ok_or_else(|| {
                    ActivationError::NoRuntime(
                        resource.map(Url::to_string).unwrap_or_default(),
                    )
                })?,
        };

        Ok(Scope {
            resource: resource.cloned(),
            folder: self.inner.options.workspace.folder_for(resource),
            runtime,
        })
    }

    /// Returns the cached activation future for the resource's scope,
    /// creating it when absent.
    pub async fn handle(
        &self,
        resource: Option<&Url>,
        runtime: Option<RuntimeIdentity>,
    ) -> Result<ActivationFuture, Arc<ActivationError>> {
        let scope = self.scope_for(resource, runtime).await.map_err(Arc::new)?;
        Ok(self.entry(scope))
    }

    pub async fn get(
        &self,
        resource: Option<&Url>,
        runtime: Option<RuntimeIdentity>,
    ) -> ActivationResult {
        self.handle(resource, runtime).await?.await
    }

    /// Warms the cache for `resource`.
    pub async fn activate(&self, resource: Option<&Url>) {
        if let Err(e) = self.get(resource, None).await {
            warn!("Failed to activate backend for {:?}: {}", resource.map(Url::as_str), e);
        }
    }

    pub fn contains(&self, key: &ScopeKey) -> bool {
        self.cache().contains_key(key)
    }

    pub fn keys(&self) -> Vec<ScopeKey> {
        let mut keys: Vec<ScopeKey> = self.cache().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Evicts and disposes activations whose workspace folder is no longer
    /// open. Keys without folder context are kept.
    pub async fn remove_stale_scopes(&self) -> Vec<ScopeKey> {
        let open: Vec<String> = self
            .inner
            .options
            .workspace
            .folders()
            .into_iter()
            .map(|f| f.uri.to_string())
            .collect();

        let evicted: Vec<(ScopeKey, ActivationFuture)> = {
            let mut cache = self.cache();
            let stale: Vec<ScopeKey> = cache
                .keys()
                .filter(|key| !key.folder().is_empty() && !open.iter().any(|f| f == key.folder()))
                .cloned()
                .collect();
            stale
                .into_iter()
                .filter_map(|key| cache.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        let keys = evicted.iter().map(|(key, _)| key.clone()).collect();
        self.dispose_entries(evicted).await;
        keys
    }

    /// Evicts and disposes activations bound to an interpreter other than
    /// the one now active for their folder.
    pub async fn remove_stale_runtimes(&self) -> Vec<ScopeKey> {
        let mut active: HashMap<String, Option<String>> = HashMap::new();
        let mut stale = Vec::new();

        for key in self.keys() {
            if !active.contains_key(key.folder()) {
                let folder = Url::parse(key.folder()).ok();
                let runtime = match self.inner.runtimes.active_runtime(folder.as_ref()).await {
                    Ok(runtime) => runtime.map(|r| r.path.to_string_lossy().into_owned()),
                    Err(e) => {
                        warn!("Failed to resolve interpreter for {:?}: {}", key.folder(), e);
                        None
                    }
                };
                active.insert(key.folder().to_string(), runtime);
            }

            // keep the activation when nothing could be resolved
            if let Some(Some(current)) = active.get(key.folder()) {
                if current != key.runtime() {
                    stale.push(key);
                }
            }
        }

        let evicted: Vec<(ScopeKey, ActivationFuture)> = {
            let mut cache = self.cache();
            stale
                .into_iter()
                .filter_map(|key| cache.remove(&key).map(|entry| (key, entry)))
                .collect()
        };
        if !evicted.is_empty() {
            info!("Interpreter changed, evicting {} activation(s)", evicted.len());
        }

        let keys = evicted.iter().map(|(key, _)| key.clone()).collect();
        self.dispose_entries(evicted).await;
        keys
    }

    /// Disposes every cached activation.
    pub async fn dispose(&self) {
        if let Some(watch) = lock(&self.inner.runtime_watch).take() {
            watch.abort();
        }
        let entries: Vec<(ScopeKey, ActivationFuture)> = self.cache().drain().collect();
        self.dispose_entries(entries).await;
    }

    fn entry(&self, scope: Scope) -> ActivationFuture {
        let key = scope.key();
        self.cache()
            .entry(key)
            .or_insert_with_key(|key| {
                info!("Creating activation for {}", key);
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.create(scope).await })
                    .map(|joined| match joined {
                        Ok(result) => result,
                        Err(e) => Err(Arc::new(ActivationError::Aborted(e.to_string()))),
                    })
                    .boxed()
                    .shared()
            })
            .clone()
    }

    async fn dispose_entries(&self, entries: Vec<(ScopeKey, ActivationFuture)>) {
        let mut records: Vec<Arc<ActivationRecord>> = Vec::new();
        for (key, entry) in entries {
            match entry.await {
                Ok(record) => {
                    if !records.iter().any(|r| r.shares_backend_with(&record)) {
                        records.push(record);
                    }
                }
                Err(e) => debug!("Evicting failed activation {}: {}", key, e),
            }
        }

        for record in records {
            if record.variant() == Variant::Simple && !self.release_simple(&record).await {
                continue;
            }
            record.dispose().await;
        }
    }

    /// Drops the simple singleton unless a remaining entry still uses it.
    async fn release_simple(&self, record: &Arc<ActivationRecord>) -> bool {
        let in_use = self.cache().values().any(|entry| {
            matches!(entry.peek(), Some(Ok(other)) if other.shares_backend_with(record))
        });
        if in_use {
            debug!("Simple backend still serves other scopes");
            return false;
        }

        let mut simple = self.inner.simple.lock().await;
        if simple.as_ref().is_some_and(|s| s.shares_backend_with(record)) {
            *simple = None;
        }
        true
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<ScopeKey, ActivationFuture>> {
        lock(&self.inner.cache)
    }
}

async fn watch_runtimes(inner: Weak<SelectorInner>, mut changes: broadcast::Receiver<()>) {
    loop {
        match changes.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                Selector { inner }.remove_stale_runtimes().await;
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SelectorInner {
    async fn create(&self, scope: Scope) -> ActivationResult {
        let attempt = Attempt {
            services: &self.services,
            backends: &self.backends,
            options: &self.options,
            simple: &self.simple,
            prompted: &self.prompted,
        };
        attempt.run(&scope).await.map_err(Arc::new)
    }
}
