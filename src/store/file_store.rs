use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::config::StoreConfig;
use crate::cookies::{Cookie, CookieCodec, CookieMatcher, DefaultCookieMatcher, JsonCookieCodec};
use crate::errors::{Result, StoreError};
use crate::events::{StoreId, Subscription};
use crate::runtime::StoreRuntime;
use crate::store::engine::CookieEngine;
use crate::store::worker::WorkerBridge;

enum Backend {
    Direct(CookieEngine),
    Worker(WorkerBridge),
}

/// File-backed cookie store.
///
/// Runs the engine in-process, or on a worker thread when [`StoreConfig::use_worker`] is set.
/// Both variants expose the same async operations. The `blocking_` variants are only available
/// for in-process stores, since waiting on the worker from a synchronous call would stall the
/// caller's runtime.
///
/// Hosts should call [`FileCookieStore::shutdown`] (or at least [`FileCookieStore::flush`]) at
/// exit, otherwise changes from the last debounce window are lost.
pub struct FileCookieStore {
    id: StoreId,
    config: StoreConfig,
    backend: Backend,
}

impl std::fmt::Debug for FileCookieStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCookieStore")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FileCookieStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        FileCookieStoreBuilder::from_config(config).build()
    }

    pub fn builder(path: impl Into<PathBuf>) -> FileCookieStoreBuilder {
        FileCookieStoreBuilder::from_config(StoreConfig::new(path))
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_worker_backed(&self) -> bool {
        matches!(self.backend, Backend::Worker(_))
    }

    pub fn subscribe(&self) -> Subscription {
        match &self.backend {
            Backend::Direct(engine) => engine.subscribe(),
            Backend::Worker(bridge) => bridge.subscribe(),
        }
    }

    pub async fn find_cookie(&self, domain: &str, path: &str, key: &str) -> Result<Option<Cookie>> {
        match &self.backend {
            Backend::Direct(engine) => engine.find_cookie(domain, path, key).await,
            Backend::Worker(bridge) => bridge.find_cookie(domain, path, key).await,
        }
    }

    pub async fn find_cookies(
        &self,
        domain: &str,
        path: Option<&str>,
        allow_special_use_domain: bool,
    ) -> Result<Vec<Cookie>> {
        match &self.backend {
            Backend::Direct(engine) => {
                engine
                    .find_cookies(domain, path, allow_special_use_domain)
                    .await
            }
            Backend::Worker(bridge) => {
                bridge
                    .find_cookies(domain, path, allow_special_use_domain)
                    .await
            }
        }
    }

    pub async fn put_cookie(&self, cookie: Cookie) -> Result<()> {
        match &self.backend {
            Backend::Direct(engine) => engine.put_cookie(cookie).await,
            Backend::Worker(bridge) => bridge.put_cookie(cookie).await,
        }
    }

    pub async fn update_cookie(&self, old: Cookie, new: Cookie) -> Result<()> {
        match &self.backend {
            Backend::Direct(engine) => engine.update_cookie(old, new).await,
            Backend::Worker(bridge) => bridge.update_cookie(old, new).await,
        }
    }

    pub async fn remove_cookie(&self, domain: &str, path: &str, key: &str) -> Result<()> {
        match &self.backend {
            Backend::Direct(engine) => engine.remove_cookie(domain, path, key).await,
            Backend::Worker(bridge) => bridge.remove_cookie(domain, path, key).await,
        }
    }

    pub async fn remove_cookies(&self, domain: &str, path: Option<&str>) -> Result<()> {
        match &self.backend {
            Backend::Direct(engine) => engine.remove_cookies(domain, path).await,
            Backend::Worker(bridge) => bridge.remove_cookies(domain, path).await,
        }
    }

    pub async fn remove_all_cookies(&self) -> Result<()> {
        match &self.backend {
            Backend::Direct(engine) => engine.remove_all_cookies().await,
            Backend::Worker(bridge) => bridge.remove_all_cookies().await,
        }
    }

    pub async fn get_all_cookies(&self) -> Result<Vec<Cookie>> {
        match &self.backend {
            Backend::Direct(engine) => engine.get_all_cookies().await,
            Backend::Worker(bridge) => bridge.get_all_cookies().await,
        }
    }

    /// Writes pending changes now. The file is current when this returns.
    pub async fn flush(&self) -> Result<()> {
        match &self.backend {
            Backend::Direct(engine) => engine.flush().await,
            Backend::Worker(bridge) => bridge.flush().await,
        }
    }

    /// Flushes and, for worker-backed stores, stops the worker. Operations on a shut down
    /// worker store fail with [`StoreError::WorkerTerminated`].
    pub async fn shutdown(&self) -> Result<()> {
        debug!("CookieStore[{}]: shutting down", self.id);
        match &self.backend {
            Backend::Direct(engine) => engine.flush().await,
            Backend::Worker(bridge) => bridge.shutdown().await,
        }
    }

    pub fn blocking_find_cookie(&self, domain: &str, path: &str, key: &str) -> Result<Option<Cookie>> {
        self.direct("find_cookie")?
            .blocking_find_cookie(domain, path, key)
    }

    pub fn blocking_find_cookies(
        &self,
        domain: &str,
        path: Option<&str>,
        allow_special_use_domain: bool,
    ) -> Result<Vec<Cookie>> {
        self.direct("find_cookies")?
            .blocking_find_cookies(domain, path, allow_special_use_domain)
    }

    pub fn blocking_put_cookie(&self, cookie: Cookie) -> Result<()> {
        self.direct("put_cookie")?.blocking_put_cookie(cookie)
    }

    pub fn blocking_update_cookie(&self, old: Cookie, new: Cookie) -> Result<()> {
        self.direct("update_cookie")?.blocking_update_cookie(old, new)
    }

    pub fn blocking_remove_cookie(&self, domain: &str, path: &str, key: &str) -> Result<()> {
        self.direct("remove_cookie")?
            .blocking_remove_cookie(domain, path, key)
    }

    pub fn blocking_remove_cookies(&self, domain: &str, path: Option<&str>) -> Result<()> {
        self.direct("remove_cookies")?
            .blocking_remove_cookies(domain, path)
    }

    pub fn blocking_remove_all_cookies(&self) -> Result<()> {
        self.direct("remove_all_cookies")?
            .blocking_remove_all_cookies()
    }

    pub fn blocking_get_all_cookies(&self) -> Result<Vec<Cookie>> {
        self.direct("get_all_cookies")?.blocking_get_all_cookies()
    }

    pub fn blocking_flush(&self) -> Result<()> {
        self.direct("flush")?.blocking_flush()
    }

    fn direct(&self, op: &'static str) -> Result<&CookieEngine> {
        match &self.backend {
            Backend::Direct(engine) => Ok(engine),
            Backend::Worker(_) => Err(StoreError::BlockingInWorkerMode(op)),
        }
    }
}

/// Builder for [`FileCookieStore`].
pub struct FileCookieStoreBuilder {
    config: StoreConfig,
    id: Option<StoreId>,
    codec: Option<Arc<dyn CookieCodec>>,
    matcher: Option<Arc<dyn CookieMatcher>>,
}

impl FileCookieStoreBuilder {
    fn from_config(config: StoreConfig) -> Self {
        Self {
            config,
            id: None,
            codec: None,
            matcher: None,
        }
    }

    pub fn id(mut self, id: StoreId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn debounce(mut self, delay: Duration) -> Self {
        self.config.debounce = delay;
        self
    }

    pub fn use_worker(mut self, enabled: bool) -> Self {
        self.config.use_worker = enabled;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn CookieCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn matcher(mut self, matcher: Arc<dyn CookieMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Validates the configuration and starts the store. No file is read until the first
    /// operation.
    pub fn build(self) -> Result<FileCookieStore> {
        self.config.validate()?;

        let id = self.id.unwrap_or_default();
        let codec = self.codec.unwrap_or_else(|| Arc::new(JsonCookieCodec));
        let matcher = self.matcher.unwrap_or_else(|| Arc::new(DefaultCookieMatcher));
        let runtime = StoreRuntime::acquire()?;

        let backend = if self.config.use_worker {
            Backend::Worker(WorkerBridge::spawn_with(id, &self.config, codec, matcher, runtime)?)
        } else {
            Backend::Direct(CookieEngine::with_parts(id, &self.config, codec, matcher, runtime)?)
        };

        debug!(
            "CookieStore[{}]: opened {} ({})",
            id,
            self.config.path.display(),
            if self.config.use_worker { "worker" } else { "direct" }
        );

        Ok(FileCookieStore {
            id,
            config: self.config,
            backend,
        })
    }
}
