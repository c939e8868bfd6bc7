//! The cookie engine: index, codec and write-back scheduler behind one API.
//!
//! The engine loads the backing file the first time any operation runs. Both the async path
//! (`ensure_ready`) and the blocking one (`ensure_ready_blocking`) go through the same init
//! lock, so whichever arrives first loads the file and the others find the engine `Ready`.
//!
//! ### Load rules
//! - Missing file: empty index, not an error.
//! - Unreadable, empty or unparsable file: empty index and a warning.
//! - Entries the codec cannot decode are skipped with a warning; their siblings still load.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::config::StoreConfig;
use crate::cookies::{Cookie, CookieCodec, CookieMatcher, DefaultCookieMatcher, JsonCookieCodec};
use crate::errors::{Result, StoreError};
use crate::events::{EventBus, StoreEvent, StoreId, Subscription};
use crate::runtime::StoreRuntime;
use crate::store::index::CookieIndex;
use crate::store::scheduler::{PersistenceScheduler, SchedulerState, Snapshot, SnapshotSource};
use crate::store::worker::{StoreOp, StoreOpResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Loading,
    Ready,
}

struct EngineInner {
    id: StoreId,
    path: PathBuf,
    codec: Arc<dyn CookieCodec>,
    matcher: Arc<dyn CookieMatcher>,
    index: RwLock<CookieIndex>,
    init: Mutex<InitState>,
    ready: AtomicBool,
    scheduler: PersistenceScheduler,
    bus: Arc<EventBus>,
}

/// Cookie engine owning the in-memory index of one backing file.
#[derive(Clone)]
pub struct CookieEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for CookieEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieEngine")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("init", &self.init_state())
            .finish_non_exhaustive()
    }
}

impl CookieEngine {
    /// Creates an engine with the default codec and matcher.
    ///
    /// The file is not touched until the first operation.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        Self::with_parts(
            StoreId::new(),
            config,
            Arc::new(JsonCookieCodec),
            Arc::new(DefaultCookieMatcher),
            StoreRuntime::acquire()?,
        )
    }

    pub(crate) fn with_parts(
        id: StoreId,
        config: &StoreConfig,
        codec: Arc<dyn CookieCodec>,
        matcher: Arc<dyn CookieMatcher>,
        runtime: StoreRuntime,
    ) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::default());
        let scheduler = PersistenceScheduler::new(
            id,
            config.path.clone(),
            config.debounce,
            runtime,
            bus.clone(),
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                id,
                path: config.path.clone(),
                codec,
                matcher,
                index: RwLock::new(CookieIndex::new()),
                init: Mutex::new(InitState::Uninitialized),
                ready: AtomicBool::new(false),
                scheduler,
                bus,
            }),
        })
    }

    pub fn id(&self) -> StoreId {
        self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    pub fn init_state(&self) -> InitState {
        if self.inner.ready.load(Ordering::Acquire) {
            return InitState::Ready;
        }
        // The init lock is only held for the duration of a load
        self.inner
            .init
            .try_lock()
            .map(|state| *state)
            .unwrap_or(InitState::Loading)
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.inner.scheduler.state()
    }

    /// Loads the backing file on the calling thread if that has not happened yet.
    pub fn ensure_ready_blocking(&self) {
        self.inner.ensure_ready_blocking();
    }

    /// Loads the backing file on the blocking pool if that has not happened yet.
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.inner.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.ensure_ready_blocking())
            .await
            .map_err(|e| StoreError::Runtime(e.to_string()))
    }

    // ---------------------------------------------------------------------------------------
    // Async operations

    pub async fn find_cookie(&self, domain: &str, path: &str, key: &str) -> Result<Option<Cookie>> {
        self.ensure_ready().await?;
        Ok(self.lookup(domain, path, key))
    }

    pub async fn find_cookies(
        &self,
        domain: &str,
        path: Option<&str>,
        allow_special_use_domain: bool,
    ) -> Result<Vec<Cookie>> {
        self.ensure_ready().await?;
        Ok(self.lookup_many(domain, path, allow_special_use_domain))
    }

    pub async fn put_cookie(&self, cookie: Cookie) -> Result<()> {
        self.ensure_ready().await?;
        self.mutate(|index| index.put(cookie));
        Ok(())
    }

    /// Replaces `old` by `new`. Only `new`'s identity matters; `old` is not removed.
    pub async fn update_cookie(&self, _old: Cookie, new: Cookie) -> Result<()> {
        self.put_cookie(new).await
    }

    pub async fn remove_cookie(&self, domain: &str, path: &str, key: &str) -> Result<()> {
        self.ensure_ready().await?;
        self.mutate(|index| {
            index.remove(domain, path, key);
        });
        Ok(())
    }

    pub async fn remove_cookies(&self, domain: &str, path: Option<&str>) -> Result<()> {
        self.ensure_ready().await?;
        self.mutate(|index| index.remove_all(domain, path));
        Ok(())
    }

    pub async fn remove_all_cookies(&self) -> Result<()> {
        self.ensure_ready().await?;
        self.mutate(CookieIndex::clear);
        Ok(())
    }

    pub async fn get_all_cookies(&self) -> Result<Vec<Cookie>> {
        self.ensure_ready().await?;
        Ok(self.inner.index.read().list_all())
    }

    /// Forces any pending write to disk and announces [`StoreEvent::Flushed`].
    pub async fn flush(&self) -> Result<()> {
        let result = self
            .inner
            .scheduler
            .flush_async(self.inner.clone())
            .await
            .map(|_| ());
        self.inner.bus.publish(StoreEvent::Flushed);
        result
    }

    /// Runs a serialized operation, as received by a worker.
    pub async fn execute(&self, op: StoreOp) -> Result<StoreOpResult> {
        match op {
            StoreOp::FindCookie { domain, path, key } => self
                .find_cookie(&domain, &path, &key)
                .await
                .map(StoreOpResult::Cookie),
            StoreOp::FindCookies {
                domain,
                path,
                allow_special_use_domain,
            } => self
                .find_cookies(&domain, path.as_deref(), allow_special_use_domain)
                .await
                .map(StoreOpResult::Cookies),
            StoreOp::PutCookie { cookie } => {
                self.put_cookie(cookie).await.map(|_| StoreOpResult::Done)
            }
            StoreOp::UpdateCookie { old, new } => {
                self.update_cookie(old, new).await.map(|_| StoreOpResult::Done)
            }
            StoreOp::RemoveCookie { domain, path, key } => self
                .remove_cookie(&domain, &path, &key)
                .await
                .map(|_| StoreOpResult::Done),
            StoreOp::RemoveCookies { domain, path } => self
                .remove_cookies(&domain, path.as_deref())
                .await
                .map(|_| StoreOpResult::Done),
            StoreOp::RemoveAllCookies => {
                self.remove_all_cookies().await.map(|_| StoreOpResult::Done)
            }
            StoreOp::GetAllCookies => self.get_all_cookies().await.map(StoreOpResult::Cookies),
        }
    }

    // ---------------------------------------------------------------------------------------
    // Blocking operations

    pub fn blocking_find_cookie(&self, domain: &str, path: &str, key: &str) -> Result<Option<Cookie>> {
        self.ensure_ready_blocking();
        Ok(self.lookup(domain, path, key))
    }

    pub fn blocking_find_cookies(
        &self,
        domain: &str,
        path: Option<&str>,
        allow_special_use_domain: bool,
    ) -> Result<Vec<Cookie>> {
        self.ensure_ready_blocking();
        Ok(self.lookup_many(domain, path, allow_special_use_domain))
    }

    pub fn blocking_put_cookie(&self, cookie: Cookie) -> Result<()> {
        self.ensure_ready_blocking();
        self.mutate(|index| index.put(cookie));
        Ok(())
    }

    pub fn blocking_update_cookie(&self, _old: Cookie, new: Cookie) -> Result<()> {
        self.blocking_put_cookie(new)
    }

    pub fn blocking_remove_cookie(&self, domain: &str, path: &str, key: &str) -> Result<()> {
        self.ensure_ready_blocking();
        self.mutate(|index| {
            index.remove(domain, path, key);
        });
        Ok(())
    }

    pub fn blocking_remove_cookies(&self, domain: &str, path: Option<&str>) -> Result<()> {
        self.ensure_ready_blocking();
        self.mutate(|index| index.remove_all(domain, path));
        Ok(())
    }

    pub fn blocking_remove_all_cookies(&self) -> Result<()> {
        self.ensure_ready_blocking();
        self.mutate(CookieIndex::clear);
        Ok(())
    }

    pub fn blocking_get_all_cookies(&self) -> Result<Vec<Cookie>> {
        self.ensure_ready_blocking();
        Ok(self.inner.index.read().list_all())
    }

    pub fn blocking_flush(&self) -> Result<()> {
        let result = self.inner.scheduler.flush(self.inner.as_ref()).map(|_| ());
        self.inner.bus.publish(StoreEvent::Flushed);
        result
    }

    // ---------------------------------------------------------------------------------------

    fn lookup(&self, domain: &str, path: &str, key: &str) -> Option<Cookie> {
        self.inner.index.read().get(domain, path, key).cloned()
    }

    fn lookup_many(&self, domain: &str, path: Option<&str>, allow_special_use_domain: bool) -> Vec<Cookie> {
        let matcher = &self.inner.matcher;
        self.inner.index.read().find_by_domain(
            domain,
            path,
            |d| matcher.permute_domain(d, allow_special_use_domain),
            |requested, stored| matcher.path_match(requested, stored),
        )
    }

    /// Applies `f` to the index, then schedules a write-back.
    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut CookieIndex),
    {
        f(&mut self.inner.index.write());
        self.inner.scheduler.mark_dirty(self.inner.clone());
    }
}

impl EngineInner {
    fn ensure_ready_blocking(&self) {
        if self.ready.load(Ordering::Acquire) {
            return;
        }

        let mut init = self.init.lock();
        if *init == InitState::Ready {
            return;
        }
        *init = InitState::Loading;

        let index = load_index(self.id, &self.path, self.codec.as_ref());
        let records = index.len();
        *self.index.write() = index;

        *init = InitState::Ready;
        self.ready.store(true, Ordering::Release);
        drop(init);

        debug!(
            "CookieStore[{}]: loaded {} cookies from {}",
            self.id,
            records,
            self.path.display()
        );
        self.bus.publish(StoreEvent::Loaded { records });
    }
}

impl SnapshotSource for EngineInner {
    fn snapshot(&self) -> Result<Snapshot> {
        let index = self.index.read();

        let mut domains = Map::new();
        for (domain, paths) in index.domains() {
            let mut path_map = Map::new();
            for (path, keys) in paths {
                let entries: Map<String, Value> = keys
                    .iter()
                    .map(|(key, cookie)| (key.clone(), self.codec.encode(cookie)))
                    .collect();
                path_map.insert(path.clone(), Value::Object(entries));
            }
            domains.insert(domain.clone(), Value::Object(path_map));
        }
        let records = index.len();
        drop(index);

        let bytes = serde_json::to_vec_pretty(&Value::Object(domains))?;
        Ok(Snapshot { bytes, records })
    }
}

/// Reads the backing file into a fresh index. Never fails; problems are logged.
fn load_index(id: StoreId, path: &Path, codec: &dyn CookieCodec) -> CookieIndex {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(
                "CookieStore[{}]: {} does not exist yet, starting empty",
                id,
                path.display()
            );
            return CookieIndex::new();
        }
        Err(e) => {
            warn!("CookieStore[{}]: cannot read {}: {}", id, path.display(), e);
            return CookieIndex::new();
        }
    };

    if contents.trim().is_empty() {
        warn!("CookieStore[{}]: {} is empty", id, path.display());
        return CookieIndex::new();
    }

    let root: Value = match serde_json::from_str(&contents) {
        Ok(root) => root,
        Err(e) => {
            warn!(
                "CookieStore[{}]: cannot parse {}: {}",
                id,
                path.display(),
                e
            );
            return CookieIndex::new();
        }
    };

    let Value::Object(domains) = root else {
        warn!(
            "CookieStore[{}]: {} does not hold a JSON object",
            id,
            path.display()
        );
        return CookieIndex::new();
    };

    let mut index = CookieIndex::new();
    for (domain, paths) in &domains {
        let Some(paths) = paths.as_object() else {
            warn!("CookieStore[{}]: skipping malformed domain '{}'", id, domain);
            continue;
        };

        for (cookie_path, entries) in paths {
            let Some(entries) = entries.as_object() else {
                warn!(
                    "CookieStore[{}]: skipping malformed path '{}' of '{}'",
                    id, cookie_path, domain
                );
                continue;
            };

            for (key, plain) in entries {
                match codec.decode(plain) {
                    Some(cookie) => index.put(cookie),
                    None => warn!(
                        "CookieStore[{}]: skipping undecodable cookie '{}' at {}{}",
                        id, key, domain, cookie_path
                    ),
                }
            }
        }
    }

    index
}
