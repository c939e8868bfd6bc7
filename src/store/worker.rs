//! Worker-offloaded store.
//!
//! A [`WorkerBridge`] owns no index. It starts a dedicated thread with its own current-thread
//! runtime that hosts a regular [`CookieEngine`], and forwards every operation to it as a
//! [`WorkerRequest::Call`] carrying a correlation id. Answers come back as
//! [`WorkerMessage::Response`] with the same id, in whatever order the worker produces them.
//! Engine events are relayed as [`WorkerMessage::Event`] and republished on the bridge.
//!
//! Wire shape, as JSON:
//!
//! ```json
//! { "type": "call", "correlationId": 7, "payload": { "op": "get_all_cookies" } }
//! { "type": "response", "correlationId": 7, "result": { "cookies": [] } }
//! { "type": "response", "correlationId": 8, "error": "..." }
//! { "type": "flush", "correlationId": 9 }
//! { "type": "event", "payload": "flushed" }
//! ```
//!
//! A flush is answered like a call, so a failed write reaches the caller as an error.
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use futures::FutureExt;
use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::StoreConfig;
use crate::cookies::{Cookie, CookieCodec, CookieMatcher, DefaultCookieMatcher, JsonCookieCodec};
use crate::errors::{Result, StoreError};
use crate::events::{EventBus, StoreEvent, StoreId, Subscription, DEFAULT_CHANNEL_CAPACITY};
use crate::runtime::StoreRuntime;
use crate::store::engine::CookieEngine;

/// A store operation in serializable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum StoreOp {
    FindCookie {
        domain: String,
        path: String,
        key: String,
    },
    FindCookies {
        domain: String,
        path: Option<String>,
        allow_special_use_domain: bool,
    },
    PutCookie {
        cookie: Cookie,
    },
    UpdateCookie {
        old: Cookie,
        new: Cookie,
    },
    RemoveCookie {
        domain: String,
        path: String,
        key: String,
    },
    RemoveCookies {
        domain: String,
        path: Option<String>,
    },
    RemoveAllCookies,
    GetAllCookies,
}

impl StoreOp {
    pub fn name(&self) -> &'static str {
        match self {
            StoreOp::FindCookie { .. } => "find_cookie",
            StoreOp::FindCookies { .. } => "find_cookies",
            StoreOp::PutCookie { .. } => "put_cookie",
            StoreOp::UpdateCookie { .. } => "update_cookie",
            StoreOp::RemoveCookie { .. } => "remove_cookie",
            StoreOp::RemoveCookies { .. } => "remove_cookies",
            StoreOp::RemoveAllCookies => "remove_all_cookies",
            StoreOp::GetAllCookies => "get_all_cookies",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOpResult {
    Cookie(Option<Cookie>),
    Cookies(Vec<Cookie>),
    Done,
}

impl StoreOpResult {
    pub fn into_cookie(self, op: &'static str) -> Result<Option<Cookie>> {
        match self {
            StoreOpResult::Cookie(cookie) => Ok(cookie),
            _ => Err(StoreError::UnexpectedResponse(op)),
        }
    }

    pub fn into_cookies(self, op: &'static str) -> Result<Vec<Cookie>> {
        match self {
            StoreOpResult::Cookies(cookies) => Ok(cookies),
            _ => Err(StoreError::UnexpectedResponse(op)),
        }
    }

    pub fn into_done(self, op: &'static str) -> Result<()> {
        match self {
            StoreOpResult::Done => Ok(()),
            _ => Err(StoreError::UnexpectedResponse(op)),
        }
    }
}

/// Messages sent to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Call {
        #[serde(rename = "correlationId")]
        correlation_id: u64,
        payload: StoreOp,
    },
    /// Write pending changes now and answer with the write result
    Flush {
        #[serde(rename = "correlationId")]
        correlation_id: u64,
    },
    /// Flush and stop the worker
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(StoreOpResult),
    Error(String),
}

/// Messages sent by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Response {
        #[serde(rename = "correlationId")]
        correlation_id: u64,
        #[serde(flatten)]
        outcome: Outcome,
    },
    Event {
        payload: StoreEvent,
    },
}

type Completion = oneshot::Sender<Result<StoreOpResult>>;

struct BridgeShared {
    id: StoreId,
    pending: Mutex<HashMap<u64, Completion>>,
    terminated: AtomicBool,
    bus: EventBus,
}

impl BridgeShared {
    /// Rejects everything still waiting and refuses new calls.
    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);

        let pending: Vec<Completion> = self.pending.lock().drain().map(|(_, tx)| tx).collect();

        if !pending.is_empty() {
            warn!(
                "CookieStore[{}]: worker terminated with {} pending calls",
                self.id,
                pending.len()
            );
        }

        for tx in pending {
            let _ = tx.send(Err(StoreError::WorkerTerminated));
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Removes a call from the pending table when its caller goes away before the answer.
struct PendingCall<'a> {
    shared: &'a BridgeShared,
    correlation_id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.correlation_id);
    }
}

/// Proxy that runs every store operation on a dedicated worker thread.
pub struct WorkerBridge {
    shared: Arc<BridgeShared>,
    requests: mpsc::Sender<WorkerRequest>,
    next_id: AtomicU64,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    // Keeps the relay task's runtime alive
    _runtime: StoreRuntime,
}

impl std::fmt::Debug for WorkerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBridge")
            .field("id", &self.shared.id)
            .field("terminated", &self.shared.is_terminated())
            .finish_non_exhaustive()
    }
}

impl WorkerBridge {
    /// Starts a worker thread hosting an engine for `config.path`.
    pub fn spawn(config: &StoreConfig) -> Result<Self> {
        Self::spawn_with(
            StoreId::new(),
            config,
            Arc::new(JsonCookieCodec),
            Arc::new(DefaultCookieMatcher),
            StoreRuntime::acquire()?,
        )
    }

    pub(crate) fn spawn_with(
        id: StoreId,
        config: &StoreConfig,
        codec: Arc<dyn CookieCodec>,
        matcher: Arc<dyn CookieMatcher>,
        runtime: StoreRuntime,
    ) -> Result<Self> {
        config.validate()?;

        let (request_tx, request_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (message_tx, message_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        let remote = config.for_remote();
        let thread = std::thread::Builder::new()
            .name(format!("cookie-store-worker-{id}"))
            .spawn(move || {
                if let Err(e) = run_worker(id, remote, codec, matcher, request_rx, message_tx) {
                    error!("CookieStore[{}]: worker failed: {:#}", id, e);
                }
            })?;

        let bridge = Self::from_channels(id, request_tx, message_rx, runtime);
        *bridge.thread.lock() = Some(thread);
        Ok(bridge)
    }

    /// Wires a bridge to an arbitrary worker through its two channels.
    pub(crate) fn from_channels(
        id: StoreId,
        requests: mpsc::Sender<WorkerRequest>,
        messages: mpsc::Receiver<WorkerMessage>,
        runtime: StoreRuntime,
    ) -> Self {
        let shared = Arc::new(BridgeShared {
            id,
            pending: Mutex::new(HashMap::new()),
            terminated: AtomicBool::new(false),
            bus: EventBus::default(),
        });

        runtime.handle().spawn(relay(shared.clone(), messages));

        Self {
            shared,
            requests,
            next_id: AtomicU64::new(1),
            thread: Mutex::new(None),
            _runtime: runtime,
        }
    }

    pub fn id(&self) -> StoreId {
        self.shared.id
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.bus.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated()
    }

    /// Sends `op` to the worker and waits for its correlated response.
    pub async fn call(&self, op: StoreOp) -> Result<StoreOpResult> {
        self.request(|correlation_id| WorkerRequest::Call {
            correlation_id,
            payload: op,
        })
        .await
    }

    async fn request(&self, build: impl FnOnce(u64) -> WorkerRequest) -> Result<StoreOpResult> {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.shared.pending.lock();
            if self.shared.is_terminated() {
                return Err(StoreError::WorkerTerminated);
            }
            pending.insert(correlation_id, tx);
        }
        let _guard = PendingCall {
            shared: &self.shared,
            correlation_id,
        };

        if self.requests.send(build(correlation_id)).await.is_err() {
            return Err(StoreError::WorkerTerminated);
        }

        rx.await.map_err(|_| StoreError::WorkerTerminated)?
    }

    pub async fn find_cookie(&self, domain: &str, path: &str, key: &str) -> Result<Option<Cookie>> {
        self.call(StoreOp::FindCookie {
            domain: domain.to_string(),
            path: path.to_string(),
            key: key.to_string(),
        })
        .await?
        .into_cookie("find_cookie")
    }

    pub async fn find_cookies(
        &self,
        domain: &str,
        path: Option<&str>,
        allow_special_use_domain: bool,
    ) -> Result<Vec<Cookie>> {
        self.call(StoreOp::FindCookies {
            domain: domain.to_string(),
            path: path.map(str::to_string),
            allow_special_use_domain,
        })
        .await?
        .into_cookies("find_cookies")
    }

    pub async fn put_cookie(&self, cookie: Cookie) -> Result<()> {
        self.call(StoreOp::PutCookie { cookie })
            .await?
            .into_done("put_cookie")
    }

    pub async fn update_cookie(&self, old: Cookie, new: Cookie) -> Result<()> {
        self.call(StoreOp::UpdateCookie { old, new })
            .await?
            .into_done("update_cookie")
    }

    pub async fn remove_cookie(&self, domain: &str, path: &str, key: &str) -> Result<()> {
        self.call(StoreOp::RemoveCookie {
            domain: domain.to_string(),
            path: path.to_string(),
            key: key.to_string(),
        })
        .await?
        .into_done("remove_cookie")
    }

    pub async fn remove_cookies(&self, domain: &str, path: Option<&str>) -> Result<()> {
        self.call(StoreOp::RemoveCookies {
            domain: domain.to_string(),
            path: path.map(str::to_string),
        })
        .await?
        .into_done("remove_cookies")
    }

    pub async fn remove_all_cookies(&self) -> Result<()> {
        self.call(StoreOp::RemoveAllCookies)
            .await?
            .into_done("remove_all_cookies")
    }

    pub async fn get_all_cookies(&self) -> Result<Vec<Cookie>> {
        self.call(StoreOp::GetAllCookies)
            .await?
            .into_cookies("get_all_cookies")
    }

    /// Asks the worker to write pending changes and returns the result of that write.
    pub async fn flush(&self) -> Result<()> {
        self.request(|correlation_id| WorkerRequest::Flush { correlation_id })
            .await?
            .into_done("flush")
    }

    /// Flushes, stops the worker and waits for its thread to exit. A failed final write is
    /// returned after the worker has stopped.
    pub async fn shutdown(&self) -> Result<()> {
        let flushed = match self.flush().await {
            Err(StoreError::WorkerTerminated) => Ok(()),
            other => other,
        };

        if self.requests.send(WorkerRequest::Shutdown).await.is_err() {
            debug!("CookieStore[{}]: worker already gone", self.shared.id);
        }

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| StoreError::Runtime(e.to_string()))?
                .map_err(|_| StoreError::Worker("worker thread panicked".into()))?;
        }

        flushed
    }
}

/// Routes worker messages to the waiting callers until the worker goes away.
async fn relay(shared: Arc<BridgeShared>, mut messages: mpsc::Receiver<WorkerMessage>) {
    while let Some(message) = messages.recv().await {
        match message {
            WorkerMessage::Response {
                correlation_id,
                outcome,
            } => {
                let Some(tx) = shared.pending.lock().remove(&correlation_id) else {
                    warn!(
                        "CookieStore[{}]: response for unknown call {}",
                        shared.id, correlation_id
                    );
                    continue;
                };

                let result = match outcome {
                    Outcome::Result(result) => Ok(result),
                    Outcome::Error(e) => Err(StoreError::Worker(e)),
                };
                let _ = tx.send(result);
            }
            WorkerMessage::Event { payload } => shared.bus.publish(payload),
        }
    }

    shared.terminate();
}

fn run_worker(
    id: StoreId,
    config: StoreConfig,
    codec: Arc<dyn CookieCodec>,
    matcher: Arc<dyn CookieMatcher>,
    requests: mpsc::Receiver<WorkerRequest>,
    messages: mpsc::Sender<WorkerMessage>,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot build worker runtime")?;

    runtime.block_on(async move {
        let engine = CookieEngine::with_parts(
            id,
            &config,
            codec,
            matcher,
            StoreRuntime::from_handle(Handle::current()),
        )
        .context("cannot create worker engine")?;

        debug!("CookieStore[{}]: worker serving {}", id, config.path.display());
        serve(engine, requests, messages).await;
        debug!("CookieStore[{}]: worker stopped", id);
        Ok(())
    })
}

/// Worker main loop. Requests are handled strictly in arrival order.
async fn serve(
    engine: CookieEngine,
    mut requests: mpsc::Receiver<WorkerRequest>,
    messages: mpsc::Sender<WorkerMessage>,
) {
    let mut events = engine.subscribe();

    loop {
        tokio::select! {
            biased;

            ev = events.recv() => match ev {
                Ok(payload) => {
                    if messages.send(WorkerMessage::Event { payload }).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("CookieStore[{}]: worker dropped {} events", engine.id(), n);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },

            request = requests.recv() => {
                let Some(request) = request else {
                    break;
                };

                match request {
                    WorkerRequest::Call { correlation_id, payload } => {
                        let outcome = run_op(&engine, payload).await;
                        let response = WorkerMessage::Response { correlation_id, outcome };
                        if messages.send(response).await.is_err() {
                            return;
                        }
                    }
                    WorkerRequest::Flush { correlation_id } => {
                        let outcome = match engine.flush().await {
                            Ok(()) => Outcome::Result(StoreOpResult::Done),
                            Err(e) => {
                                error!("CookieStore[{}]: flush failed: {}", engine.id(), e);
                                Outcome::Error(e.to_string())
                            }
                        };
                        // Events of the flush reach the bridge before its answer
                        if !forward_events(&mut events, &messages).await {
                            return;
                        }
                        let response = WorkerMessage::Response { correlation_id, outcome };
                        if messages.send(response).await.is_err() {
                            return;
                        }
                    }
                    WorkerRequest::Shutdown => break,
                }

                if !forward_events(&mut events, &messages).await {
                    return;
                }
            }
        }
    }

    if let Err(e) = engine.flush().await {
        error!("CookieStore[{}]: final flush failed: {}", engine.id(), e);
    }
    forward_events(&mut events, &messages).await;
}

/// Forwards every event already queued. Returns false once the bridge is gone.
async fn forward_events(events: &mut Subscription, messages: &mpsc::Sender<WorkerMessage>) -> bool {
    loop {
        match events.try_recv() {
            Ok(payload) => {
                if messages.send(WorkerMessage::Event { payload }).await.is_err() {
                    return false;
                }
            }
            Err(TryRecvError::Lagged(n)) => warn!("Cookie store worker dropped {} events", n),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return true,
        }
    }
}

async fn run_op(engine: &CookieEngine, op: StoreOp) -> Outcome {
    let name = op.name();

    match AssertUnwindSafe(engine.execute(op)).catch_unwind().await {
        Ok(Ok(result)) => Outcome::Result(result),
        Ok(Err(e)) => Outcome::Error(e.to_string()),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("CookieStore[{}]: '{}' panicked: {}", engine.id(), name, msg);
            Outcome::Error(format!("operation '{name}' panicked: {msg}"))
        }
    }
}
