use std::sync::Arc;

use tokio::runtime::{Handle, Runtime};

use crate::errors::{Result, StoreError};

/// Tokio runtime used by a store for its debounce timers and the worker relay.
///
/// When the store is created inside a runtime, that runtime's handle is used. Otherwise a small
/// multi-threaded runtime is built and owned by the store, so purely blocking callers still get
/// debounced write-back.
#[derive(Clone)]
pub(crate) struct StoreRuntime {
    handle: Handle,
    owned: Option<Arc<Runtime>>,
}

impl std::fmt::Debug for StoreRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRuntime")
            .field("owned", &self.owned.is_some())
            .finish()
    }
}

impl StoreRuntime {
    pub fn acquire() -> Result<Self> {
        if let Ok(handle) = Handle::try_current() {
            return Ok(Self { handle, owned: None });
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("cookie-store-rt")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Runtime(e.to_string()))?;

        Ok(Self {
            handle: runtime.handle().clone(),
            owned: Some(Arc::new(runtime)),
        })
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self { handle, owned: None }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for StoreRuntime {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics, shutdown_background does not.
        if let Some(rt) = self.owned.take() {
            if let Ok(rt) = Arc::try_unwrap(rt) {
                rt.shutdown_background();
            }
        }
    }
}
