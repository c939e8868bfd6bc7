//! Store identity and change notifications.
//!
//! Every store owns an [`EventBus`]. Hosts call `subscribe()` on the store to learn when the
//! index was loaded, when the file was rewritten, and when a forced flush completed. In worker
//! mode the remote engine's events are relayed to the bridge and republished on its bus.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the broadcast and worker channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

/// A handle for receiving store notifications.
pub type Subscription = broadcast::Receiver<StoreEvent>;

/// Unique identifier of a store instance, used to tell stores apart in logs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId(Uuid);

impl StoreId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreEvent {
    /// The index was initialized from the backing file
    Loaded { records: usize },
    /// The full index was written to the backing file
    Persisted { records: usize },
    /// Writing the backing file failed; the scheduler does not retry
    PersistFailed { error: String },
    /// A forced flush has completed
    Flushed,
}

#[derive(Debug)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn subscribe(&self) -> Subscription {
        self.tx.subscribe()
    }

    pub fn publish(&self, ev: StoreEvent) {
        // send() only fails without receivers, which is fine
        let _ = self.tx.send(ev);
    }
}
