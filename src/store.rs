//! The persistent cookie store.
//!
//! A [`FileCookieStore`] keeps every cookie in a [`CookieIndex`] and mirrors it to a single
//! JSON file. Mutations are applied in memory right away; the [`PersistenceScheduler`] rewrites
//! the whole file once the store has been quiet for the configured debounce delay, or
//! immediately on `flush`. With worker mode enabled the engine lives on its own thread and the
//! store talks to it through a [`WorkerBridge`].

mod engine;
mod file_store;
mod index;
mod scheduler;
mod worker;

pub use engine::{CookieEngine, InitState};
pub use file_store::{FileCookieStore, FileCookieStoreBuilder};
pub use index::CookieIndex;
pub use scheduler::{PersistenceScheduler, SchedulerState};
pub use worker::{Outcome, StoreOp, StoreOpResult, WorkerBridge, WorkerMessage, WorkerRequest};
