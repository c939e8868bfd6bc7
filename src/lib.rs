//! File-backed cookie store with debounced write-back and an optional worker thread.
//!
//! ```no_run
//! use gosub_cookie_store::{Cookie, FileCookieStore};
//!
//! # async fn run() -> gosub_cookie_store::errors::Result<()> {
//! let store = FileCookieStore::builder("cookies.json").build()?;
//! store.put_cookie(Cookie::new("sid", "abc", "example.com", "/")).await?;
//! let found = store.find_cookies("www.example.com", Some("/"), false).await?;
//! assert_eq!(found.len(), 1);
//! store.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod cookies;
pub mod errors;
pub mod events;
pub mod store;

mod runtime;

pub use config::StoreConfig;
pub use cookies::{Cookie, CookieCodec, CookieMatcher, Creation, Expiry};
pub use errors::StoreError;
pub use events::{StoreEvent, StoreId};
pub use store::FileCookieStore;
