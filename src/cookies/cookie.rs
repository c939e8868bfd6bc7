//! Cookie record type.
//!
//! A [`Cookie`] is addressed by the triple `(domain, path, key)`. The store never interprets
//! `expires`, `secure` or the other attributes; it only keeps them and hands them back.
//!
//! ```rust
//! use gosub_cookie_store::cookies::{Cookie, Expiry};
//!
//! let c = Cookie::new("session", "abc123", "example.com", "/")
//!     .with_secure(true)
//!     .with_http_only(true);
//!
//! assert_eq!(c.expires, Expiry::Session);
//! assert_eq!(c.identity(), ("example.com", "/", "session"));
//! ```

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// When a cookie expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expiry {
    /// No expiry date: a session cookie
    Session,
    /// Absolute expiry time
    At(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
}

/// Creation time of a cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Creation {
    At(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
    /// Far-future sentinel; sorts after every real timestamp
    Infinity,
}

/// Key used to order cookies by creation time.
///
/// A missing creation time counts as the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum CreationKey {
    Finite(i128),
    Infinite,
}

/// A cookie as stored by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie name (case-sensitive), unique within domain + path
    pub key: String,
    /// Raw cookie value
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Expiry,
    /// If `true`, the cookie is hidden from client-side scripts
    pub http_only: bool,
    /// If `true`, the cookie is sent only over HTTPS
    pub secure: bool,
    pub creation: Option<Creation>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_accessed: Option<OffsetDateTime>,
    pub host_only: Option<bool>,
    /// SameSite policy (`"Strict"`, `"Lax"` or `"None"`)
    pub same_site: Option<String>,
}

impl Cookie {
    /// Creates a session cookie stamped with the current time as creation and last access.
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            key: key.into(),
            value: value.into(),
            domain: domain.into(),
            path: path.into(),
            expires: Expiry::Session,
            http_only: false,
            secure: false,
            creation: Some(Creation::At(now)),
            last_accessed: Some(now),
            host_only: None,
            same_site: None,
        }
    }

    pub fn with_expires(mut self, expires: OffsetDateTime) -> Self {
        self.expires = Expiry::At(expires);
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_creation(mut self, creation: Option<Creation>) -> Self {
        self.creation = creation;
        self
    }

    /// Returns the `(domain, path, key)` triple that identifies this cookie.
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.domain, &self.path, &self.key)
    }

    pub(crate) fn creation_key(&self) -> CreationKey {
        match self.creation {
            None => CreationKey::Finite(0),
            Some(Creation::At(t)) => CreationKey::Finite(t.unix_timestamp_nanos()),
            Some(Creation::Infinity) => CreationKey::Infinite,
        }
    }
}
