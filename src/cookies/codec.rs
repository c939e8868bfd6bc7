//! Conversion between [`Cookie`] and the plain JSON form stored on disk.
//!
//! The backing file holds one plain object per cookie:
//!
//! ```json
//! {
//!   "key": "session",
//!   "value": "abc123",
//!   "domain": "example.com",
//!   "path": "/",
//!   "expires": "2031-01-01T00:00:00Z",
//!   "httpOnly": true,
//!   "secure": true,
//!   "creation": "2024-05-01T10:00:00Z",
//!   "lastAccessed": "2024-05-01T10:00:00Z"
//! }
//! ```
//!
//! `expires` is omitted for session cookies and `creation` may be the string `"Infinity"`.
//! Timestamps outside the RFC 3339 year range are written as ISO 8601 with a six-digit signed
//! year (`"-000001-01-01T00:00:00.000000000Z"`). Numeric Unix seconds are accepted as well.
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::iso8601::{Config, EncodedConfig};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, UtcOffset};

use crate::cookies::{Cookie, Creation, Expiry};

const INFINITY: &str = "Infinity";

const EXPANDED_YEAR: EncodedConfig = Config::DEFAULT.set_year_is_six_digits(true).encode();

/// Converts cookies to and from their persisted form.
///
/// `decode` must never fail loudly: malformed input yields `None`, so a loader can skip a
/// single bad entry and keep its siblings.
pub trait CookieCodec: Send + Sync {
    fn encode(&self, cookie: &Cookie) -> Value;

    fn decode(&self, plain: &Value) -> Option<Cookie>;
}

/// Default codec producing camelCase JSON objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCookieCodec;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CookieRecord {
    #[serde(alias = "name")]
    key: String,
    value: String,
    domain: String,
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires: Option<Timestamp>,
    #[serde(default)]
    http_only: bool,
    #[serde(default)]
    secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    creation: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_accessed: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    same_site: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Timestamp {
    Text(String),
    UnixSeconds(i64),
}

impl Timestamp {
    fn is_infinity(&self) -> bool {
        matches!(self, Timestamp::Text(s) if s == INFINITY)
    }
}

/// Formats `t` so that [`parse_time`] gives it back, for every representable date.
fn format_time(t: OffsetDateTime) -> Timestamp {
    let t = t.checked_to_offset(UtcOffset::UTC).unwrap_or(t);

    if let Ok(s) = t.format(&Rfc3339) {
        return Timestamp::Text(s);
    }
    match t.format(&Iso8601::<EXPANDED_YEAR>) {
        Ok(s) => Timestamp::Text(s),
        Err(e) => {
            warn!("Cannot format cookie timestamp {}: {}, storing Unix seconds", t, e);
            Timestamp::UnixSeconds(t.unix_timestamp())
        }
    }
}

fn parse_time(stamp: &Timestamp) -> Option<OffsetDateTime> {
    match stamp {
        Timestamp::Text(s) => OffsetDateTime::parse(s, &Rfc3339)
            .or_else(|_| OffsetDateTime::parse(s, &Iso8601::PARSING))
            .ok(),
        Timestamp::UnixSeconds(secs) => OffsetDateTime::from_unix_timestamp(*secs).ok(),
    }
}

impl CookieCodec for JsonCookieCodec {
    fn encode(&self, cookie: &Cookie) -> Value {
        let record = CookieRecord {
            key: cookie.key.clone(),
            value: cookie.value.clone(),
            domain: cookie.domain.clone(),
            path: cookie.path.clone(),
            expires: match cookie.expires {
                Expiry::Session => None,
                Expiry::At(t) => Some(format_time(t)),
            },
            http_only: cookie.http_only,
            secure: cookie.secure,
            creation: match cookie.creation {
                None => None,
                Some(Creation::At(t)) => Some(format_time(t)),
                Some(Creation::Infinity) => Some(Timestamp::Text(INFINITY.to_string())),
            },
            last_accessed: cookie.last_accessed.map(format_time),
            host_only: cookie.host_only,
            same_site: cookie.same_site.clone(),
        };

        // Only fails for maps with non-string keys, which CookieRecord does not have.
        serde_json::to_value(record).unwrap_or(Value::Null)
    }

    fn decode(&self, plain: &Value) -> Option<Cookie> {
        let record = CookieRecord::deserialize(plain).ok()?;

        let expires = match &record.expires {
            None => Expiry::Session,
            Some(stamp) if stamp.is_infinity() => Expiry::Session,
            Some(stamp) => Expiry::At(parse_time(stamp)?),
        };

        let creation = match &record.creation {
            None => None,
            Some(stamp) if stamp.is_infinity() => Some(Creation::Infinity),
            Some(stamp) => Some(Creation::At(parse_time(stamp)?)),
        };

        let last_accessed = match &record.last_accessed {
            None => None,
            Some(stamp) => Some(parse_time(stamp)?),
        };

        Some(Cookie {
            key: record.key,
            value: record.value,
            domain: record.domain,
            path: record.path,
            expires,
            http_only: record.http_only,
            secure: record.secure,
            creation,
            last_accessed,
            host_only: record.host_only,
            same_site: record.same_site,
        })
    }
}
