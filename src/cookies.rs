//! Cookies: the [`Cookie`] record, its [`CookieCodec`] and the [`CookieMatcher`] collaborators.

mod codec;
mod cookie;
mod matching;

pub use cookie::Cookie;
pub use cookie::Creation;
pub use cookie::Expiry;

pub use codec::CookieCodec;
pub use codec::JsonCookieCodec;

pub use matching::CookieMatcher;
pub use matching::DefaultCookieMatcher;
