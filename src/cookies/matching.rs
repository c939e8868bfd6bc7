//! Domain expansion and path matching.
//!
//! The store itself does not decide which domains or paths apply to a lookup. It asks a
//! [`CookieMatcher`], so hosts can plug in a public-suffix aware implementation.
//! [`DefaultCookieMatcher`] is a small built-in one without a public suffix list.

/// Special-use top level domains (RFC 6761) that are only expanded on request.
const SPECIAL_USE_DOMAINS: [&str; 5] = ["local", "example", "invalid", "localhost", "test"];

pub trait CookieMatcher: Send + Sync {
    /// Returns the candidate domains whose cookies apply to `domain`.
    ///
    /// An empty result makes the index fall back to the literal domain.
    fn permute_domain(&self, domain: &str, allow_special_use_domain: bool) -> Vec<String>;

    /// Returns true when a cookie stored under `cookie_path` applies to `request_path`.
    fn path_match(&self, request_path: &str, cookie_path: &str) -> bool;
}

/// Suffix-based domain expansion and RFC 6265 §5.1.4 path matching.
///
/// `a.b.example.com` expands to `example.com`, `b.example.com`, `a.b.example.com`. Without a
/// public suffix list the two rightmost labels are taken as the registrable domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCookieMatcher;

impl CookieMatcher for DefaultCookieMatcher {
    fn permute_domain(&self, domain: &str, allow_special_use_domain: bool) -> Vec<String> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        if domain.is_empty() {
            return Vec::new();
        }

        let labels: Vec<&str> = domain.split('.').collect();
        let tld = labels[labels.len() - 1];
        let special = SPECIAL_USE_DOMAINS.contains(&tld);

        if special && !allow_special_use_domain {
            return Vec::new();
        }

        let min_labels = if special || labels.len() == 1 { 1 } else { 2 };

        (min_labels..=labels.len())
            .map(|n| labels[labels.len() - n..].join("."))
            .collect()
    }

    fn path_match(&self, request_path: &str, cookie_path: &str) -> bool {
        if request_path == cookie_path {
            return true;
        }

        match request_path.strip_prefix(cookie_path) {
            Some(rest) => cookie_path.ends_with('/') || rest.starts_with('/'),
            None => false,
        }
    }
}
