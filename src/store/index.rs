//! In-memory cookie index.
//!
//! Cookies are kept in three nested maps: domain -> path -> key. Each level iterates in insertion
//! order. A path map never stays empty after a removal and neither does a domain map, so
//! enumeration and serialization never see vacuous branches.
use std::collections::HashSet;

use indexmap::IndexMap;

use crate::cookies::Cookie;

type KeyMap = IndexMap<String, Cookie>;
type PathMap = IndexMap<String, KeyMap>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CookieIndex {
    domains: IndexMap<String, PathMap>,
    /// Number of cookies over all levels
    count: usize,
}

impl CookieIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain: &str, path: &str, key: &str) -> Option<&Cookie> {
        self.domains.get(domain)?.get(path)?.get(key)
    }

    /// Inserts `cookie`, replacing any cookie with the same `(domain, path, key)` in place.
    pub fn put(&mut self, cookie: Cookie) {
        let replaced = self
            .domains
            .entry(cookie.domain.clone())
            .or_default()
            .entry(cookie.path.clone())
            .or_default()
            .insert(cookie.key.clone(), cookie);

        if replaced.is_none() {
            self.count += 1;
        }
    }

    /// Removes a single cookie, pruning path and domain levels left empty.
    pub fn remove(&mut self, domain: &str, path: &str, key: &str) -> Option<Cookie> {
        let paths = self.domains.get_mut(domain)?;
        let keys = paths.get_mut(path)?;
        let removed = keys.shift_remove(key);

        if keys.is_empty() {
            paths.shift_remove(path);
        }
        if paths.is_empty() {
            self.domains.shift_remove(domain);
        }

        if removed.is_some() {
            self.count -= 1;
        }
        removed
    }

    /// Removes one path level of `domain`, or the whole domain when `path` is `None`.
    pub fn remove_all(&mut self, domain: &str, path: Option<&str>) {
        match path {
            None => {
                if let Some(paths) = self.domains.shift_remove(domain) {
                    self.count -= paths.values().map(KeyMap::len).sum::<usize>();
                }
            }
            Some(path) => {
                if let Some(paths) = self.domains.get_mut(domain) {
                    if let Some(keys) = paths.shift_remove(path) {
                        self.count -= keys.len();
                    }
                    if paths.is_empty() {
                        self.domains.shift_remove(domain);
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.domains.clear();
        self.count = 0;
    }

    /// Finds the cookies that apply to `domain` and, optionally, `path`.
    ///
    /// `expand` produces the candidate domains (the literal domain is used when it yields
    /// nothing). `path_match(requested, stored)` decides whether a stored path applies.
    pub fn find_by_domain<E, M>(
        &self,
        domain: &str,
        path: Option<&str>,
        expand: E,
        path_match: M,
    ) -> Vec<Cookie>
    where
        E: FnOnce(&str) -> Vec<String>,
        M: Fn(&str, &str) -> bool,
    {
        let mut candidates = expand(domain);
        if candidates.is_empty() {
            candidates.push(domain.to_string());
        }

        let mut seen = HashSet::new();
        let mut results = Vec::new();

        for candidate in candidates {
            if !seen.insert(candidate.clone()) {
                continue;
            }
            let Some(paths) = self.domains.get(&candidate) else {
                continue;
            };

            for (stored_path, keys) in paths {
                let applies = match path {
                    None => true,
                    Some(requested) => path_match(requested, stored_path),
                };
                if applies {
                    results.extend(keys.values().cloned());
                }
            }
        }

        results
    }

    /// Returns every cookie sorted by creation time, oldest first.
    pub fn list_all(&self) -> Vec<Cookie> {
        let mut all: Vec<Cookie> = self.iter().cloned().collect();
        // sort_by_key is stable, ties keep index order
        all.sort_by_key(|c| c.creation_key());
        all
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.domains
            .values()
            .flat_map(|paths| paths.values())
            .flat_map(|keys| keys.values())
    }

    /// Iterates the domain -> path -> key tree, as used for serialization.
    pub(crate) fn domains(&self) -> &IndexMap<String, PathMap> {
        &self.domains
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    /// Returns the stored paths of `domain`.
    pub fn paths(&self, domain: &str) -> Vec<&str> {
        self.domains
            .get(domain)
            .map(|paths| paths.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

impl FromIterator<Cookie> for CookieIndex {
    fn from_iter<I: IntoIterator<Item = Cookie>>(iter: I) -> Self {
        let mut index = CookieIndex::new();
        for cookie in iter {
            index.put(cookie);
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::{CookieMatcher, Creation, DefaultCookieMatcher};
    use time::macros::datetime;

    fn c(domain: &str, path: &str, key: &str) -> Cookie {
        Cookie::new(key, format!("{key}-value"), domain, path)
    }

    fn find(index: &CookieIndex, domain: &str, path: Option<&str>) -> Vec<String> {
        let m = DefaultCookieMatcher;
        let mut keys: Vec<String> = index
            .find_by_domain(domain, path, |d| m.permute_domain(d, false), |r, s| m.path_match(r, s))
            .into_iter()
            .map(|c| format!("{}{}:{}", c.domain, c.path, c.key))
            .collect();
        keys.sort();
        keys
    }

    #[test]
    fn put_then_get_returns_equal_cookie() {
        let mut index = CookieIndex::new();
        let cookie = c("example.com", "/", "a");
        index.put(cookie.clone());
        assert_eq!(index.get("example.com", "/", "a"), Some(&cookie));
        assert!(index.get("example.com", "/", "b").is_none());
        assert!(index.get("example.org", "/", "a").is_none());
    }

    #[test]
    fn put_overwrites_same_identity() {
        let mut index = CookieIndex::new();
        index.put(c("example.com", "/", "a"));

        let mut replacement = c("example.com", "/", "a");
        replacement.value = "new".into();
        index.put(replacement);

        assert_eq!(index.len(), 1);
        assert_eq!(index.get("example.com", "/", "a").unwrap().value, "new");
    }

    #[test]
    fn remove_prunes_empty_levels() {
        let mut index = CookieIndex::new();
        index.put(c("example.com", "/", "a"));
        index.put(c("example.com", "/docs", "b"));

        assert!(index.remove("example.com", "/docs", "b").is_some());
        assert!(index.get("example.com", "/docs", "b").is_none());
        assert_eq!(index.paths("example.com"), vec!["/"]);

        index.remove("example.com", "/", "a");
        assert!(index.is_empty());
        assert_eq!(index.domain_count(), 0);
    }

    #[test]
    fn remove_missing_is_noop() {
        let mut index = CookieIndex::new();
        index.put(c("example.com", "/", "a"));

        assert!(index.remove("example.com", "/", "zzz").is_none());
        assert!(index.remove("example.com", "/nope", "a").is_none());
        assert!(index.remove("nope.com", "/", "a").is_none());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn remove_all_for_path_and_domain() {
        let mut index = CookieIndex::new();
        index.put(c("example.com", "/", "a"));
        index.put(c("example.com", "/docs", "b"));
        index.put(c("example.org", "/", "c"));

        index.remove_all("example.com", Some("/docs"));
        assert_eq!(index.paths("example.com"), vec!["/"]);

        index.remove_all("example.com", Some("/"));
        assert!(index.paths("example.com").is_empty());
        assert_eq!(index.domain_count(), 1);

        index.remove_all("example.org", None);
        assert!(index.is_empty());

        index.remove_all("missing.com", Some("/"));
        index.remove_all("missing.com", None);
    }

    #[test]
    fn clear_empties_everything() {
        let mut index: CookieIndex = vec![c("a.com", "/", "x"), c("b.com", "/", "y")]
            .into_iter()
            .collect();
        index.clear();
        assert!(index.is_empty());
        assert!(index.list_all().is_empty());
    }

    #[test]
    fn find_without_path_returns_all_domain_variants() {
        let mut index = CookieIndex::new();
        index.put(c("example.com", "/", "root"));
        index.put(c("example.com", "/docs", "docs"));
        index.put(c("www.example.com", "/", "www"));
        index.put(c("other.com", "/", "other"));

        assert_eq!(
            find(&index, "www.example.com", None),
            vec!["example.com/:root", "example.com/docs:docs", "www.example.com/:www"]
        );
    }

    #[test]
    fn find_with_path_uses_path_match() {
        let mut index = CookieIndex::new();
        index.put(c("example.com", "/", "root"));
        index.put(c("example.com", "/x", "x"));
        index.put(c("example.com", "/xy", "xy"));
        index.put(c("example.com", "/x/deep", "deep"));

        assert_eq!(
            find(&index, "example.com", Some("/x")),
            vec!["example.com/:root", "example.com/x:x"]
        );
    }

    #[test]
    fn find_falls_back_to_literal_domain() {
        let mut index = CookieIndex::new();
        index.put(c("app.localhost", "/", "dev"));

        let found = index.find_by_domain("app.localhost", None, |_| Vec::new(), |_, _| true);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "dev");
    }

    #[test]
    fn find_visits_duplicate_candidates_once() {
        let mut index = CookieIndex::new();
        index.put(c("example.com", "/", "a"));

        let found = index.find_by_domain(
            "example.com",
            None,
            |d| vec![d.to_string(), d.to_string()],
            |_, _| true,
        );
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn list_all_sorts_by_creation() {
        let at = |t| Some(Creation::At(t));
        let mut index = CookieIndex::new();
        index.put(c("a.com", "/", "never").with_creation(Some(Creation::Infinity)));
        index.put(c("b.com", "/", "late").with_creation(at(datetime!(2024-06-01 0:00 UTC))));
        index.put(c("c.com", "/", "none").with_creation(None));
        index.put(c("d.com", "/", "early").with_creation(at(datetime!(2020-01-01 0:00 UTC))));

        let keys: Vec<String> = index.list_all().into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["none", "early", "late", "never"]);
    }

    #[test]
    fn list_all_keeps_insertion_order_for_equal_creation() {
        let same = Some(Creation::At(datetime!(2023-03-03 3:03 UTC)));
        let mut index = CookieIndex::new();
        for key in ["k3", "k1", "k2"] {
            index.put(c("example.com", "/", key).with_creation(same));
        }

        let keys: Vec<String> = index.list_all().into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["k3", "k1", "k2"]);

        // Removal keeps the order of the survivors, overwrite keeps the slot
        index.remove("example.com", "/", "k1");
        index.put(c("example.com", "/", "k0").with_creation(same));
        index.put(c("example.com", "/", "k3").with_creation(same));

        let keys: Vec<String> = index.list_all().into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["k3", "k2", "k0"]);
    }

    #[test]
    fn levels_iterate_in_insertion_order() {
        let mut index = CookieIndex::new();
        index.put(c("zeta.com", "/z", "b"));
        index.put(c("alpha.com", "/", "a"));
        index.put(c("zeta.com", "/a", "c"));

        let domains: Vec<&str> = index.domains().keys().map(String::as_str).collect();
        assert_eq!(domains, vec!["zeta.com", "alpha.com"]);
        assert_eq!(index.paths("zeta.com"), vec!["/z", "/a"]);
    }

    #[test]
    fn len_tracks_every_mutation() {
        let mut index = CookieIndex::new();
        index.put(c("example.com", "/", "a"));
        index.put(c("example.com", "/", "a"));
        index.put(c("example.com", "/x", "b"));
        index.put(c("example.com", "/x", "c"));
        index.put(c("example.org", "/", "d"));
        assert_eq!(index.len(), 4);

        index.remove("example.com", "/", "missing");
        assert_eq!(index.len(), 4);
        index.remove("example.com", "/", "a");
        assert_eq!(index.len(), 3);
        index.remove_all("example.com", Some("/x"));
        assert_eq!(index.len(), 1);
        index.remove_all("example.org", None);
        assert_eq!(index.len(), 0);

        index.put(c("example.net", "/", "e"));
        index.clear();
        assert_eq!(index.len(), 0);
        assert_eq!(index.len(), index.iter().count());
    }
}
