use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::registry::BackendEndpoint;
use crate::ring::Ring;

use super::round_robin::RoundRobin;
use super::{Error, Policy, RequestContext};

const DEFAULT_CAPACITY: usize = 100_000;

/// Bounded session-key -> backend-URL cache with LRU eviction. Entries
/// reference endpoints by URL string, not by pointer, so a membership
/// change naturally invalidates an entry rather than dangling.
pub struct SessionTable {
    inner: Mutex<LruCache<String, String>>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        SessionTable {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to at least 1"),
            )),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().get(key).cloned()
    }

    pub fn insert(&self, key: String, url: String) {
        self.inner.lock().put(key, url);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Session-affinity: sticks a client to the endpoint it was last bound
/// to, as long as that endpoint is still registered. A new key is
/// bound via consistent hashing over the current sorted URL ring, so
/// membership changes remap only a small fraction of keys.
pub struct Session {
    table: SessionTable,
    fallback: RoundRobin,
}

impl Session {
    pub fn new() -> Self {
        Session {
            table: SessionTable::default(),
            fallback: RoundRobin::new(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for Session {
    fn choose<'a>(
        &self,
        candidates: &'a [BackendEndpoint],
        ctx: &RequestContext,
    ) -> Result<&'a BackendEndpoint, Error> {
        if candidates.is_empty() {
            return Err(Error::NoCandidate);
        }
        let key = match ctx.session_key {
            Some(k) if !k.is_empty() => k,
            _ => return self.fallback.choose(candidates, ctx),
        };

        if let Some(bound_url) = self.table.get(key) {
            if let Some(endpoint) = candidates.iter().find(|e| e.url == bound_url) {
                return Ok(endpoint);
            }
        }

        let mut sorted_urls: Vec<String> = candidates.iter().map(|e| e.url.clone()).collect();
        sorted_urls.sort();
        let ring = Ring::new(&sorted_urls);
        let chosen_url = ring.endpoint_for(key).ok_or(Error::NoCandidate)?;
        let endpoint = candidates
            .iter()
            .find(|e| e.url == chosen_url)
            .ok_or(Error::NoCandidate)?;
        self.table.insert(key.to_string(), endpoint.url.clone());
        Ok(endpoint)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn endpoints(urls: &[&str]) -> Vec<BackendEndpoint> {
        urls.iter().map(|u| BackendEndpoint::new(*u, "m")).collect()
    }

    #[test]
    fn same_key_sticks_to_same_endpoint_under_stable_membership() {
        let session = Session::new();
        let candidates = endpoints(&["http://a", "http://b"]);
        let ctx = RequestContext {
            session_key: Some("alice"),
            prompt_prefix: None,
        };
        let first = session.choose(&candidates, &ctx).unwrap().url.clone();
        for _ in 0..9 {
            assert_eq!(session.choose(&candidates, &ctx).unwrap().url, first);
        }
    }

    #[test]
    fn missing_session_key_falls_back_to_round_robin() {
        let session = Session::new();
        let candidates = endpoints(&["http://a", "http://b"]);
        let ctx = RequestContext::default();
        let order: Vec<String> = (0..4)
            .map(|_| session.choose(&candidates, &ctx).unwrap().url.clone())
            .collect();
        assert_eq!(order, vec!["http://a", "http://b", "http://a", "http://b"]);
    }

    #[test]
    fn distinct_keys_may_land_on_distinct_endpoints() {
        let session = Session::new();
        let candidates = endpoints(&["http://a", "http://b"]);
        let alice_ctx = RequestContext {
            session_key: Some("alice"),
            prompt_prefix: None,
        };
        let bob_ctx = RequestContext {
            session_key: Some("bob"),
            prompt_prefix: None,
        };
        let alice_url = session.choose(&candidates, &alice_ctx).unwrap().url.clone();
        let bob_url = session.choose(&candidates, &bob_ctx).unwrap().url.clone();
        assert!(alice_url == "http://a" || alice_url == "http://b");
        assert!(bob_url == "http://a" || bob_url == "http://b");
    }

    #[test]
    fn session_table_evicts_least_recently_used() {
        let table = SessionTable::new(2);
        table.insert("a".into(), "http://a".into());
        table.insert("b".into(), "http://b".into());
        table.insert("c".into(), "http://c".into());
        assert_eq!(table.len(), 2);
        assert!(table.get("a").is_none());
    }
}
