use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::registry::BackendEndpoint;
use crate::stats::{EngineStatsTable, RequestStatsTable};

use super::least_loaded::LeastLoaded;
use super::{Error, Policy, RequestContext};

const DEFAULT_CAPACITY: usize = 100_000;
const DEFAULT_IN_FLIGHT_CAP: i64 = 64;

/// Work-in-progress prefix-affinity policy: remembers which endpoint
/// last served a given prompt-prefix fingerprint and prefers it again,
/// on the theory that the backend still holds the matching KV-cache
/// pages. Falls back to least-loaded whenever the remembered endpoint
/// is gone, stale, or already near its in-flight cap.
pub struct PrefixAware {
    table: Mutex<LruCache<String, String>>,
    in_flight_cap: i64,
    request_stats: RequestStatsTable,
    engine_stats: EngineStatsTable,
    fallback: LeastLoaded,
}

impl PrefixAware {
    pub fn new(request_stats: RequestStatsTable, engine_stats: EngineStatsTable) -> Self {
        PrefixAware {
            table: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEFAULT_CAPACITY).expect("nonzero capacity"),
            )),
            in_flight_cap: DEFAULT_IN_FLIGHT_CAP,
            fallback: LeastLoaded::new(request_stats.clone(), engine_stats.clone()),
            request_stats,
            engine_stats,
        }
    }

    /// A remembered endpoint is only reused while its most recent
    /// scrape is fresh and it has headroom under the in-flight cap; a
    /// stale snapshot means the overload check can't be trusted, so
    /// staleness alone disqualifies reuse.
    fn is_eligible(&self, url: &str) -> bool {
        let stale = self
            .engine_stats
            .get(url)
            .map(|s| s.stale)
            .unwrap_or(true);
        if stale {
            return false;
        }
        self.request_stats.get(url).in_flight() < self.in_flight_cap
    }
}

impl Policy for PrefixAware {
    fn choose<'a>(
        &self,
        candidates: &'a [BackendEndpoint],
        ctx: &RequestContext,
    ) -> Result<&'a BackendEndpoint, Error> {
        if candidates.is_empty() {
            return Err(Error::NoCandidate);
        }
        if let Some(fingerprint) = ctx.prompt_prefix {
            let cached_url = self.table.lock().get(fingerprint).cloned();
            if let Some(url) = cached_url {
                if let Some(endpoint) = candidates.iter().find(|e| e.url == url) {
                    if self.is_eligible(&endpoint.url) {
                        return Ok(endpoint);
                    }
                }
            }
        }

        let chosen = self.fallback.choose(candidates, ctx)?;
        if let Some(fingerprint) = ctx.prompt_prefix {
            self.table.lock().put(fingerprint.to_string(), chosen.url.clone());
        }
        Ok(chosen)
    }
}
