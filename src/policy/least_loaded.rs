use crate::registry::BackendEndpoint;
use crate::stats::{EngineStatsTable, RequestStatsTable};

use super::{Error, Policy, RequestContext};

/// Ranks ascending by current in-flight count, then pending requests
/// from the engine's own scrape, then URL (so the ordering is total
/// and the choice is deterministic on exact ties). An endpoint whose
/// last scrape failed is ranked after every healthy endpoint,
/// regardless of its in-flight count.
pub struct LeastLoaded {
    request_stats: RequestStatsTable,
    engine_stats: EngineStatsTable,
}

impl LeastLoaded {
    pub fn new(request_stats: RequestStatsTable, engine_stats: EngineStatsTable) -> Self {
        LeastLoaded {
            request_stats,
            engine_stats,
        }
    }

    fn rank(&self, endpoint: &BackendEndpoint) -> (bool, i64, i64, String) {
        let in_flight = self.request_stats.get(&endpoint.url).in_flight();
        let (pending, stale) = self
            .engine_stats
            .get(&endpoint.url)
            .map(|s| (s.pending, s.stale))
            .unwrap_or((0, true));
        (stale, in_flight, pending, endpoint.url.clone())
    }
}

impl Policy for LeastLoaded {
    fn choose<'a>(
        &self,
        candidates: &'a [BackendEndpoint],
        _ctx: &RequestContext,
    ) -> Result<&'a BackendEndpoint, Error> {
        candidates
            .iter()
            .min_by(|a, b| self.rank(a).cmp(&self.rank(b)))
            .ok_or(Error::NoCandidate)
    }
}
