use std::sync::atomic::{AtomicU64, Ordering};

use crate::registry::BackendEndpoint;

use super::{Error, Policy, RequestContext};

/// Endpoints are sorted by URL before indexing: a stable total order
/// that makes selection deterministic across discovery-order churn and
/// prevents any one endpoint from starving.
#[derive(Default)]
pub struct RoundRobin {
    cursor: AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Policy for RoundRobin {
    fn choose<'a>(
        &self,
        candidates: &'a [BackendEndpoint],
        _ctx: &RequestContext,
    ) -> Result<&'a BackendEndpoint, Error> {
        if candidates.is_empty() {
            return Err(Error::NoCandidate);
        }
        let mut sorted: Vec<&'a BackendEndpoint> = candidates.iter().collect();
        sorted.sort_by(|a, b| a.url.cmp(&b.url));
        let idx = (self.cursor.fetch_add(1, Ordering::Relaxed) as usize) % sorted.len();
        Ok(sorted[idx])
    }
}
