use crate::registry::BackendEndpoint;

use super::round_robin::RoundRobin;
use super::{Error, Policy, RequestContext};

/// Two backend endpoints chosen for one request: a prefill engine and
/// a decode engine. The router hands the prefill response off to the
/// decode backend per that backend's own disaggregation protocol; this
/// policy only decides *which* two endpoints participate.
pub struct DisaggregatedChoice {
    pub prefill: BackendEndpoint,
    pub decode: BackendEndpoint,
}

/// Partitions the candidate set by a configured label into a prefill
/// subset and a decode subset, then runs a nested policy (round-robin)
/// independently within each subset. If either subset is empty the
/// request fails with `NoCandidate`.
pub struct Disaggregated {
    prefill_label: String,
    decode_label: String,
    prefill_policy: RoundRobin,
    decode_policy: RoundRobin,
}

impl Disaggregated {
    pub fn new(prefill_label: String, decode_label: String) -> Self {
        Disaggregated {
            prefill_label,
            decode_label,
            prefill_policy: RoundRobin::new(),
            decode_policy: RoundRobin::new(),
        }
    }

    pub fn choose_pair(
        &self,
        candidates: &[BackendEndpoint],
        ctx: &RequestContext,
    ) -> Result<DisaggregatedChoice, Error> {
        let prefill_set: Vec<BackendEndpoint> = candidates
            .iter()
            .filter(|e| e.label(&self.prefill_label).is_some())
            .cloned()
            .collect();
        let decode_set: Vec<BackendEndpoint> = candidates
            .iter()
            .filter(|e| e.label(&self.decode_label).is_some())
            .cloned()
            .collect();
        if prefill_set.is_empty() || decode_set.is_empty() {
            return Err(Error::NoCandidate);
        }
        let prefill = self.prefill_policy.choose(&prefill_set, ctx)?.clone();
        let decode = self.decode_policy.choose(&decode_set, ctx)?.clone();
        Ok(DisaggregatedChoice { prefill, decode })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn labeled(url: &str, label: &str) -> BackendEndpoint {
        let mut labels = HashMap::new();
        labels.insert(label.to_string(), "true".to_string());
        BackendEndpoint::new(url, "m").with_labels(labels)
    }

    #[test]
    fn splits_into_prefill_and_decode_subsets() {
        let policy = Disaggregated::new("role-prefill".into(), "role-decode".into());
        let candidates = vec![
            labeled("http://p1", "role-prefill"),
            labeled("http://p2", "role-prefill"),
            labeled("http://d1", "role-decode"),
        ];
        let ctx = RequestContext::default();
        let choice = policy.choose_pair(&candidates, &ctx).unwrap();
        assert!(choice.prefill.url == "http://p1" || choice.prefill.url == "http://p2");
        assert_eq!(choice.decode.url, "http://d1");
    }

    #[test]
    fn empty_decode_subset_is_no_candidate() {
        let policy = Disaggregated::new("role-prefill".into(), "role-decode".into());
        let candidates = vec![labeled("http://p1", "role-prefill")];
        let ctx = RequestContext::default();
        assert_eq!(
            policy.choose_pair(&candidates, &ctx).unwrap_err(),
            Error::NoCandidate
        );
    }
}
