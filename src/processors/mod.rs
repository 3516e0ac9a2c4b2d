//! Extension seam for request pre-processors (a semantic cache, a PII
//! filter, and similar) that are out of scope for this crate: it
//! defines the hook point they plug into, not their logic. A processor
//! observes the parsed JSON body and the request's routing key before
//! the proxy consults the policy, and may rewrite either.

use serde_json::Value;

/// The mutable view of a request a processor may adjust before routing.
/// `model` and `body` start out equal to what the client sent; a
/// processor that wants to short-circuit routing (e.g. a cache hit)
/// signals that through its own return value, not through this struct.
pub struct Request<'a> {
    pub model: &'a str,
    pub body: &'a Value,
    pub session_key: Option<&'a str>,
}

/// One pre-processing stage. Implementors run in registration order
/// before the router's policy is consulted; none are provided by this
/// crate, which only defines the seam (the semantic cache and PII
/// filter are external collaborators).
pub trait Processor: Send + Sync {
    /// Inspect (and optionally veto) a request. `Ok(None)` lets the
    /// request proceed unchanged; `Ok(Some(reason))` rejects it before
    /// it reaches any backend.
    fn inspect(&self, request: &Request) -> Result<Option<String>, anyhow::Error>;
}

/// Ordered chain of processors, run in registration order; the first
/// rejection short-circuits the rest.
#[derive(Default)]
pub struct Chain {
    stages: Vec<Box<dyn Processor>>,
}

impl Chain {
    pub fn new() -> Self {
        Chain::default()
    }

    pub fn push(&mut self, processor: Box<dyn Processor>) {
        self.stages.push(processor);
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn run(&self, request: &Request) -> Result<Option<String>, anyhow::Error> {
        for stage in &self.stages {
            if let Some(reason) = stage.inspect(request)? {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct RejectAll;
    impl Processor for RejectAll {
        fn inspect(&self, _request: &Request) -> Result<Option<String>, anyhow::Error> {
            Ok(Some("rejected by policy".to_string()))
        }
    }

    struct AllowAll;
    impl Processor for AllowAll {
        fn inspect(&self, _request: &Request) -> Result<Option<String>, anyhow::Error> {
            Ok(None)
        }
    }

    #[test]
    fn empty_chain_allows_everything() {
        let chain = Chain::new();
        assert!(chain.is_empty());
        let body = serde_json::json!({"model": "m"});
        let request = Request {
            model: "m",
            body: &body,
            session_key: None,
        };
        assert!(chain.run(&request).unwrap().is_none());
    }

    #[test]
    fn a_rejection_short_circuits_later_stages() {
        let mut chain = Chain::new();
        chain.push(Box::new(AllowAll));
        chain.push(Box::new(RejectAll));
        let body = serde_json::json!({"model": "m"});
        let request = Request {
            model: "m",
            body: &body,
            session_key: None,
        };
        assert_eq!(chain.run(&request).unwrap(), Some("rejected by policy".to_string()));
    }
}
