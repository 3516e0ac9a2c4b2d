//! Router policies: one `Policy` per routing-logic variant, selected
//! dynamically by the `RoutingLogic` chosen at
//! startup or by a dynamic-config reload. `AnyPolicy` is the enum the
//! proxy front actually holds, dispatching to whichever policy is
//! currently active without the proxy needing to know which one.

pub mod disaggregated;
pub mod least_loaded;
pub mod prefix;
pub mod round_robin;
pub mod session;

use thiserror::Error;

use crate::registry::BackendEndpoint;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("no candidate backend available")]
    NoCandidate,
}

/// Per-request context a policy may consult beyond the candidate list.
/// The caller has already filtered candidates down to the request's
/// target model.
#[derive(Debug, Default)]
pub struct RequestContext<'a> {
    pub session_key: Option<&'a str>,
    pub prompt_prefix: Option<&'a str>,
}

/// A single-endpoint selector. Implementors are stateless except for
/// bounded or atomic state (`RoundRobinCursor`, `SessionTable`, the
/// prefix map); all policies are `Send + Sync` and shared across every
/// request via the handle the config watcher publishes.
pub trait Policy: Send + Sync {
    fn choose<'a>(
        &self,
        candidates: &'a [BackendEndpoint],
        ctx: &RequestContext,
    ) -> Result<&'a BackendEndpoint, Error>;
}

/// The outcome of consulting the active policy: either one endpoint,
/// or a prefill/decode pair for the disaggregated policy, which is not
/// expressible through the single-endpoint `Policy` trait.
pub enum RoutingDecision<'a> {
    Single(&'a BackendEndpoint),
    Pair {
        prefill: BackendEndpoint,
        decode: BackendEndpoint,
    },
}

/// Tagged union over the five policy implementations, built once by
/// the config watcher from a `PolicySpec` and held behind the same
/// atomically-published handle as the active `Provider`.
pub enum AnyPolicy {
    RoundRobin(round_robin::RoundRobin),
    Session(session::Session),
    LeastLoaded(least_loaded::LeastLoaded),
    Prefix(prefix::PrefixAware),
    Disaggregated(disaggregated::Disaggregated),
}

impl AnyPolicy {
    pub fn route<'a>(
        &self,
        candidates: &'a [BackendEndpoint],
        ctx: &RequestContext,
    ) -> Result<RoutingDecision<'a>, Error> {
        match self {
            AnyPolicy::RoundRobin(p) => Ok(RoutingDecision::Single(p.choose(candidates, ctx)?)),
            AnyPolicy::Session(p) => Ok(RoutingDecision::Single(p.choose(candidates, ctx)?)),
            AnyPolicy::LeastLoaded(p) => Ok(RoutingDecision::Single(p.choose(candidates, ctx)?)),
            AnyPolicy::Prefix(p) => Ok(RoutingDecision::Single(p.choose(candidates, ctx)?)),
            AnyPolicy::Disaggregated(p) => {
                let choice = p.choose_pair(candidates, ctx)?;
                Ok(RoutingDecision::Pair {
                    prefill: choice.prefill,
                    decode: choice.decode,
                })
            }
        }
    }
}
