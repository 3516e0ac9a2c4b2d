//! Dynamic-configuration watcher: re-reads the dynamic-config JSON file
//! every ~10s, and on a content-hash change validates the new
//! structure, builds a new `(Provider, Policy)` pair, and publishes it
//! atomically. A validation failure logs and keeps the previous config
//! running rather than tearing anything down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::RwLock;
use stream_cancel::Tripwire;

use crate::config::{self, DiscoverySpec, DynamicConfig, PolicySpec, RouterConfig};
use crate::discovery::{ClusterProvider, Provider, StaticProvider};
use crate::policy::disaggregated::Disaggregated;
use crate::policy::least_loaded::LeastLoaded;
use crate::policy::prefix::PrefixAware;
use crate::policy::round_robin::RoundRobin;
use crate::policy::session::Session;
use crate::policy::AnyPolicy;
use crate::registry::BackendRegistry;
use crate::stats::{EngineStatsTable, RequestStatsTable, RouterMetrics};

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const REGISTRY_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Everything a single in-flight request needs to route: the active
/// discovery provider and the active policy, published together so a
/// config swap mid-request can never pair an old provider with a new
/// policy.
pub struct Handle {
    pub provider: Arc<dyn Provider>,
    pub policy: Arc<AnyPolicy>,
    /// The request header that carries the session key, when the
    /// active policy is session-affinity. `None` for every other
    /// routing logic.
    pub session_key_header: Option<String>,
    pub discovery_label: &'static str,
    pub policy_label: &'static str,
}

/// Cloneable, atomically-swappable reference to the current `Handle`.
/// Readers clone the `Arc<Handle>` once at request entry and use it
/// for the lifetime of that request; the watcher publishes a whole new
/// `Handle` under a short-lived write lock, matching the registry's
/// own publish discipline (`registry.rs`).
#[derive(Clone)]
pub struct DynamicHandle {
    inner: Arc<RwLock<Arc<Handle>>>,
}

impl DynamicHandle {
    pub fn new(handle: Handle) -> Self {
        DynamicHandle {
            inner: Arc::new(RwLock::new(Arc::new(handle))),
        }
    }

    pub fn current(&self) -> Arc<Handle> {
        self.inner.read().clone()
    }

    fn publish(&self, handle: Handle) {
        *self.inner.write() = Arc::new(handle);
    }
}

fn discovery_label(spec: &DiscoverySpec) -> &'static str {
    match spec {
        DiscoverySpec::Static { .. } => "static",
        DiscoverySpec::Cluster { .. } => "cluster",
    }
}

fn policy_label(spec: &PolicySpec) -> &'static str {
    match spec {
        PolicySpec::RoundRobin => "roundrobin",
        PolicySpec::Session { .. } => "session",
        PolicySpec::LeastLoaded => "least_loaded",
        PolicySpec::Prefix => "prefix",
        PolicySpec::DisaggregatedPrefill { .. } => "disaggregated_prefill",
    }
}

fn session_key_header(spec: &PolicySpec) -> Option<String> {
    match spec {
        PolicySpec::Session { session_key } => Some(session_key.clone()),
        _ => None,
    }
}

/// Builds the discovery provider named by `spec`. The `Cluster` branch
/// performs a blocking initial pod list before returning; its failure
/// is an unrecoverable startup discovery error, left for the caller to
/// decide how to surface.
pub async fn build_provider(spec: &DiscoverySpec) -> anyhow::Result<Arc<dyn Provider>> {
    match spec {
        DiscoverySpec::Static { backends } => Ok(Arc::new(StaticProvider::new(backends))),
        DiscoverySpec::Cluster {
            port,
            namespace,
            label_selector,
        } => {
            let provider = ClusterProvider::connect(namespace, label_selector, *port).await?;
            Ok(Arc::new(provider))
        }
    }
}

/// Builds the policy named by `spec`, wiring in the shared request/
/// engine stats tables the load-aware policies (`LeastLoaded`,
/// `PrefixAware`) read from.
pub fn build_policy(
    spec: &PolicySpec,
    request_stats: &RequestStatsTable,
    engine_stats: &EngineStatsTable,
) -> AnyPolicy {
    match spec {
        PolicySpec::RoundRobin => AnyPolicy::RoundRobin(RoundRobin::new()),
        PolicySpec::Session { .. } => AnyPolicy::Session(Session::new()),
        PolicySpec::LeastLoaded => {
            AnyPolicy::LeastLoaded(LeastLoaded::new(request_stats.clone(), engine_stats.clone()))
        }
        PolicySpec::Prefix => {
            AnyPolicy::Prefix(PrefixAware::new(request_stats.clone(), engine_stats.clone()))
        }
        PolicySpec::DisaggregatedPrefill {
            prefill_model_label,
            decode_model_label,
        } => AnyPolicy::Disaggregated(Disaggregated::new(
            prefill_model_label.clone(),
            decode_model_label.clone(),
        )),
    }
}

/// Builds the initial handle at startup from the validated CLI config.
/// Errors here are fatal: there is no "previous config" to fall back
/// to before the first handle exists.
pub async fn bootstrap(
    config: &RouterConfig,
    request_stats: &RequestStatsTable,
    engine_stats: &EngineStatsTable,
) -> anyhow::Result<DynamicHandle> {
    let provider = build_provider(&config.discovery).await?;
    let policy = build_policy(&config.policy, request_stats, engine_stats);
    Ok(DynamicHandle::new(Handle {
        provider,
        policy: Arc::new(policy),
        session_key_header: session_key_header(&config.policy),
        discovery_label: discovery_label(&config.discovery),
        policy_label: policy_label(&config.policy),
    }))
}

/// Keeps `registry` in sync with the currently active provider's
/// membership list. Runs independently of the dynamic-config poll
/// loop so a provider's own background refresh (e.g.
/// `ClusterProvider`'s pod watch, ticking every 10s on its own) is
/// reflected promptly rather than waiting on a full config-reload
/// cycle.
pub async fn run_registry_refresh(
    handle: DynamicHandle,
    registry: BackendRegistry,
    request_stats: RequestStatsTable,
    engine_stats: EngineStatsTable,
    metrics: RouterMetrics,
    mut shutdown: Tripwire,
) {
    let mut ticker = tokio::time::interval(REGISTRY_REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let previous: std::collections::HashSet<String> =
                    registry.snapshot().iter().map(|e| e.url.clone()).collect();
                let endpoints = handle.current().provider.list();
                metrics.registered_backends.set(endpoints.len() as f64);
                let current: std::collections::HashSet<String> =
                    endpoints.iter().map(|e| e.url.clone()).collect();
                registry.publish((*endpoints).clone());

                for stale_url in previous.difference(&current) {
                    request_stats.remove(stale_url);
                    engine_stats.remove(stale_url);
                }
            }
            _ = &mut shutdown => {
                info!("registry refresh loop shutting down");
                break;
            }
        }
    }
}

/// Polls `path` every 10s; on a content-hash change, validates and
/// swaps `(Provider, Policy)` atomically. An invalid file is logged
/// and the previous config stays active untouched.
pub async fn run(
    path: PathBuf,
    handle: DynamicHandle,
    request_stats: RequestStatsTable,
    engine_stats: EngineStatsTable,
    initial_hash: Option<[u8; 32]>,
    mut shutdown: Tripwire,
) {
    let mut last_hash: Option<[u8; 32]> = initial_hash;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match std::fs::read(&path) {
                    Ok(bytes) => {
                        let hash = config::content_hash(&bytes);
                        if Some(hash) == last_hash {
                            continue;
                        }
                        match reload(&bytes, &handle, &request_stats, &engine_stats).await {
                            Ok(()) => {
                                last_hash = Some(hash);
                                info!("dynamic config reloaded from {}", path.display());
                            }
                            Err(e) => {
                                warn!(
                                    "dynamic config reload failed, keeping previous config: {}",
                                    e
                                );
                            }
                        }
                    }
                    Err(e) => warn!("failed to read dynamic config file {}: {}", path.display(), e),
                }
            }
            _ = &mut shutdown => {
                info!("dynamic config watcher shutting down");
                break;
            }
        }
    }
}

async fn reload(
    bytes: &[u8],
    handle: &DynamicHandle,
    request_stats: &RequestStatsTable,
    engine_stats: &EngineStatsTable,
) -> anyhow::Result<()> {
    let parsed: DynamicConfig = serde_json::from_slice(bytes)?;
    let (discovery_spec, policy_spec) = parsed.resolve()?;
    let new_provider = build_provider(&discovery_spec).await?;
    let new_policy = build_policy(&policy_spec, request_stats, engine_stats);

    // Build succeeded; publish atomically. The previous provider (e.g.
    // a ClusterProvider's pod-watch task, see `discovery/cluster.rs`'s
    // `Drop` impl) is torn down only once this publish drops the last
    // reference to it, never before.
    handle.publish(Handle {
        provider: new_provider,
        policy: Arc::new(new_policy),
        session_key_header: session_key_header(&policy_spec),
        discovery_label: discovery_label(&discovery_spec),
        policy_label: policy_label(&policy_spec),
    });
    Ok(())
}
