extern crate jemallocator;

#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use env_logger::Env;
use log::{error, info, warn};
use stream_cancel::Tripwire;
use structopt::StructOpt;
use tokio::runtime;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use llm_router::config::{self, RouterConfig, RouterOptions};
use llm_router::proxy::{self, ProxyState};
use llm_router::registry::BackendRegistry;
use llm_router::stats::{Collector, EngineStatsTable, RequestStatsTable, RouterMetrics};
use llm_router::{scraper, watcher};

/// The two distinct ways `server` can fail to come up or stay up,
/// kept separate so `main` can give each its own exit code: a
/// discovery-bootstrap failure (no provider could be built at all) is
/// not the same situation as the proxy front later failing to bind or
/// serve.
enum ServerError {
    Bootstrap(anyhow::Error),
    Runtime(anyhow::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bootstrap(e) | ServerError::Runtime(e) => write!(f, "{}", e),
        }
    }
}

/// Wires every background task together and serves until a shutdown
/// signal fires: the proxy front, the engine-stats scraper, the
/// registry refresh loop and (if configured) the dynamic-config
/// watcher all race against one shared `Tripwire`.
async fn server(config: RouterConfig, collector: Collector) -> Result<(), ServerError> {
    let registry = BackendRegistry::new();
    let request_stats = RequestStatsTable::new(config.request_stats_window);
    let engine_stats = EngineStatsTable::new();
    let metrics = RouterMetrics::new(&collector)
        .context("failed to register router-internal metrics")
        .map_err(ServerError::Bootstrap)?;

    let handle = watcher::bootstrap(&config, &request_stats, &engine_stats)
        .await
        .context("failed to bring up the initial discovery provider and policy")
        .map_err(ServerError::Bootstrap)?;

    // Seed the registry synchronously so the proxy front has candidates
    // to route to the moment it starts accepting connections, rather
    // than waiting on the first registry-refresh tick.
    let initial_endpoints = (*handle.current().provider.list()).clone();
    metrics.registered_backends.set(initial_endpoints.len() as f64);
    registry.publish(initial_endpoints);

    let (sender, tripwire) = Tripwire::new();

    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| ServerError::Runtime(e.into()))?;
    let mut sigterm =
        signal(SignalKind::terminate()).map_err(|e| ServerError::Runtime(e.into()))?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("received sigint"),
            _ = sigterm.recv() => info!("received sigterm"),
        }
        sender.cancel();
    });

    tokio::spawn(watcher::run_registry_refresh(
        handle.clone(),
        registry.clone(),
        request_stats.clone(),
        engine_stats.clone(),
        metrics.clone(),
        tripwire.clone(),
    ));

    tokio::spawn(scraper::run(
        registry.clone(),
        engine_stats.clone(),
        config.engine_stats_interval,
        metrics.clone(),
        tripwire.clone(),
    ));

    if let Some(path) = config.dynamic_config_path.clone() {
        // The config this process already applied at startup (see
        // `main`) came from this same file; hash it now so the
        // watcher's first tick treats an unchanged file as unchanged
        // instead of reloading and discarding fresh routing state.
        let initial_hash = std::fs::read(&path).ok().map(|b| config::content_hash(&b));
        tokio::spawn(watcher::run(
            path,
            handle.clone(),
            request_stats.clone(),
            engine_stats.clone(),
            initial_hash,
            tripwire.clone(),
        ));
    }

    if config.log_stats {
        tokio::spawn(log_stats_loop(
            registry.clone(),
            request_stats.clone(),
            config.log_stats_interval,
            tripwire.clone(),
        ));
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))
        .map_err(ServerError::Runtime)?;
    let dynamic_config_enabled = config.dynamic_config_path.is_some();
    let state = std::sync::Arc::new(ProxyState::new(
        registry,
        handle,
        request_stats,
        collector,
        metrics,
        config.max_connections_per_backend,
        config.feature_gates.clone(),
        dynamic_config_enabled,
    ));

    proxy::run(addr, state, tripwire)
        .await
        .context("proxy front exited with an error")
        .map_err(ServerError::Runtime)
}

/// Periodic human-readable summary of per-backend in-flight/window
/// counts, gated by `--log-stats`. Purely observational: nothing here
/// feeds routing decisions.
async fn log_stats_loop(
    registry: BackendRegistry,
    request_stats: RequestStatsTable,
    interval: Duration,
    mut shutdown: Tripwire,
) {
    let mut inner = tokio::time::interval(interval);
    inner.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticker = IntervalStream::new(inner);
    loop {
        tokio::select! {
            Some(_) = ticker.next() => {
                for endpoint in registry.snapshot().iter() {
                    let stats = request_stats.get(&endpoint.url);
                    let (started, finished, _latency) = stats.window();
                    info!(
                        "backend {} model={} in_flight={} window_started={} window_finished={}",
                        endpoint.url, endpoint.model, stats.in_flight(), started, finished
                    );
                }
            }
            _ = &mut shutdown => {
                info!("stats logger shutting down");
                break;
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let opts = RouterOptions::from_args();
    let threaded = opts.threaded;

    info!(
        "llm-router starting - {} - {}",
        llm_router::built_info::PKG_VERSION,
        llm_router::built_info::GIT_COMMIT_HASH.unwrap_or("unknown")
    );

    let mut config = match opts.into_router_config() {
        Ok(c) => c,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // The dynamic-config file, when given, is also the source of truth
    // at startup: a valid file overrides whatever
    // `--service-discovery`/`--routing-logic` the CLI passed. An
    // invalid or unreadable file is not fatal here — only a failure to
    // bring up *some* provider is (exit code 2).
    if let Some(path) = config.dynamic_config_path.clone() {
        match config::load_dynamic_config(&path) {
            Ok(dynamic) => {
                let (discovery, policy) = dynamic
                    .resolve()
                    .expect("load_dynamic_config already validated this file");
                config.discovery = discovery;
                config.policy = policy;
                info!("loaded initial dynamic config from {}", path.display());
            }
            Err(e) => warn!(
                "could not read dynamic config at {}, falling back to CLI flags: {}",
                path.display(),
                e
            ),
        }
    }

    let collector = Collector::default();

    let mut builder = if threaded {
        runtime::Builder::new_multi_thread()
    } else {
        runtime::Builder::new_current_thread()
    };
    let rt = builder.enable_all().build()?;
    info!("tokio runtime built, threaded: {}", threaded);

    let result = rt.block_on(server(config, collector));
    drop(rt);

    match result {
        Ok(()) => {
            info!("runtime terminated");
            Ok(())
        }
        Err(ServerError::Bootstrap(e)) => {
            error!("unrecoverable discovery error at startup: {}", e);
            std::process::exit(2);
        }
        Err(ServerError::Runtime(e)) => {
            // Not a discovery failure, so it does not get exit code 2;
            // the documented CLI surface only reserves 0/1/2, so this
            // folds in with the invalid-CLI code rather than minting a
            // fourth one the external launcher doesn't expect.
            error!("server exited with an error: {}", e);
            std::process::exit(1);
        }
    }
}
