//! HTTP proxy front: the only component a client talks to directly.
//! Parses just enough of the request to pick a backend (the `model`
//! field, an optional session header, an optional prompt prefix),
//! consults the currently active policy through a single
//! atomically-published handle, and streams the backend's response
//! back verbatim.
//!
//! Built on hyper 0.14 (`server`, `client`, `http1`, `http2`, `stream`
//! features) with an accept-loop-plus-`Tripwire` shutdown shape.

use std::convert::Infallible;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use hyper::client::HttpConnector;
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, HeaderMap, Method, Request, Response, Server, StatusCode};
use log::{info, warn};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::policy::{RequestContext, RoutingDecision};
use crate::registry::{BackendEndpoint, BackendRegistry};
use crate::stats::{BackendRequestStats, Collector, RequestStatsTable, RouterMetrics};
use crate::watcher::DynamicHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PREFIX_FINGERPRINT_CHARS: usize = 256;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("request body is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("request json is missing a \"model\" field")]
    MissingModel,
    #[error("model {0} is not served by any registered backend")]
    ModelNotServed(String),
    #[error("no candidate backend available")]
    NoCandidate,
    #[error("failed to connect to upstream backend {0}: {1}")]
    UpstreamConnect(String, hyper::Error),
    #[error("connection to upstream backend {0} timed out")]
    UpstreamTimeout(String),
    #[error("failed to read request body: {0}")]
    BodyRead(hyper::Error),
    #[error("backend {0} plus inbound path is not a valid uri")]
    InvalidUpstreamUri(String),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::InvalidJson(_) | Error::MissingModel | Error::BodyRead(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::ModelNotServed(_) => StatusCode::NOT_FOUND,
            Error::NoCandidate => StatusCode::SERVICE_UNAVAILABLE,
            Error::UpstreamConnect(_, _) | Error::UpstreamTimeout(_) => StatusCode::BAD_GATEWAY,
            Error::InvalidUpstreamUri(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Error::InvalidJson(_) | Error::MissingModel | Error::BodyRead(_) => {
                "invalid_request_error"
            }
            Error::ModelNotServed(_) => "not_found_error",
            Error::NoCandidate => "no_candidate_error",
            Error::UpstreamConnect(_, _) | Error::UpstreamTimeout(_) => "upstream_error",
            Error::InvalidUpstreamUri(_) => "upstream_error",
        }
    }
}

impl From<crate::policy::Error> for Error {
    fn from(_: crate::policy::Error) -> Self {
        Error::NoCandidate
    }
}

/// Everything a request handler needs: the backend registry (for model
/// filtering), the dynamic provider+policy handle, the per-backend
/// request-stats table, the metrics collector, the router-internal
/// Prometheus counters, and a shared hyper client with a bounded
/// connection pool.
pub struct ProxyState {
    pub registry: BackendRegistry,
    pub handle: DynamicHandle,
    pub request_stats: RequestStatsTable,
    pub stats: Collector,
    pub metrics: RouterMetrics,
    /// Feature-gate names forwarded verbatim from the CLI/dynamic
    /// config for the pre-processor chain (`crate::processors`) to
    /// consult once a processor is registered; this crate ships none.
    pub feature_gates: Vec<String>,
    /// Whether `--dynamic-config-json` is configured. `/health` only
    /// reports the active discovery/policy labels when this is set.
    dynamic_config_enabled: bool,
    client: Client<HttpConnector>,
    max_connections_per_backend: usize,
    connect_limits: DashMap<String, Arc<Semaphore>>,
}

impl ProxyState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: BackendRegistry,
        handle: DynamicHandle,
        request_stats: RequestStatsTable,
        stats: Collector,
        metrics: RouterMetrics,
        max_connections_per_backend: usize,
        feature_gates: Vec<String>,
        dynamic_config_enabled: bool,
    ) -> Self {
        ProxyState {
            registry,
            handle,
            request_stats,
            stats,
            metrics,
            feature_gates,
            dynamic_config_enabled,
            client: Client::builder()
                .pool_max_idle_per_host(max_connections_per_backend)
                .build_http(),
            max_connections_per_backend,
            connect_limits: DashMap::new(),
        }
    }

    /// The semaphore gating concurrent in-flight connects to `url`,
    /// created with `max_connections_per_backend` permits on first use.
    fn connect_limit(&self, url: &str) -> Arc<Semaphore> {
        self.connect_limits
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_connections_per_backend)))
            .clone()
    }
}

/// Binds and serves until `shutdown` fires, then waits out hyper's own
/// graceful-shutdown drain of in-flight connections.
pub async fn run(
    addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown: stream_cancel::Tripwire,
) -> Result<(), hyper::Error> {
    let make_service = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(state, req).await) }
            }))
        }
    });

    info!("proxy listening on {}", addr);
    Server::bind(&addr)
        .serve(make_service)
        .with_graceful_shutdown(async {
            shutdown.await;
            info!("proxy front shutting down, draining in-flight connections");
        })
        .await
}

async fn handle(state: Arc<ProxyState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result = match (&method, path.as_str()) {
        (&Method::POST, "/v1/chat/completions") | (&Method::POST, "/v1/completions") => {
            proxy_inference(&state, req).await
        }
        (&Method::GET, "/v1/models") | (&Method::GET, "/models") => Ok(models_response(&state)),
        (&Method::GET, "/health") => Ok(health_response(&state)),
        (&Method::GET, "/metrics") => Ok(metrics_response(&state)),
        _ => Ok(not_found()),
    };

    result.unwrap_or_else(error_response)
}

async fn proxy_inference(
    state: &Arc<ProxyState>,
    req: Request<Body>,
) -> Result<Response<Body>, Error> {
    let (parts, body) = req.into_parts();
    let body_bytes = hyper::body::to_bytes(body).await.map_err(Error::BodyRead)?;
    let parsed: Value = serde_json::from_slice(&body_bytes)?;
    let model = parsed
        .get("model")
        .and_then(Value::as_str)
        .ok_or(Error::MissingModel)?
        .to_string();

    let candidates = state.registry.endpoints_for_model(&model);
    if candidates.is_empty() {
        return Err(Error::ModelNotServed(model));
    }

    let handle = state.handle.current();
    let session_key = handle
        .session_key_header
        .as_deref()
        .and_then(|header_name| parts.headers.get(header_name))
        .and_then(|v| v.to_str().ok());
    let prompt_prefix = prefix_fingerprint(&parsed);
    let ctx = RequestContext {
        session_key,
        prompt_prefix: prompt_prefix.as_deref(),
    };

    let decision = handle.policy.route(&candidates, &ctx)?;
    let inbound = InboundRequest {
        method: parts.method,
        path_and_query: parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/")
            .to_string(),
        headers: parts.headers,
    };

    match decision {
        RoutingDecision::Single(endpoint) => {
            forward(state, &inbound, body_bytes, endpoint.clone()).await
        }
        RoutingDecision::Pair { prefill, decode } => {
            // Fire the prefill request to warm the KV cache and let it
            // run its course on its own task; the decode backend is
            // what actually streams a response back to the client.
            let prefill_state = Arc::clone(state);
            let prefill_inbound = inbound.clone();
            let prefill_body = body_bytes.clone();
            let prefill_url = prefill.url.clone();
            tokio::spawn(async move {
                match forward(&prefill_state, &prefill_inbound, prefill_body, prefill).await {
                    Ok(resp) => {
                        // Drive the body to completion so the
                        // `track_stats` generator it wraps actually
                        // runs and balances the `start()` this
                        // `forward()` call already recorded; nothing
                        // else reads the prefill response.
                        let _ = hyper::body::to_bytes(resp.into_body()).await;
                    }
                    Err(e) => {
                        warn!("prefill hand-off to {} failed: {}", prefill_url, e);
                    }
                }
            });
            forward(state, &inbound, body_bytes, decode).await
        }
    }
}

/// Owned copy of just the parts of the inbound request `forward` needs,
/// so a disaggregated-prefill hand-off can run on its own spawned task
/// without borrowing from the original `hyper::Request`.
#[derive(Clone)]
struct InboundRequest {
    method: hyper::Method,
    path_and_query: String,
    headers: HeaderMap,
}

async fn forward(
    state: &ProxyState,
    inbound: &InboundRequest,
    body_bytes: Bytes,
    endpoint: BackendEndpoint,
) -> Result<Response<Body>, Error> {
    let uri: hyper::Uri = match format!(
        "{}{}",
        endpoint.url.trim_end_matches('/'),
        inbound.path_and_query
    )
    .parse()
    {
        Ok(uri) => uri,
        Err(_) => return Err(Error::InvalidUpstreamUri(endpoint.url.clone())),
    };

    let mut builder = Request::builder().method(inbound.method.clone()).uri(uri);
    for (name, value) in inbound.headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name, value);
    }
    if !inbound.headers.contains_key("x-request-id") {
        builder = builder.header("x-request-id", generate_request_id());
    }

    let outbound = builder
        .body(Body::from(body_bytes))
        .expect("filtered headers plus a json body is a well-formed request");

    let request_stats = state.request_stats.get(&endpoint.url);
    request_stats.start();
    let start = Instant::now();

    let permit = state
        .connect_limit(&endpoint.url)
        .acquire_owned()
        .await
        .expect("connect-limit semaphore is never closed");

    let upstream = match tokio::time::timeout(CONNECT_TIMEOUT, state.client.request(outbound)).await
    {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            request_stats.abort();
            state.metrics.upstream_connect_failures.inc();
            return Err(Error::UpstreamConnect(endpoint.url.clone(), e));
        }
        Err(_) => {
            request_stats.abort();
            state.metrics.upstream_connect_failures.inc();
            return Err(Error::UpstreamTimeout(endpoint.url.clone()));
        }
    };

    let (mut resp_parts, resp_body) = upstream.into_parts();
    strip_hop_by_hop(&mut resp_parts.headers);
    resp_parts.headers.insert(
        HeaderName::from_static("x-vllm-routed-to"),
        HeaderValue::from_str(&endpoint.url).unwrap_or_else(|_| HeaderValue::from_static("")),
    );

    let tracked_body = track_stats(
        resp_body,
        request_stats,
        state.metrics.client_aborted.clone(),
        start,
        permit,
    );
    Ok(Response::from_parts(resp_parts, tracked_body))
}

/// Wraps an upstream response body so the backend's request-stats entry
/// is finished on normal stream exhaustion and aborted if the stream is
/// dropped early (client disconnect) — the `FinishGuard` carries the
/// "which outcome" decision through `Drop` so both paths are correct
/// without buffering the body. Also holds the backend's connect permit
/// for the lifetime of the response so a held-open stream counts
/// against the connection cap until it actually closes.
fn track_stats(
    body: Body,
    stats: Arc<BackendRequestStats>,
    client_aborted: crate::stats::Counter,
    start: Instant,
    permit: OwnedSemaphorePermit,
) -> Body {
    let stream = async_stream::stream! {
        let mut body = body;
        let mut guard = FinishGuard::new(stats, client_aborted, start, permit);
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => yield Ok(bytes),
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        guard.mark_finished();
    };
    Body::wrap_stream(stream)
}

struct FinishGuard {
    stats: Option<Arc<BackendRequestStats>>,
    client_aborted: crate::stats::Counter,
    start: Instant,
    _permit: OwnedSemaphorePermit,
}

impl FinishGuard {
    fn new(
        stats: Arc<BackendRequestStats>,
        client_aborted: crate::stats::Counter,
        start: Instant,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        FinishGuard {
            stats: Some(stats),
            client_aborted,
            start,
            _permit: permit,
        }
    }

    fn mark_finished(&mut self) {
        if let Some(stats) = self.stats.take() {
            stats.finish(self.start.elapsed());
        }
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(stats) = self.stats.take() {
            stats.abort();
            self.client_aborted.inc();
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `req-<nanos>-<counter>`: unique without pulling in a uuid dependency.
fn generate_request_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let n = REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("req-{:x}-{:x}", nanos, n)
}

/// First `PREFIX_FINGERPRINT_CHARS` characters of the request's prompt
/// (or its chat messages joined), hashed with the same murmur3 family
/// `ring.rs` uses, for the prefix-affinity policy. Requests with
/// neither a `prompt` nor `messages` field have no fingerprint.
fn prefix_fingerprint(body: &Value) -> Option<String> {
    let text = if let Some(prompt) = body.get("prompt").and_then(Value::as_str) {
        prompt.to_string()
    } else if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        messages
            .iter()
            .filter_map(|m| m.get("content").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        return None;
    };
    if text.is_empty() {
        return None;
    }
    let prefix: String = text.chars().take(PREFIX_FINGERPRINT_CHARS).collect();
    let hash = murmur3::murmur3_32(&mut Cursor::new(prefix.as_bytes()), 0).ok()?;
    Some(format!("{:08x}", hash))
}

fn models_response(state: &ProxyState) -> Response<Body> {
    let data: Vec<Value> = state
        .registry
        .models()
        .into_iter()
        .map(|id| json!({"id": id, "object": "model"}))
        .collect();
    json_response(StatusCode::OK, &json!({"object": "list", "data": data}))
}

fn health_response(state: &ProxyState) -> Response<Body> {
    let mut body = json!({
        "status": "healthy",
        "time": chrono::Utc::now().to_rfc3339(),
    });
    if state.dynamic_config_enabled {
        let handle = state.handle.current();
        body["service_discovery"] = json!(handle.discovery_label);
        body["routing_logic"] = json!(handle.policy_label);
    }
    json_response(StatusCode::OK, &body)
}

fn metrics_response(state: &ProxyState) -> Response<Body> {
    match state.stats.prometheus_output() {
        Ok(buffer) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4")
            .body(Body::from(buffer))
            .expect("well-formed metrics response"),
        Err(e) => {
            warn!("failed to encode prometheus metrics: {}", e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .expect("well-formed error response")
        }
    }
}

fn not_found() -> Response<Body> {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({"error": {"message": "not found", "type": "not_found_error"}}),
    )
}

fn error_response(e: Error) -> Response<Body> {
    let status = e.status();
    let body = json!({"error": {"message": e.to_string(), "type": e.kind()}});
    json_response(status, &body)
}

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("well-formed json response")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::BackendSpec;
    use crate::discovery::StaticProvider;
    use crate::policy::round_robin::RoundRobin;
    use crate::policy::AnyPolicy;
    use crate::watcher::Handle;
    use std::collections::HashMap;

    fn test_state() -> Arc<ProxyState> {
        test_state_with_dynamic_config(true)
    }

    fn test_state_with_dynamic_config(dynamic_config_enabled: bool) -> Arc<ProxyState> {
        let registry = BackendRegistry::new();
        registry.publish(vec![BackendEndpoint::new("http://a", "m")]);
        let provider = Arc::new(StaticProvider::new(&[BackendSpec {
            url: "http://a".into(),
            model: "m".into(),
            model_type: "chat".into(),
            labels: HashMap::new(),
        }]));
        let handle = DynamicHandle::new(Handle {
            provider,
            policy: Arc::new(AnyPolicy::RoundRobin(RoundRobin::new())),
            session_key_header: None,
            discovery_label: "static",
            policy_label: "roundrobin",
        });
        let collector = Collector::default();
        let metrics = RouterMetrics::new(&collector).unwrap();
        Arc::new(ProxyState::new(
            registry,
            handle,
            RequestStatsTable::new(60),
            collector,
            metrics,
            256,
            vec![],
            dynamic_config_enabled,
        ))
    }

    #[test]
    fn hop_by_hop_headers_are_filtered() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
    }

    #[test]
    fn prefix_fingerprint_is_stable_for_the_same_prompt() {
        let a = json!({"prompt": "hello world"});
        let b = json!({"prompt": "hello world"});
        assert_eq!(prefix_fingerprint(&a), prefix_fingerprint(&b));
    }

    #[test]
    fn prefix_fingerprint_reads_chat_messages() {
        let body = json!({"messages": [{"role": "user", "content": "hi there"}]});
        assert!(prefix_fingerprint(&body).is_some());
    }

    #[test]
    fn prefix_fingerprint_none_without_prompt_or_messages() {
        let body = json!({"model": "m"});
        assert!(prefix_fingerprint(&body).is_none());
    }

    #[test]
    fn request_ids_are_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn missing_model_field_is_bad_request() {
        let state = test_state();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/v1/chat/completions")
            .body(Body::from("{}"))
            .unwrap();
        let err = proxy_inference(&state, req).await.unwrap_err();
        assert!(matches!(err, Error::MissingModel));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unserved_model_is_not_found() {
        let state = test_state();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/v1/chat/completions")
            .body(Body::from(r#"{"model":"unknown"}"#))
            .unwrap();
        let err = proxy_inference(&state, req).await.unwrap_err();
        assert!(matches!(err, Error::ModelNotServed(_)));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_json_body_is_bad_request() {
        let state = test_state();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/v1/chat/completions")
            .body(Body::from("not json"))
            .unwrap();
        let err = proxy_inference(&state, req).await.unwrap_err();
        assert!(matches!(err, Error::InvalidJson(_)));
    }

    #[test]
    fn models_response_reports_ok() {
        let state = test_state();
        let response = models_response(&state);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_response_reports_active_config_labels() {
        let state = test_state_with_dynamic_config(true);
        let response = health_response(&state);
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["service_discovery"], "static");
        assert_eq!(json["routing_logic"], "roundrobin");
    }

    #[tokio::test]
    async fn health_response_omits_config_labels_without_dynamic_config() {
        let state = test_state_with_dynamic_config(false);
        let response = health_response(&state);
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert!(json.get("service_discovery").is_none());
        assert!(json.get("routing_logic").is_none());
        assert_eq!(json["status"], "healthy");
    }

    #[test]
    fn not_found_for_unknown_route() {
        let response = not_found();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    /// Spawns a trivial backend bound to an ephemeral local port and
    /// returns its base URL. Used by the end-to-end dispatch tests
    /// below so `forward()` has a real socket to connect to rather
    /// than failing with `UpstreamConnect`.
    async fn spawn_mock_backend(
        respond: impl Fn() -> Response<Body> + Send + Sync + 'static,
    ) -> String {
        let respond = Arc::new(respond);
        let make_service = make_service_fn(move |_conn| {
            let respond = respond.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |_req| {
                    let respond = respond.clone();
                    async move { Ok::<_, Infallible>(respond()) }
                }))
            }
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_service);
        let addr = server.local_addr();
        tokio::spawn(server);
        format!("http://{}", addr)
    }

    /// Three equally weighted backends under round-robin, six requests:
    /// dispatch cycles through the lexicographically sorted URL order
    /// exactly twice regardless of discovery/registration order.
    #[tokio::test]
    async fn round_robin_dispatch_order_matches_sorted_urls_end_to_end() {
        let mut urls = Vec::new();
        for _ in 0..3 {
            urls.push(spawn_mock_backend(|| Response::new(Body::from("ok"))).await);
        }
        let mut sorted = urls.clone();
        sorted.sort();

        let registry = BackendRegistry::new();
        registry.publish(
            urls.iter()
                .map(|u| BackendEndpoint::new(u.clone(), "m"))
                .collect(),
        );
        let provider = Arc::new(StaticProvider::new(
            &urls
                .iter()
                .map(|u| BackendSpec {
                    url: u.clone(),
                    model: "m".into(),
                    model_type: "chat".into(),
                    labels: HashMap::new(),
                })
                .collect::<Vec<_>>(),
        ));
        let dynamic_handle = DynamicHandle::new(Handle {
            provider,
            policy: Arc::new(AnyPolicy::RoundRobin(RoundRobin::new())),
            session_key_header: None,
            discovery_label: "static",
            policy_label: "roundrobin",
        });
        let collector = Collector::default();
        let metrics = RouterMetrics::new(&collector).unwrap();
        let state = Arc::new(ProxyState::new(
            registry,
            dynamic_handle,
            RequestStatsTable::new(60),
            collector,
            metrics,
            256,
            vec![],
            true,
        ));

        let mut dispatch_order = Vec::new();
        for _ in 0..6 {
            let req = Request::builder()
                .method(Method::POST)
                .uri("/v1/chat/completions")
                .body(Body::from(r#"{"model":"m"}"#))
                .unwrap();
            let response = handle(state.clone(), req).await;
            assert_eq!(response.status(), StatusCode::OK);
            let routed_to = response
                .headers()
                .get("x-vllm-routed-to")
                .unwrap()
                .to_str()
                .unwrap()
                .to_string();
            dispatch_order.push(routed_to);
        }

        let expected: Vec<String> = sorted
            .iter()
            .cycle()
            .take(6)
            .cloned()
            .collect();
        assert_eq!(dispatch_order, expected);
    }

    /// The bytes the client receives equal the bytes the chosen
    /// backend sent, SSE framing preserved verbatim.
    #[tokio::test]
    async fn streaming_response_is_passed_through_byte_for_byte() {
        const SSE_BODY: &str =
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";
        let url = spawn_mock_backend(|| {
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from(SSE_BODY))
                .unwrap()
        })
        .await;

        let registry = BackendRegistry::new();
        registry.publish(vec![BackendEndpoint::new(url.clone(), "m")]);
        let provider = Arc::new(StaticProvider::new(&[BackendSpec {
            url: url.clone(),
            model: "m".into(),
            model_type: "chat".into(),
            labels: HashMap::new(),
        }]));
        let dynamic_handle = DynamicHandle::new(Handle {
            provider,
            policy: Arc::new(AnyPolicy::RoundRobin(RoundRobin::new())),
            session_key_header: None,
            discovery_label: "static",
            policy_label: "roundrobin",
        });
        let collector = Collector::default();
        let metrics = RouterMetrics::new(&collector).unwrap();
        let state = Arc::new(ProxyState::new(
            registry,
            dynamic_handle,
            RequestStatsTable::new(60),
            collector,
            metrics,
            256,
            vec![],
            true,
        ));

        let req = Request::builder()
            .method(Method::POST)
            .uri("/v1/chat/completions")
            .body(Body::from(r#"{"model":"m","stream":true}"#))
            .unwrap();
        let response = handle(state, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(body.as_ref(), SSE_BODY.as_bytes());
    }

    /// A backend with nothing listening fails the connect step;
    /// `upstream_connect_failures` reflects it and the scrape endpoint
    /// exposes it.
    #[tokio::test]
    async fn failed_upstream_connect_increments_router_metrics() {
        let registry = BackendRegistry::new();
        registry.publish(vec![BackendEndpoint::new("http://127.0.0.1:1", "m")]);
        let provider = Arc::new(StaticProvider::new(&[BackendSpec {
            url: "http://127.0.0.1:1".into(),
            model: "m".into(),
            model_type: "chat".into(),
            labels: HashMap::new(),
        }]));
        let dynamic_handle = DynamicHandle::new(Handle {
            provider,
            policy: Arc::new(AnyPolicy::RoundRobin(RoundRobin::new())),
            session_key_header: None,
            discovery_label: "static",
            policy_label: "roundrobin",
        });
        let collector = Collector::default();
        let metrics = RouterMetrics::new(&collector).unwrap();
        let state = Arc::new(ProxyState::new(
            registry,
            dynamic_handle,
            RequestStatsTable::new(60),
            collector,
            metrics.clone(),
            256,
            vec![],
            true,
        ));

        let req = Request::builder()
            .method(Method::POST)
            .uri("/v1/chat/completions")
            .body(Body::from(r#"{"model":"m"}"#))
            .unwrap();
        let response = handle(state, req).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(metrics.upstream_connect_failures.get(), 1.0);
    }

    /// The per-backend connect semaphore admits exactly
    /// `max_connections_per_backend` concurrent requests; an extra
    /// request waits for one of the in-flight slots to free up rather
    /// than being rejected.
    #[tokio::test]
    async fn connect_limit_bounds_concurrent_requests_per_backend() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let concurrent_for_backend = concurrent.clone();
        let peak_for_backend = peak.clone();
        let url = spawn_mock_backend(move || {
            let now = concurrent_for_backend.fetch_add(1, Ordering::SeqCst) + 1;
            peak_for_backend.fetch_max(now, Ordering::SeqCst);
            concurrent_for_backend.fetch_sub(1, Ordering::SeqCst);
            Response::new(Body::from("ok"))
        })
        .await;

        let registry = BackendRegistry::new();
        registry.publish(vec![BackendEndpoint::new(url.clone(), "m")]);
        let provider = Arc::new(StaticProvider::new(&[BackendSpec {
            url: url.clone(),
            model: "m".into(),
            model_type: "chat".into(),
            labels: HashMap::new(),
        }]));
        let dynamic_handle = DynamicHandle::new(Handle {
            provider,
            policy: Arc::new(AnyPolicy::RoundRobin(RoundRobin::new())),
            session_key_header: None,
            discovery_label: "static",
            policy_label: "roundrobin",
        });
        let collector = Collector::default();
        let metrics = RouterMetrics::new(&collector).unwrap();
        let state = Arc::new(ProxyState::new(
            registry,
            dynamic_handle,
            RequestStatsTable::new(60),
            collector,
            metrics,
            2,
            vec![],
            true,
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                let req = Request::builder()
                    .method(Method::POST)
                    .uri("/v1/chat/completions")
                    .body(Body::from(r#"{"model":"m"}"#))
                    .unwrap();
                handle(state, req).await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().status(), StatusCode::OK);
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
