use criterion::{black_box, criterion_group, criterion_main, Criterion};

use llm_router::policy::round_robin::RoundRobin;
use llm_router::policy::session::Session;
use llm_router::policy::{Policy, RequestContext};
use llm_router::registry::BackendEndpoint;
use llm_router::ring::Ring;

fn endpoints(n: usize) -> Vec<BackendEndpoint> {
    (0..n)
        .map(|i| BackendEndpoint::new(format!("http://backend-{}", i), "m"))
        .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let candidates = endpoints(32);
    let ctx = RequestContext::default();

    let rr = RoundRobin::new();
    c.bench_function("round_robin choose (32 backends)", |b| {
        b.iter(|| rr.choose(black_box(&candidates), black_box(&ctx)).unwrap())
    });

    let session = Session::new();
    let session_ctx = RequestContext {
        session_key: Some("user-42"),
        prompt_prefix: None,
    };
    c.bench_function("session choose (32 backends, warm cache)", |b| {
        b.iter(|| {
            session
                .choose(black_box(&candidates), black_box(&session_ctx))
                .unwrap()
        })
    });

    let urls: Vec<String> = candidates.iter().map(|e| e.url.clone()).collect();
    c.bench_function("consistent hash ring build (32 backends)", |b| {
        b.iter(|| Ring::new(black_box(&urls)))
    });

    let ring = Ring::new(&urls);
    c.bench_function("consistent hash ring lookup", |b| {
        b.iter(|| ring.endpoint_for(black_box("user-42")))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
