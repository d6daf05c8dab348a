//! Performance benchmarks for pairing and relay

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ephemeral_chat::metrics::MetricsCollector;
use ephemeral_chat::pairing::{
    Connection, EngineConfig, FirstEligiblePairSelector, PairSelector, PairingEngine, Placement,
};
use std::sync::Arc;

fn create_bench_engine() -> PairingEngine {
    PairingEngine::new(
        EngineConfig::default(),
        Arc::new(MetricsCollector::new().unwrap()),
    )
}

fn bench_pair_selection(c: &mut Criterion) {
    let selector = FirstEligiblePairSelector::new();
    let mut group = c.benchmark_group("pair_selection");

    for size in [100usize, 1_000, 10_000] {
        let waiting: Vec<String> = (0..size).map(|i| format!("participant_{}", i)).collect();
        // Only the last two entries are eligible: worst case scan
        let eligible_from = size - 2;

        group.bench_with_input(BenchmarkId::from_parameter(size), &waiting, |b, waiting| {
            b.iter(|| {
                black_box(selector.select_pair(waiting, &|id| {
                    id.trim_start_matches("participant_")
                        .parse::<usize>()
                        .map(|i| i >= eligible_from)
                        .unwrap_or(false)
                }))
            })
        });
    }

    group.finish();
}

fn bench_connect_and_pair(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("connect_and_pair_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let engine = create_bench_engine();
                let mut receivers = Vec::with_capacity(1000);

                for i in 0..1000 {
                    let (connection, rx) = Connection::channel();
                    engine
                        .connect(&format!("participant_{}", i), connection)
                        .unwrap();
                    receivers.push(rx);
                }

                engine.shutdown().unwrap();
                black_box(engine.get_stats().unwrap())
            })
        })
    });
}

fn bench_relay(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = create_bench_engine();

    let (a, mut rx_a) = Connection::channel();
    let (b, mut rx_b) = Connection::channel();
    let conversation_id = rt.block_on(async {
        engine.connect("a", a).unwrap();
        engine.connect("b", b).unwrap();
        match engine.placement_of("a").unwrap() {
            Placement::InConversation(id) => id,
            other => panic!("not paired: {:?}", other),
        }
    });

    c.bench_function("relay_chat", |bench| {
        bench.iter(|| {
            let outcome = engine
                .relay_chat("a", conversation_id, "hello there")
                .unwrap();
            while rx_b.try_recv().is_ok() {}
            black_box(outcome)
        })
    });

    while rx_a.try_recv().is_ok() {}
    rt.block_on(async { engine.shutdown().unwrap() });
}

criterion_group!(
    benches,
    bench_pair_selection,
    bench_connect_and_pair,
    bench_relay
);
criterion_main!(benches);
