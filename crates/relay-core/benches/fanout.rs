//! Broadcast fan-out benchmarks for relay-core.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tenvis_relay_core::{ChannelBroadcastServer, ConnectionHandle, NoopHooks, Outgoing, ServerConfig};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;

fn setup(rt: &Runtime, subscribers: usize) -> (ChannelBroadcastServer, Vec<UnboundedReceiver<Outgoing>>) {
    let _guard = rt.enter();
    let config = ServerConfig {
        max_subscriptions_per_connection: 0,
        ..ServerConfig::default()
    };
    let server = ChannelBroadcastServer::new(config, Arc::new(NoopHooks));

    let mut receivers = Vec::with_capacity(subscribers);
    for i in 0..subscribers {
        let (handle, rx) = ConnectionHandle::new(format!("bench-{i}"));
        server.handle_connect(handle.clone());
        rt.block_on(server.handle_message(&handle, r#"{"subscribe":["ticker"]}"#));
        receivers.push(rx);
    }
    (server, receivers)
}

fn bench_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let payload: Arc<str> = Arc::from(r#"{"channel":"ticker","data":{"price":42000.5}}"#);

    let mut group = c.benchmark_group("broadcast");
    for subscribers in [10usize, 100, 1_000] {
        let (server, mut receivers) = setup(&rt, subscribers);
        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    let sent = server.broadcast(black_box("ticker"), Arc::clone(&payload));
                    for rx in &mut receivers {
                        while rx.try_recv().is_ok() {}
                    }
                    sent
                })
            },
        );
    }
    group.finish();
}

fn bench_subscribe_churn(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (server, _receivers) = setup(&rt, 0);
    let (handle, _rx) = ConnectionHandle::new("churn");
    server.handle_connect(handle.clone());

    c.bench_function("subscribe_unsubscribe", |b| {
        b.iter(|| {
            rt.block_on(server.handle_message(&handle, r#"{"subscribe":["hot"]}"#));
            rt.block_on(server.handle_message(&handle, r#"{"unsubscribe":["hot"]}"#));
        })
    });
}

criterion_group!(benches, bench_broadcast, bench_subscribe_churn);
criterion_main!(benches);
