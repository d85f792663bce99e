use async_trait::async_trait;
use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use realtime_bridge::registry::{
    ConnectionRegistry, OutboundMessage, SessionTransport, TransportError,
};
use serde_json::json;
use std::sync::Arc;

/// Discards frames; isolates registry overhead from transport cost.
struct NullTransport;

#[async_trait]
impl SessionTransport for NullTransport {
    async fn write_frame(&mut self, _frame: Bytes) -> Result<(), TransportError> {
        Ok(())
    }
}

fn fanout_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("broadcast_fanout");

    for sessions in [1usize, 16, 256].iter() {
        let registry = Arc::new(ConnectionRegistry::new());
        for n in 0..*sessions {
            registry.register(format!("session-{}", n), NullTransport);
        }
        let message = OutboundMessage::new("chat.message", json!({"text": "hi"}));

        group.throughput(Throughput::Elements(*sessions as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(sessions),
            &registry,
            |b, registry| {
                b.to_async(&runtime).iter(|| {
                    let registry = Arc::clone(registry);
                    let message = message.clone();
                    async move { registry.broadcast(&message).await }
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, fanout_benchmark);
criterion_main!(benches);
