//! Cross-Machine Router local-dispatch throughput (C9).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meridian_runtime::domain_types::{AgentName, RequestId};
use meridian_runtime::registry::{InMemoryRegistryBackend, ServiceRegistry};
use meridian_runtime::router::{CrossMachineRouter, RequestKind, RoutedRequest};
use meridian_runtime::time_provider::production_time_provider;
use meridian_runtime::transport::{RequestReply, TransportError};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

struct NeverCalledTransport;

#[async_trait]
impl RequestReply for NeverCalledTransport {
    async fn request(&self, _destination: &str, _payload: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        unreachable!("benchmark only exercises the local dispatch path")
    }
}

fn bench_local_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let router = rt.block_on(async {
        let registry = ServiceRegistry::new(
            Box::new(InMemoryRegistryBackend::new()),
            Duration::from_secs(30),
            production_time_provider(),
        );
        registry
            .register("asr".to_string(), "primary".to_string(), 9001, 10001, vec![])
            .await
            .unwrap();
        let router = CrossMachineRouter::new(
            "primary".to_string(),
            Arc::new(registry),
            Arc::new(NeverCalledTransport),
            None,
        );
        let (tx, mut rx) = mpsc::channel(4096);
        router.register_local_queue("asr", tx);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        router
    });

    c.bench_function("router_local_dispatch", |b| {
        b.to_async(&rt).iter(|| async {
            let request = RoutedRequest {
                request_id: RequestId::generate(),
                sender_name: AgentName::try_new("caller").unwrap(),
                destination: AgentName::try_new("asr").unwrap(),
                deadline: Duration::from_secs(1),
                kind: RequestKind::Idempotent,
                payload: vec![0u8; 64],
            };
            black_box(router.route(request).await.unwrap());
        });
    });
}

criterion_group!(benches, bench_local_dispatch);
criterion_main!(benches);
