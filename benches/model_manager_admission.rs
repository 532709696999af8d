//! Model Manager load/unload/infer throughput against the in-process
//! backend adapter (C8).

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meridian_runtime::domain_types::{ModelId, Priority, VramMb};
use meridian_runtime::model_manager::adapters::InprocGgufAdapter;
use meridian_runtime::model_manager::ModelManagerHandle;
use meridian_runtime::time_provider::production_time_provider;
use tokio::runtime::Runtime;

fn manager() -> ModelManagerHandle {
    ModelManagerHandle::new(
        VramMb::try_new(64_000).unwrap(),
        Arc::new(InprocGgufAdapter),
        production_time_provider(),
        Duration::from_millis(50),
        Duration::from_secs(3600),
    )
}

fn bench_load_unload_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let manager = manager();
    let model_id = ModelId::try_new("bench-model").unwrap();

    c.bench_function("model_manager_load_unload_cycle", |b| {
        b.to_async(&rt).iter(|| async {
            manager
                .load_model(
                    &model_id,
                    serde_json::Value::Null,
                    VramMb::try_new(1_024).unwrap(),
                    Priority::default(),
                )
                .await
                .unwrap();
            black_box(manager.unload_model(&model_id).await.unwrap());
        });
    });
}

fn bench_infer_on_loaded_model(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let manager = manager();
    let model_id = ModelId::try_new("bench-model-loaded").unwrap();
    rt.block_on(async {
        manager
            .load_model(
                &model_id,
                serde_json::Value::Null,
                VramMb::try_new(1_024).unwrap(),
                Priority::default(),
            )
            .await
            .unwrap();
    });

    c.bench_function("model_manager_infer_hot_path", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(manager.infer(&model_id, serde_json::json!({"prompt": "hi"})).await.unwrap());
        });
    });
}

criterion_group!(benches, bench_load_unload_cycle, bench_infer_on_loaded_model);
criterion_main!(benches);
