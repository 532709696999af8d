//! VRAM Accountant admission/eviction throughput (C7).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use meridian_runtime::domain_types::{ModelId, Priority, VramMb};
use meridian_runtime::vram::{EvictionCandidate, VramAccountant};

fn bench_can_admit(c: &mut Criterion) {
    let accountant = VramAccountant::new(VramMb::try_new(32_000).unwrap());
    c.bench_function("vram_can_admit", |b| {
        b.iter(|| black_box(accountant.can_admit(VramMb::try_new(512).unwrap())));
    });
}

fn bench_reserve_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("vram_reserve_release");
    for model_count in [1, 10, 100].iter() {
        group.bench_with_input(
            BenchmarkId::new("cycle", model_count),
            model_count,
            |b, &model_count| {
                b.iter(|| {
                    let mut accountant = VramAccountant::new(VramMb::try_new(1_000_000).unwrap());
                    let models: Vec<ModelId> = (0..model_count)
                        .map(|i| ModelId::try_new(format!("model-{i}")).unwrap())
                        .collect();
                    for model in &models {
                        accountant.reserve(model, VramMb::try_new(64).unwrap()).unwrap();
                    }
                    for model in &models {
                        accountant.release(model).unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_select_eviction_victims(c: &mut Criterion) {
    let accountant = VramAccountant::new(VramMb::try_new(1_000).unwrap());
    let mut group = c.benchmark_group("vram_select_eviction_victims");
    for candidate_count in [10, 100, 1_000].iter() {
        let candidates: Vec<EvictionCandidate> = (0..*candidate_count)
            .map(|i| EvictionCandidate {
                model_id: ModelId::try_new(format!("model-{i}")).unwrap(),
                priority: Priority::try_new(u8::try_from(i % 50).unwrap()).unwrap(),
                last_used_at_ms: u64::try_from(i).unwrap(),
                reserved_mb: VramMb::try_new(10).unwrap(),
            })
            .collect();
        group.bench_with_input(
            BenchmarkId::new("candidates", candidate_count),
            &candidates,
            |b, candidates| {
                b.iter(|| {
                    black_box(accountant.select_eviction_victims(VramMb::try_new(500).unwrap(), candidates))
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_can_admit, bench_reserve_release, bench_select_eviction_victims);
criterion_main!(benches);
