use criterion::{black_box, criterion_group, criterion_main, Criterion};

use trendd::config::StatisticConfig;
use trendd::model::fingerprint::FingerprintRecord;
use trendd::model::InputStats;
use trendd::service::StatisticService;

fn sample_input(id: u32, fp: u32) -> InputStats {
    InputStats {
        fingerprint: format!("fp{fp}"),
        views: vec![id.to_string(), (id + 1).to_string()],
        clicks: vec![id.to_string()],
        channel: String::new(),
    }
}

fn bench_ingest_submit(c: &mut Criterion) {
    let service = StatisticService::new(&StatisticConfig::default());
    let input = sample_input(42, 1);

    c.bench_function("ingest_submit", |b| {
        b.iter(|| {
            service.add_stats(black_box(input.clone()));
        });
    });
}

fn bench_aggregate_batch(c: &mut Criterion) {
    let service = StatisticService::new(&StatisticConfig::default());

    c.bench_function("aggregate_4k_events", |b| {
        b.iter(|| {
            for i in 0..4096u32 {
                service.add_stats(sample_input(i % 512, i % 64));
            }
            black_box(service.aggregate_stats());
        });
    });
}

fn bench_fingerprint_get_data(c: &mut Criterion) {
    let record = FingerprintRecord::new();
    let ids: Vec<String> = (0..10_000u32).map(|i| i.to_string()).collect();
    record.inc_stats(
        &InputStats {
            views: ids.clone(),
            clicks: ids[..100].to_vec(),
            ..InputStats::default()
        },
        -1,
        10,
    );

    c.bench_function("fingerprint_get_data_10k", |b| {
        b.iter(|| {
            black_box(record.get_data());
        });
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let service = StatisticService::new(&StatisticConfig::default());
    for i in 0..20_000u32 {
        service.add_stats(sample_input(i % 4096, i % 256));
    }
    service.aggregate_stats();

    c.bench_function("snapshot_encode_v5", |b| {
        b.iter(|| {
            black_box(service.encode_v5().expect("encode"));
        });
    });
}

criterion_group!(
    benches,
    bench_ingest_submit,
    bench_aggregate_batch,
    bench_fingerprint_get_data,
    bench_snapshot_encode,
);
criterion_main!(benches);
