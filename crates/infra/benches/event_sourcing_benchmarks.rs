use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde::{Deserialize, Serialize};
use serde_json::json;

use memkit_core::{Context, Identifiable, OnePhaseCommit};
use memkit_events::Event;
use memkit_infra::event_log::{EventLog, EventLogOptions};
use memkit_infra::kv::KvStore;
use memkit_infra::repository::{EventLogRepository, Repository};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Item {
    id: String,
    name: String,
    quantity: i64,
}

impl Identifiable for Item {
    type Id = String;

    fn id(&self) -> Option<String> {
        (!self.id.is_empty()).then(|| self.id.clone())
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

fn item(n: usize) -> Item {
    Item {
        id: format!("item-{n}"),
        name: format!("Item {n}"),
        quantity: 0,
    }
}

/// Traces are off so the numbers measure the log, not backtrace capture.
fn quiet_log() -> EventLog {
    EventLog::with_options(EventLogOptions::default().with_capture_traces(false))
}

/// Repository holding `count` items, each updated once.
fn populated(count: usize) -> EventLogRepository<Item> {
    let ctx = Context::background();
    let repo = EventLogRepository::new(quiet_log());
    for n in 0..count {
        let mut entity = item(n);
        repo.create(&ctx, &mut entity).unwrap();
        entity.quantity = 1;
        repo.update(&ctx, &entity).unwrap();
    }
    repo
}

fn bench_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_append_throughput");

    for batch_size in [1usize, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("root_append", batch_size),
            batch_size,
            |b, &size| {
                let ctx = Context::background();
                b.iter(|| {
                    let log = quiet_log();
                    for n in 0..size {
                        log.append(&ctx, Event::opaque("tick", json!(n))).unwrap();
                    }
                    black_box(log.len())
                });
            },
        );
        group.bench_with_input(
            BenchmarkId::new("transactional_append", batch_size),
            batch_size,
            |b, &size| {
                let ctx = Context::background();
                b.iter(|| {
                    let log = quiet_log();
                    let tx_ctx = log.begin_tx(&ctx).unwrap();
                    for n in 0..size {
                        log.append(&tx_ctx, Event::opaque("tick", json!(n))).unwrap();
                    }
                    log.commit_tx(&tx_ctx).unwrap();
                    black_box(log.len())
                });
            },
        );
    }

    group.finish();
}

fn bench_projection_rebuild_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection_rebuild_speed");

    for entity_count in [10usize, 100, 1000].iter() {
        let repo = populated(*entity_count);
        let ctx = Context::background();
        group.throughput(Throughput::Elements(repo.log().len() as u64));
        group.bench_with_input(
            BenchmarkId::new("view_from_events", entity_count),
            entity_count,
            |b, _| {
                b.iter(|| black_box(repo.view(&ctx).unwrap().len()));
            },
        );
    }

    group.finish();
}

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression");
    group.sample_size(20);

    for entity_count in [100usize, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::new("compress_then_view", entity_count),
            entity_count,
            |b, &count| {
                let ctx = Context::background();
                b.iter(|| {
                    let repo = populated(count);
                    repo.compress();
                    black_box(repo.view(&ctx).unwrap().len())
                });
            },
        );
    }

    group.finish();
}

fn bench_event_log_vs_kv(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_log_vs_kv");

    group.bench_function("repository_create_and_update", |b| {
        let ctx = Context::background();
        b.iter(|| {
            let repo = EventLogRepository::<Item>::new(quiet_log());
            for n in 0..10 {
                let mut entity = item(n);
                repo.create(&ctx, &mut entity).unwrap();
                entity.quantity += 5;
                repo.update(&ctx, &entity).unwrap();
            }
            black_box(repo.log().len())
        });
    });

    group.bench_function("kv_set_and_overwrite", |b| {
        let ctx = Context::background();
        b.iter(|| {
            let kv = KvStore::<Item>::new();
            for n in 0..10 {
                let mut entity = item(n);
                kv.set(&ctx, "items", entity.id.clone(), entity.clone()).unwrap();
                entity.quantity += 5;
                kv.set(&ctx, "items", entity.id.clone(), entity).unwrap();
            }
            black_box(kv.all(&ctx, "items").unwrap().len())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_append_throughput,
    bench_projection_rebuild_speed,
    bench_compression,
    bench_event_log_vs_kv
);
criterion_main!(benches);
