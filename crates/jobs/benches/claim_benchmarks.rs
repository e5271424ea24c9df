use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use fhirq_core::{QueueType, TenantId};
use fhirq_jobs::{EnqueueRequest, InMemoryJobStore, JobStore, StaticLimits};
use serde_json::json;
use tokio::runtime::Runtime;

const TIMEOUT: Duration = Duration::from_secs(60);

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn seeded_store(jobs: usize, cap: Option<usize>) -> Arc<InMemoryJobStore> {
    let limits = match cap {
        Some(cap) => StaticLimits::new().with(QueueType::Export, cap),
        None => StaticLimits::new(),
    };
    let store = InMemoryJobStore::new(Arc::new(limits)).arc();
    let tenant = TenantId::new();
    let requests = (0..jobs)
        .map(|n| {
            EnqueueRequest::new(tenant, QueueType::Export, json!({ "n": n }))
                .with_priority((n % 3) as i32)
        })
        .collect();
    store.enqueue_batch(requests).await.unwrap();
    store
}

/// Claim + complete of one job against queues of growing depth.
fn bench_claim_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_latency");

    for depth in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let store = rt.block_on(seeded_store(depth, None));
            b.iter(|| {
                rt.block_on(async {
                    let claimed = store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap();
                    for job in claimed {
                        let token = job.run_token.unwrap();
                        store.complete(job.id, token, json!({})).await.unwrap();
                        // Keep the queue depth constant.
                        store
                            .enqueue(EnqueueRequest::new(job.tenant_id, QueueType::Export, json!({})))
                            .await
                            .unwrap();
                    }
                    black_box(());
                })
            });
        });
    }

    group.finish();
}

/// Draining a queue in batches of different sizes.
fn bench_batch_drain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("batch_drain");
    let jobs = 2_000usize;
    group.throughput(Throughput::Elements(jobs as u64));

    for batch in [1usize, 16, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || rt.block_on(seeded_store(jobs, None)),
                |store| {
                    rt.block_on(async {
                        loop {
                            let claimed = store
                                .acquire(&QueueType::Export, batch, TIMEOUT)
                                .await
                                .unwrap();
                            if claimed.is_empty() {
                                break;
                            }
                            for job in claimed {
                                let token = job.run_token.unwrap();
                                store.complete(job.id, token, json!({})).await.unwrap();
                            }
                        }
                    })
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Admission-capped acquire: the count of live jobs is part of every claim.
fn bench_capped_acquire(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("capped_acquire");

    group.bench_function("cap_reached", |b| {
        let store = rt.block_on(async {
            let store = seeded_store(1_000, Some(8)).await;
            store.acquire(&QueueType::Export, 8, TIMEOUT).await.unwrap();
            store
        });
        b.iter(|| {
            rt.block_on(async {
                let claimed = store.acquire(&QueueType::Export, 4, TIMEOUT).await.unwrap();
                black_box(claimed.len())
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_latency,
    bench_batch_drain,
    bench_capped_acquire
);
criterion_main!(benches);
