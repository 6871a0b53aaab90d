use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use tenantgate_core::{StaticTenant, TenantId};
use tenantgate_infra::{
    BackoffPolicy, ClaimConfig, ClaimEngine, InMemoryBackend, NamingConvention, Record, TableDescriptor,
    TenantScopedStore,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Task {
    id: Option<i64>,
    tenant_id: TenantId,
    status: String,
    attempts: i32,
    created_at: DateTime<Utc>,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl Record for Task {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new(
            "tasks",
            ["id", "tenantId", "status", "attempts", "createdAt", "nextAttemptAt"],
        )
        .with_convention(NamingConvention::SnakeCase)
        .with_tenant_field("tenantId")
    }
}

type Engine = ClaimEngine<Task, Arc<InMemoryBackend>>;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("tokio runtime")
}

/// A fresh table with `rows` pending tasks for one tenant, plus a noisy
/// neighbour tenant with the same number of rows.
fn seeded_engine(rt: &Runtime, rows: usize) -> Engine {
    let backend = Arc::new(InMemoryBackend::new());
    let tenant = TenantId::new();
    let base = Utc::now() - ChronoDuration::hours(1);
    let tasks: Vec<Task> = (0..rows)
        .map(|i| Task {
            id: None,
            tenant_id: tenant,
            status: "PENDING".into(),
            attempts: 0,
            created_at: base + ChronoDuration::milliseconds(i as i64),
            next_attempt_at: None,
        })
        .collect();

    for owner in [tenant, TenantId::new()] {
        let store = TenantScopedStore::new(backend.clone(), StaticTenant::new(owner)).expect("store");
        rt.block_on(store.save_all(&tasks)).expect("seed");
    }

    let store = TenantScopedStore::new(backend, StaticTenant::new(tenant)).expect("store");
    let config = ClaimConfig::new("status", "PENDING", "IN_PROGRESS", "createdAt", "nextAttemptAt");
    ClaimEngine::new(store, config).expect("engine")
}

fn bench_claim_drain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_drain");

    for rows in [100usize, 1_000] {
        for batch in [10u64, 100] {
            group.throughput(Throughput::Elements(rows as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("batch_{batch}"), rows),
                &rows,
                |b, &rows| {
                    b.iter_batched(
                        || seeded_engine(&rt, rows),
                        |engine| {
                            rt.block_on(async {
                                let mut claimed = 0;
                                loop {
                                    let got = engine.claim_batch(batch).await.expect("claim");
                                    if got.is_empty() {
                                        break;
                                    }
                                    claimed += got.len();
                                }
                                black_box(claimed)
                            })
                        },
                        BatchSize::LargeInput,
                    );
                },
            );
        }
    }

    group.finish();
}

fn bench_mark_failure(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("mark_failure");
    group.throughput(Throughput::Elements(1));

    group.bench_function("reschedule_claimed_row", |b| {
        b.iter_batched(
            || {
                let engine = seeded_engine(&rt, 1);
                let id = rt
                    .block_on(engine.claim_batch(1))
                    .expect("claim")
                    .into_records()
                    .first()
                    .and_then(|t| t.id)
                    .expect("seeded row");
                (engine, id)
            },
            |(engine, id)| rt.block_on(engine.mark_failure(id, 3)).expect("mark failure"),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(3600));
    c.bench_function("backoff_delay_for_0_to_64", |b| {
        b.iter(|| {
            (0..=64u32)
                .map(|attempt| policy.delay_for(black_box(attempt)))
                .max()
        })
    });
}

criterion_group!(benches, bench_claim_drain, bench_mark_failure, bench_backoff);
criterion_main!(benches);
